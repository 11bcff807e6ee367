//! # Typed Parameter Projection
//!
//! Tasks carry an untyped `string -> JSON` parameter map on the wire. At
//! the consumer boundary that map is projected into a typed per-task-type
//! view; handlers only ever see the projection. Unknown keys are ignored,
//! missing keys fall back to defaults, and a value of the wrong shape is a
//! projection error (which the worker treats as a handler failure, subject
//! to the normal retry budget).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::task::TaskType;
use crate::errors::{TaskRouterError, TaskRouterResult};

/// Parameters for email notification tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailParameters {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Parameters for report generation tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportParameters {
    #[serde(default)]
    pub report_kind: String,
    #[serde(default)]
    pub period_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

/// Parameters for bulk data tasks (processing, export, backup).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataParameters {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Parameters for image processing tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageParameters {
    #[serde(default)]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

/// Parameters for web scraping tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapingParameters {
    #[serde(default)]
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

/// Parameters for system maintenance tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceParameters {
    #[serde(default)]
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// Typed per-task-type view over the wire parameter map.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedParameters {
    DataProcessing(DataParameters),
    ReportGeneration(ReportParameters),
    EmailNotification(EmailParameters),
    ImageProcessing(ImageParameters),
    DataExport(DataParameters),
    WebScraping(ScrapingParameters),
    DataBackup(DataParameters),
    SystemMaintenance(MaintenanceParameters),
}

impl TypedParameters {
    /// Project the untyped map into the task type's view.
    pub fn project(
        task_type: TaskType,
        parameters: &HashMap<String, serde_json::Value>,
    ) -> TaskRouterResult<TypedParameters> {
        let value = serde_json::Value::Object(
            parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let projected = match task_type {
            TaskType::DataProcessing => TypedParameters::DataProcessing(decode(task_type, value)?),
            TaskType::ReportGeneration => {
                TypedParameters::ReportGeneration(decode(task_type, value)?)
            }
            TaskType::EmailNotification => {
                TypedParameters::EmailNotification(decode(task_type, value)?)
            }
            TaskType::ImageProcessing => TypedParameters::ImageProcessing(decode(task_type, value)?),
            TaskType::DataExport => TypedParameters::DataExport(decode(task_type, value)?),
            TaskType::WebScraping => TypedParameters::WebScraping(decode(task_type, value)?),
            TaskType::DataBackup => TypedParameters::DataBackup(decode(task_type, value)?),
            TaskType::SystemMaintenance => {
                TypedParameters::SystemMaintenance(decode(task_type, value)?)
            }
        };
        Ok(projected)
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    task_type: TaskType,
    value: serde_json::Value,
) -> TaskRouterResult<T> {
    serde_json::from_value(value).map_err(|e| {
        TaskRouterError::Validation(format!(
            "Parameter projection failed for {task_type}: {e}"
        ))
    })
}
