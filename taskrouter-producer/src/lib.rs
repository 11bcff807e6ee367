//! # TaskRouter Producer
//!
//! Publisher side of the taskrouter system. Accepts task submissions,
//! enriches them with predictions from the prediction service, routes them
//! through the pure routing engine, and publishes onto the priority
//! topology with full wire headers and trace context.
//!
//! Components:
//!
//! - [`prediction::PredictionClient`] — synchronous request/response client
//!   with health gating, per-call timeout, and batch support
//! - [`publisher::TaskPublisher`] — the enrich/route/publish pipeline
//! - [`auto_task::AutoTaskSupervisor`] — supervised demo-task generator
//! - [`web`] — the thin submission and observability surface

pub mod auto_task;
pub mod prediction;
pub mod publisher;
pub mod testing;
pub mod web;

pub use prediction::{PredictionClient, PredictionOutcome};
pub use publisher::TaskPublisher;
