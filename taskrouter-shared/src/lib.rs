//! # TaskRouter Shared
//!
//! Shared foundation for the taskrouter system: the wire data model (tasks,
//! features, predictions), the closed destination catalog, the pure routing
//! engine, AMQP broker plumbing (topology, headers, trace-context codec),
//! typed configuration, Prometheus metric handles, and the tracing/OTLP
//! bootstrap.
//!
//! Role crates (`taskrouter-producer`, `taskrouter-consumer`) build their
//! publish and consume pipelines on top of this crate; nothing in here
//! performs business logic on its own.

pub mod config;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod prediction;
pub mod routing;

pub use errors::{TaskRouterError, TaskRouterResult};
pub use models::destination::Destination;
pub use models::task::{Task, TaskType};
