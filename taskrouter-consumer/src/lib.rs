//! # TaskRouter Consumer
//!
//! Priority-aware consumer pool. One logical consumer per destination,
//! each with its own channel, prefetch, concurrency, and retry discipline;
//! handlers receive a typed parameter projection and terminal outcomes
//! feed the training reporter.
//!
//! Components:
//!
//! - [`handlers`] — the `TaskHandler` trait, registry, and
//!   destination-specific invocation wrappers
//! - [`worker::DestinationConsumer`] — per-destination delivery pipeline
//! - [`pool::ConsumerPool`] — spawns and supervises the six consumers
//! - [`training::TrainingReporter`] — best-effort outcome feedback

pub mod handlers;
pub mod pool;
pub mod training;
pub mod web;
pub mod worker;

pub use handlers::{HandlerRegistry, TaskHandler};
pub use pool::ConsumerPool;
pub use training::TrainingReporter;
