//! Prediction service client. The wire contract lives in
//! `taskrouter_shared::prediction`; this module adds the HTTP client and
//! its health gate.

pub mod client;

pub use client::{PredictionClient, SystemObservations};
pub use taskrouter_shared::prediction as types;
pub use taskrouter_shared::prediction::{PredictionKind, PredictionOutcome};
