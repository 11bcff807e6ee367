//! AMQP plumbing shared by both roles: error taxonomy, broker connection
//! and topology management, and the wire header codec (including W3C trace
//! context propagation across the broker hop).

pub mod broker;
pub mod errors;
pub mod headers;

pub use broker::RabbitBroker;
pub use errors::MessagingError;
pub use headers::MessageHeaders;
