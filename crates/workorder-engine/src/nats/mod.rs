//! NATS JetStream integration.
//!
//! Publishes engine events for downstream consumers (mailers, chat bots).

pub mod publisher;

pub use publisher::{NatsError, NatsNotifier};
