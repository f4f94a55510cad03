//! Event notification.
//!
//! Notifications are fire-and-forget: the engine sends them after a commit
//! and only logs delivery failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::definition::EventKind;
use crate::error::{EngineError, EngineResult};

/// One engine event addressed to a set of users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub event: EventKind,
    pub instance_id: Uuid,
    pub definition_id: String,
    pub step_id: String,
    pub actor_id: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> EngineResult<()>;
}

/// Forwards events into an mpsc channel. Used by tests and by embedders
/// that fan events out themselves.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: NotificationEvent) -> EngineResult<()> {
        self.tx
            .send(event)
            .map_err(|_| EngineError::Internal("notification channel closed".to_string()))
    }
}

/// Logs events and delivers nothing. The default when no NATS URL is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: NotificationEvent) -> EngineResult<()> {
        tracing::info!(
            event = %event.event,
            instance_id = %event.instance_id,
            step = %event.step_id,
            recipients = ?event.recipients,
            "Work-order event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let event = NotificationEvent {
            event: EventKind::Created,
            instance_id: Uuid::new_v4(),
            definition_id: "expense".to_string(),
            step_id: "start".to_string(),
            actor_id: "alice".to_string(),
            recipients: vec!["alice".to_string()],
        };
        notifier.notify(event.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);

        drop(rx);
        assert!(notifier.notify(event).await.is_err());
    }
}
