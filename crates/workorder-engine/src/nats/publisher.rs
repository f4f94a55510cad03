//! NATS event publisher.
//!
//! Each engine event is published as JSON to `<prefix>.<event>`, e.g.
//! `workorder.events.approved`, on a JetStream stream covering
//! `<prefix>.>`.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use thiserror::Error;

use crate::error::{EngineError, EngineResult};
use crate::notify::{NotificationEvent, Notifier};

/// Default subject prefix for engine events.
pub const DEFAULT_SUBJECT_PREFIX: &str = "workorder.events";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "workorder_events";

#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

impl From<NatsError> for EngineError {
    fn from(err: NatsError) -> Self {
        EngineError::Nats(err.to_string())
    }
}

/// JetStream publisher implementing [`Notifier`].
#[derive(Clone)]
pub struct NatsNotifier {
    js: Context,
    prefix: String,
}

impl NatsNotifier {
    /// Connect to `url` and make sure the event stream exists.
    pub async fn connect(url: &str, prefix: Option<&str>) -> Result<Self, NatsError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| NatsError::Connection(e.to_string()))?;
        tracing::info!(url = %url, "Connected to NATS");
        Self::new(client, prefix, None).await
    }

    pub async fn new(
        client: async_nats::Client,
        prefix: Option<&str>,
        stream_name: Option<&str>,
    ) -> Result<Self, NatsError> {
        let prefix = prefix.unwrap_or(DEFAULT_SUBJECT_PREFIX).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);
        let js = jetstream::new(client);

        Self::ensure_stream(&js, stream, &prefix).await?;

        Ok(Self { js, prefix })
    }

    async fn ensure_stream(js: &Context, stream: &str, prefix: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![format!("{}.>", prefix)],
                    max_age: std::time::Duration::from_secs(7 * 24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, prefix = %prefix, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub fn subject_for(&self, event: &NotificationEvent) -> String {
        subject(&self.prefix, event)
    }
}

fn subject(prefix: &str, event: &NotificationEvent) -> String {
    format!("{}.{}", prefix, event.event)
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn notify(&self, event: NotificationEvent) -> EngineResult<()> {
        let payload = serde_json::to_vec(&event)?;
        let subject = self.subject_for(&event);

        self.js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            subject = %subject,
            instance_id = %event.instance_id,
            step = %event.step_id,
            "Published work-order event"
        );

        Ok(())
    }
}
