//! Event publisher boundary.
//!
//! Publishing is fire-and-forget: a failed publish is reported to the
//! caller for logging, never retried, and never rolls back the state change
//! the event describes.

use areaplane_events::{DomainEvent, EventEnvelope, EventError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] EventError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Publish-only contract to the pub/sub transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope<DomainEvent>,
    ) -> Result<(), PublishError>;
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope<DomainEvent>,
    ) -> Result<(), PublishError> {
        let body = envelope.to_json()?;
        info!(
            topic,
            event_type = %envelope.event_type,
            message_id = %envelope.message_id,
            payload = %String::from_utf8_lossy(&body),
            "Published event"
        );
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<(String, EventEnvelope<DomainEvent>)>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, EventEnvelope<DomainEvent>)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope<DomainEvent>,
    ) -> Result<(), PublishError> {
        // No subscribers is not an error.
        match self.sender.send((topic.to_string(), envelope.clone())) {
            Ok(receivers) => debug!(topic, receivers, "Broadcast event"),
            Err(_) => debug!(topic, "Broadcast event without subscribers"),
        }
        Ok(())
    }
}

#[cfg(feature = "nats")]
pub use nats::NatsPublisher;

#[cfg(feature = "nats")]
mod nats {
    use super::*;

    /// Publishes to `<prefix>.<topic>` on a NATS server.
    #[derive(Clone)]
    pub struct NatsPublisher {
        client: async_nats::Client,
        subject_prefix: String,
    }

    impl NatsPublisher {
        pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self, PublishError> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))?;
            info!(url, "Connected to NATS");
            Ok(Self {
                client,
                subject_prefix: subject_prefix.into(),
            })
        }
    }

    #[async_trait]
    impl EventPublisher for NatsPublisher {
        async fn publish(
            &self,
            topic: &str,
            envelope: &EventEnvelope<DomainEvent>,
        ) -> Result<(), PublishError> {
            let subject = format!("{}.{}", self.subject_prefix, topic);
            let payload = envelope.to_json()?;
            self.client
                .publish(subject.clone(), payload.into())
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))?;
            debug!(subject = %subject, "Published event to NATS");
            Ok(())
        }
    }
}
