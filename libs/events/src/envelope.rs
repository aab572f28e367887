//! Event envelope - the common wrapper for published events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DomainEvent, EventError};

/// The event envelope - common metadata for all published events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Unique, time-ordered message identifier.
    pub message_id: Uuid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g., "server.updated").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// The manager instance that produced the event.
    pub source: String,

    /// Grouping ID for events produced by the same job run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific payload.
    pub payload: P,
}

impl EventEnvelope<DomainEvent> {
    /// Wraps a domain event, deriving type and version from the event.
    pub fn wrap(
        event: DomainEvent,
        source: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        EventEnvelope {
            message_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event_type: event.event_type().to_string(),
            event_version: event.event_version(),
            source: source.into(),
            correlation_id,
            payload: event,
        }
    }

    /// Serializes the envelope to the JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}
