//! Event type definitions for the world model.
//!
//! Each event type has a corresponding payload struct with the event-specific data.

use std::collections::BTreeSet;
use std::net::IpAddr;

use areaplane_id::{AreaId, RegionId, ServerId, Version};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const SERVER_UPDATED: &str = "server.updated";
    pub const WORLD_UPDATED: &str = "world.updated";
}

/// Topics events are published to.
pub mod topics {
    /// The single broadcast topic every domain event goes to.
    pub const EVENTS: &str = "events";
}

// =============================================================================
// Server Events
// =============================================================================

/// Payload for `server.updated`.
///
/// Emitted whenever allocation, a server start notification or a task
/// refresh changed any field of a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdatedPayload {
    pub server_id: ServerId,
    pub version: Version,
    pub region_id: RegionId,
    pub area_ids: Vec<AreaId>,
    pub area_indexes: Vec<i32>,
    pub enabled: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_web_socket_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket_url: Option<String>,
}

// =============================================================================
// World Events
// =============================================================================

/// Payload for `world.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldUpdatedPayload {
    pub version: Version,
    pub manager_hosts: BTreeSet<IpAddr>,
    pub kiosk_hosts: BTreeSet<IpAddr>,
}

// =============================================================================
// Domain Event
// =============================================================================

/// A change to the world model worth telling subscribers about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ServerUpdated(ServerUpdatedPayload),
    WorldUpdated(WorldUpdatedPayload),
}

impl DomainEvent {
    /// The dotted event type name, e.g. `server.updated`.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ServerUpdated(_) => event_types::SERVER_UPDATED,
            DomainEvent::WorldUpdated(_) => event_types::WORLD_UPDATED,
        }
    }

    /// Schema version of the payload.
    pub fn event_version(&self) -> i32 {
        1
    }

    /// The server this event is about, if any.
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            DomainEvent::ServerUpdated(payload) => Some(payload.server_id),
            DomainEvent::WorldUpdated(_) => None,
        }
    }
}

impl From<ServerUpdatedPayload> for DomainEvent {
    fn from(payload: ServerUpdatedPayload) -> Self {
        DomainEvent::ServerUpdated(payload)
    }
}

impl From<WorldUpdatedPayload> for DomainEvent {
    fn from(payload: WorldUpdatedPayload) -> Self {
        DomainEvent::WorldUpdated(payload)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn server_payload() -> ServerUpdatedPayload {
        ServerUpdatedPayload {
            server_id: ServerId::new(3),
            version: Version::new(2),
            region_id: RegionId::new(1),
            area_ids: vec![AreaId::new(10)],
            area_indexes: vec![0],
            enabled: true,
            active: false,
            public_ip: None,
            public_web_socket_port: None,
            web_socket_url: None,
        }
    }

    #[test]
    fn test_server_updated_serialization() {
        let event = DomainEvent::from(server_payload());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "server_updated");
        assert_eq!(json["server_id"], 3);
        assert_eq!(json["area_indexes"], serde_json::json!([0]));
        assert!(json.get("public_ip").is_none());
    }

    #[test]
    fn test_world_updated_hosts_sorted() {
        let payload = WorldUpdatedPayload {
            version: Version::new(1),
            manager_hosts: ["10.0.0.2", "10.0.0.1"]
                .iter()
                .map(|s| s.parse().unwrap())
                .collect(),
            kiosk_hosts: BTreeSet::new(),
        };
        let json = serde_json::to_value(DomainEvent::from(payload)).unwrap();

        assert_eq!(json["type"], "world_updated");
        assert_eq!(
            json["manager_hosts"],
            serde_json::json!(["10.0.0.1", "10.0.0.2"])
        );
    }

    #[test]
    fn test_event_type_names() {
        let event = DomainEvent::from(server_payload());
        assert_eq!(event.event_type(), event_types::SERVER_UPDATED);
        assert_eq!(event.server_id(), Some(ServerId::new(3)));
        assert_eq!(event.event_version(), 1);
    }

    #[test]
    fn test_domain_event_roundtrip() {
        let mut payload = server_payload();
        payload.public_ip = Some("203.0.113.7".parse().unwrap());
        payload.public_web_socket_port = Some(8889);
        payload.web_socket_url = Some("ws://203.0.113.7:8889".to_string());
        let event = DomainEvent::from(payload);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
