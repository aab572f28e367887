//! World model: regions, areas, servers, tasks and the world record.
//!
//! Regions and areas are bootstrap data. Servers are the logical processes
//! the allocator maintains; tasks are what the hosting provider actually
//! runs. The area table holds the area -> server back-reference, so a
//! server's area list is always derived from it and an area can never be
//! held by two servers at once.

use std::collections::BTreeSet;
use std::net::IpAddr;

use areaplane_events::{ServerUpdatedPayload, WorldUpdatedPayload};
use areaplane_id::{AreaId, RegionId, ServerId, TaskId, Version};
use areaplane_reconcile::{mean_half_up, POSITION_SCALE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Mean of the given positions, each axis rounded half-up to
    /// [`POSITION_SCALE`] decimals. `None` for an empty input.
    pub fn mean<'a, I>(positions: I) -> Option<Position>
    where
        I: IntoIterator<Item = &'a Position>,
        I::IntoIter: Clone,
    {
        let positions = positions.into_iter();
        Some(Position {
            x: mean_half_up(positions.clone().map(|p| p.x), POSITION_SCALE)?,
            y: mean_half_up(positions.clone().map(|p| p.y), POSITION_SCALE)?,
            z: mean_half_up(positions.map(|p| p.z), POSITION_SCALE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub map_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub region_id: RegionId,
    /// Unique within the region; launch parameters refer to areas by index.
    pub index: i32,
    pub name: String,
    pub position: Position,
    pub server_id: Option<ServerId>,
}

impl Area {
    pub fn area_ref(&self) -> AreaRef {
        AreaRef {
            id: self.id,
            index: self.index,
        }
    }
}

/// An area as seen from the server holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AreaRef {
    pub id: AreaId,
    pub index: i32,
}

/// Every field of a server except its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub region_id: RegionId,
    pub map_name: String,
    /// Held areas, ordered by area index.
    pub areas: Vec<AreaRef>,
    pub position: Option<Position>,
    pub enabled: bool,
    pub active: bool,
    pub public_ip: Option<IpAddr>,
    pub public_web_socket_port: Option<u16>,
    pub domain: Option<String>,
    pub web_socket_url: Option<String>,
    pub seen: Option<DateTime<Utc>>,
}

impl ServerState {
    /// A server in `region_id` holding nothing.
    pub fn new(region_id: RegionId, map_name: impl Into<String>) -> Self {
        Self {
            region_id,
            map_name: map_name.into(),
            areas: Vec::new(),
            position: None,
            enabled: false,
            active: false,
            public_ip: None,
            public_web_socket_port: None,
            domain: None,
            web_socket_url: None,
            seen: None,
        }
    }

    pub fn holds(&self, area_id: AreaId) -> bool {
        self.areas.iter().any(|a| a.id == area_id)
    }

    pub fn area_ids(&self) -> BTreeSet<AreaId> {
        self.areas.iter().map(|a| a.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub version: Version,
    pub state: ServerState,
}

impl Server {
    /// Builds the `server.updated` payload from the current fields.
    pub fn updated_payload(&self) -> ServerUpdatedPayload {
        ServerUpdatedPayload {
            server_id: self.id,
            version: self.version,
            region_id: self.state.region_id,
            area_ids: self.state.areas.iter().map(|a| a.id).collect(),
            area_indexes: self.state.areas.iter().map(|a| a.index).collect(),
            enabled: self.state.enabled,
            active: self.state.active,
            public_ip: self.state.public_ip,
            public_web_socket_port: self.state.public_web_socket_port,
            web_socket_url: self.state.web_socket_url.clone(),
        }
    }
}

/// Role of a hosted task, with the role-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRole {
    Manager,
    Kiosk,
    Server {
        server_id: ServerId,
        public_web_socket_port: Option<u16>,
    },
}

impl TaskRole {
    /// Column value for the role discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskRole::Manager => "manager",
            TaskRole::Kiosk => "kiosk",
            TaskRole::Server { .. } => "server",
        }
    }

    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            TaskRole::Server { server_id, .. } => Some(*server_id),
            TaskRole::Manager | TaskRole::Kiosk => None,
        }
    }

    pub fn public_web_socket_port(&self) -> Option<u16> {
        match self {
            TaskRole::Server {
                public_web_socket_port,
                ..
            } => *public_web_socket_port,
            TaskRole::Manager | TaskRole::Kiosk => None,
        }
    }
}

/// A provider task as recorded in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub version: Version,
    /// Provider-assigned identifier (task ARN, container id, ...).
    pub identifier: String,
    pub role: TaskRole,
    pub private_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    pub domain: Option<String>,
    /// Set when this manager started the task.
    pub initiated: Option<DateTime<Utc>>,
    /// Set on every poll that observed the task.
    pub seen: Option<DateTime<Utc>>,
}

/// The singleton world record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct World {
    pub version: Version,
    pub manager_hosts: BTreeSet<IpAddr>,
    pub kiosk_hosts: BTreeSet<IpAddr>,
}

impl World {
    pub fn updated_payload(&self) -> WorldUpdatedPayload {
        WorldUpdatedPayload {
            version: self.version,
            manager_hosts: self.manager_hosts.clone(),
            kiosk_hosts: self.kiosk_hosts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_mean_rounds_half_up() {
        let positions = [Position::new(1250.0, 1800.0, 0.0), Position::new(1500.0, 750.0, 1.0)];
        let mean = Position::mean(&positions).unwrap();
        assert_eq!(mean, Position::new(1375.0, 1275.0, 0.5));

        let thirds = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(1.0, 1.0, 1.0),
            Position::new(1.0, 1.0, 1.0),
        ];
        assert_eq!(Position::mean(&thirds).unwrap().x, 0.666667);
    }

    #[test]
    fn test_position_mean_empty() {
        assert_eq!(Position::mean(&[]), None);
    }

    #[test]
    fn test_task_role_accessors() {
        let role = TaskRole::Server {
            server_id: ServerId::new(4),
            public_web_socket_port: Some(8889),
        };
        assert_eq!(role.kind(), "server");
        assert_eq!(role.server_id(), Some(ServerId::new(4)));
        assert_eq!(role.public_web_socket_port(), Some(8889));
        assert_eq!(TaskRole::Kiosk.server_id(), None);
    }

    #[test]
    fn test_server_payload_lists_area_indexes() {
        let server = Server {
            id: ServerId::new(2),
            version: Version::new(5),
            state: ServerState {
                areas: vec![AreaRef {
                    id: AreaId::new(7),
                    index: 1,
                }],
                enabled: true,
                ..ServerState::new(RegionId::new(1), "Region0001")
            },
        };

        let payload = server.updated_payload();
        assert_eq!(payload.area_ids, vec![AreaId::new(7)]);
        assert_eq!(payload.area_indexes, vec![1]);
        assert!(payload.enabled);
        assert!(!payload.active);
    }
}
