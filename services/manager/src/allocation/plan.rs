//! The output of planning one region: what to write, and what the writes
//! assume about the rows they touch.

use std::collections::BTreeMap;

use areaplane_id::{AreaId, RegionId, ServerId, Version};

use crate::model::ServerState;

/// Identifies a server in a plan, before new servers have ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKey {
    /// A stored server, with the version the plan was computed from.
    Existing { id: ServerId, version: Version },
    /// The n-th server the plan creates.
    New(usize),
}

impl ServerKey {
    /// The stored id, if the server exists yet.
    pub fn id(&self) -> Option<ServerId> {
        match self {
            ServerKey::Existing { id, .. } => Some(*id),
            ServerKey::New(_) => None,
        }
    }
}

/// What committing a planned server writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChange {
    /// Nothing.
    Unchanged,
    /// Only the `seen` timestamp; no version bump, no event.
    Seen,
    /// One or more observable fields; version-checked, emits an event.
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedServer {
    pub key: ServerKey,
    pub state: ServerState,
    pub change: ServerChange,
}

/// Desired state of every server in a region.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub region_id: RegionId,
    pub servers: Vec<PlannedServer>,
    /// Owner of each area of the region when the snapshot was read. The
    /// commit fails with a conflict if any of them moved in the meantime.
    pub expected_owners: BTreeMap<AreaId, Option<ServerId>>,
}

impl AllocationPlan {
    /// True if committing would write nothing at all.
    pub fn is_noop(&self) -> bool {
        self.servers
            .iter()
            .all(|s| s.change == ServerChange::Unchanged)
    }

    /// Number of servers with observable changes.
    pub fn updated_count(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.change == ServerChange::Updated)
            .count()
    }

    /// The planned server that will hold each area of the region.
    pub fn desired_owners(&self) -> BTreeMap<AreaId, Option<ServerKey>> {
        let mut owners: BTreeMap<AreaId, Option<ServerKey>> =
            self.expected_owners.keys().map(|id| (*id, None)).collect();
        for planned in &self.servers {
            for area in &planned.state.areas {
                owners.insert(area.id, Some(planned.key));
            }
        }
        owners
    }
}
