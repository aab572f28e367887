//! In-memory world store.
//!
//! Mirrors the Postgres semantics (optimistic versions, area ownership
//! checks, identifier upserts) behind a single mutex, so reconciliation can
//! run in tests and dev mode without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use areaplane_id::{AreaId, RegionId, ServerId, TaskId, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DbError, RegionSnapshot, WorldStore};
use crate::allocation::{AllocationPlan, ServerChange, ServerKey};
use crate::hosting::HostedTask;
use crate::model::{Area, AreaRef, Position, Region, Server, ServerState, Task, World};

#[derive(Debug, Default)]
struct MemoryState {
    regions: BTreeMap<RegionId, Region>,
    areas: BTreeMap<AreaId, Area>,
    /// Server rows; `state.areas` is not stored, it is derived from `areas`.
    servers: BTreeMap<ServerId, (Version, ServerState)>,
    tasks: BTreeMap<TaskId, Task>,
    world: World,
    last_id: i64,
    #[cfg(test)]
    failing_commits: u32,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn areas_of(&self, server_id: ServerId) -> Vec<AreaRef> {
        let mut areas: Vec<AreaRef> = self
            .areas
            .values()
            .filter(|a| a.server_id == Some(server_id))
            .map(Area::area_ref)
            .collect();
        areas.sort_by_key(|a| (a.index, a.id));
        areas
    }

    fn server(&self, id: ServerId) -> Option<Server> {
        let (version, state) = self.servers.get(&id)?;
        let mut state = state.clone();
        state.areas = self.areas_of(id);
        Some(Server {
            id,
            version: *version,
            state,
        })
    }

    fn servers_where(&self, mut keep: impl FnMut(&Server) -> bool) -> Vec<Server> {
        self.servers
            .keys()
            .filter_map(|id| self.server(*id))
            .filter(|s| keep(s))
            .collect()
    }

    fn first_task_of(&self, server_id: ServerId) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.role.server_id() == Some(server_id))
    }

    fn task_by_identifier(&self, identifier: &str) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|t| t.identifier == identifier)
            .map(|t| t.id)
    }
}

/// World store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` allocation commits fail with a transient error.
    #[cfg(test)]
    pub(crate) async fn fail_next_commits(&self, count: u32) {
        self.state.lock().await.failing_commits = count;
    }
}

#[async_trait]
impl WorldStore for MemoryStore {
    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, DbError> {
        Ok(self.state.lock().await.regions.values().cloned().collect())
    }

    async fn insert_region(&self, name: &str, map_name: &str) -> Result<Region, DbError> {
        let mut state = self.state.lock().await;
        let region = Region {
            id: RegionId::new(state.next_id()),
            name: name.to_string(),
            map_name: map_name.to_string(),
        };
        state.regions.insert(region.id, region.clone());
        Ok(region)
    }

    async fn insert_area(
        &self,
        region_id: RegionId,
        index: i32,
        name: &str,
        position: Position,
    ) -> Result<Area, DbError> {
        let mut state = self.state.lock().await;
        if !state.regions.contains_key(&region_id) {
            return Err(DbError::not_found("region", region_id));
        }
        if state
            .areas
            .values()
            .any(|a| a.region_id == region_id && a.index == index)
        {
            return Err(DbError::Validation(format!(
                "area index {index} already used in region {region_id}"
            )));
        }
        let area = Area {
            id: AreaId::new(state.next_id()),
            region_id,
            index,
            name: name.to_string(),
            position,
            server_id: None,
        };
        state.areas.insert(area.id, area.clone());
        Ok(area)
    }

    async fn delete_area(&self, area_id: AreaId) -> Result<(), DbError> {
        self.state.lock().await.areas.remove(&area_id);
        Ok(())
    }

    async fn region_snapshot(&self, region_id: RegionId) -> Result<RegionSnapshot, DbError> {
        let state = self.state.lock().await;
        let region = state
            .regions
            .get(&region_id)
            .cloned()
            .ok_or_else(|| DbError::not_found("region", region_id))?;

        let mut areas: Vec<Area> = state
            .areas
            .values()
            .filter(|a| a.region_id == region_id)
            .cloned()
            .collect();
        areas.sort_by_key(|a| (a.index, a.id));

        let servers = state.servers_where(|s| s.state.region_id == region_id);
        let server_tasks = servers
            .iter()
            .filter_map(|s| state.first_task_of(s.id).map(|t| (s.id, t.clone())))
            .collect();

        Ok(RegionSnapshot {
            region,
            areas,
            servers,
            server_tasks,
        })
    }

    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<Server>, DbError> {
        let mut state = self.state.lock().await;

        #[cfg(test)]
        {
            if state.failing_commits > 0 {
                state.failing_commits -= 1;
                return Err(DbError::Transient("injected commit failure".to_string()));
            }
        }

        // Verify everything before writing anything.
        for (area_id, expected) in &plan.expected_owners {
            let current = state
                .areas
                .get(area_id)
                .ok_or_else(|| DbError::conflict("area", area_id))?
                .server_id;
            if current != *expected {
                return Err(DbError::conflict("area", area_id));
            }
        }
        for planned in &plan.servers {
            if let (ServerKey::Existing { id, version }, ServerChange::Updated) =
                (planned.key, planned.change)
            {
                match state.servers.get(&id) {
                    Some((current, _)) if *current == version => {}
                    _ => return Err(DbError::conflict("server", id)),
                }
            }
        }

        let mut assigned: BTreeMap<usize, ServerId> = BTreeMap::new();
        let mut updated = Vec::new();

        for planned in &plan.servers {
            match (planned.key, planned.change) {
                (ServerKey::New(n), _) => {
                    let id = ServerId::new(state.next_id());
                    state
                        .servers
                        .insert(id, (Version::INITIAL, planned.state.clone()));
                    assigned.insert(n, id);
                    updated.push(id);
                }
                (ServerKey::Existing { .. }, ServerChange::Unchanged) => {}
                (ServerKey::Existing { id, .. }, ServerChange::Seen) => {
                    if let Some((_, stored)) = state.servers.get_mut(&id) {
                        stored.seen = planned.state.seen;
                    }
                }
                (ServerKey::Existing { id, .. }, ServerChange::Updated) => {
                    if let Some((version, stored)) = state.servers.get_mut(&id) {
                        *version = version.next();
                        *stored = planned.state.clone();
                    }
                    updated.push(id);
                }
            }
        }

        for (area_id, owner) in plan.desired_owners() {
            let owner = match owner {
                None => None,
                Some(ServerKey::Existing { id, .. }) => Some(id),
                Some(ServerKey::New(n)) => assigned.get(&n).copied(),
            };
            if let Some(area) = state.areas.get_mut(&area_id) {
                area.server_id = owner;
            }
        }

        Ok(updated.into_iter().filter_map(|id| state.server(id)).collect())
    }

    async fn list_servers(&self) -> Result<Vec<Server>, DbError> {
        Ok(self.state.lock().await.servers_where(|_| true))
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, DbError> {
        Ok(self.state.lock().await.server(id))
    }

    async fn update_server(&self, server: &Server) -> Result<Server, DbError> {
        let mut state = self.state.lock().await;
        match state.servers.get_mut(&server.id) {
            None => return Err(DbError::not_found("server", server.id)),
            Some((version, _)) if *version != server.version => {
                return Err(DbError::conflict("server", server.id))
            }
            Some((version, stored)) => {
                *version = version.next();
                *stored = server.state.clone();
            }
        }
        state
            .server(server.id)
            .ok_or_else(|| DbError::not_found("server", server.id))
    }

    async fn servers_with_areas_differing(
        &self,
        region_id: RegionId,
        area_ids: &BTreeSet<AreaId>,
    ) -> Result<Vec<Server>, DbError> {
        Ok(self.state.lock().await.servers_where(|s| {
            s.state.region_id == region_id && s.state.area_ids() != *area_ids
        }))
    }

    async fn first_server_containing(
        &self,
        region_id: RegionId,
        area_id: AreaId,
    ) -> Result<Option<Server>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .servers_where(|s| s.state.region_id == region_id && s.state.holds(area_id))
            .into_iter()
            .next())
    }

    async fn first_empty_server(&self, region_id: RegionId) -> Result<Option<Server>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .servers_where(|s| s.state.region_id == region_id && s.state.areas.is_empty())
            .into_iter()
            .next())
    }

    async fn enabled_servers_without_task(&self) -> Result<Vec<Server>, DbError> {
        let state = self.state.lock().await;
        Ok(state.servers_where(|s| s.state.enabled && state.first_task_of(s.id).is_none()))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DbError> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn server_task(&self, server_id: ServerId) -> Result<Option<Task>, DbError> {
        Ok(self.state.lock().await.first_task_of(server_id).cloned())
    }

    async fn enabled_server_tasks(&self) -> Result<Vec<Task>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .servers
            .iter()
            .filter(|(_, (_, s))| s.enabled)
            .filter_map(|(id, _)| state.first_task_of(*id).cloned())
            .collect())
    }

    async fn upsert_polled_task(
        &self,
        hosted: &HostedTask,
        seen: DateTime<Utc>,
    ) -> Result<Task, DbError> {
        let mut state = self.state.lock().await;
        let id = match state.task_by_identifier(&hosted.identifier) {
            Some(id) => id,
            None => {
                let id = TaskId::new(state.next_id());
                state.tasks.insert(
                    id,
                    Task {
                        id,
                        version: Version::INITIAL,
                        identifier: hosted.identifier.clone(),
                        role: hosted.role,
                        private_ip: hosted.private_ip,
                        public_ip: hosted.public_ip,
                        domain: None,
                        initiated: None,
                        seen: Some(seen),
                    },
                );
                return state
                    .tasks
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| DbError::not_found("task", id));
            }
        };

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("task", id))?;
        if task.public_ip != hosted.public_ip {
            task.domain = None;
        }
        task.role = hosted.role;
        task.private_ip = hosted.private_ip;
        task.public_ip = hosted.public_ip;
        task.seen = Some(seen);
        task.version = task.version.next();
        Ok(task.clone())
    }

    async fn record_started_task(
        &self,
        hosted: &HostedTask,
        initiated: DateTime<Utc>,
    ) -> Result<Task, DbError> {
        let mut state = self.state.lock().await;
        let id = match state.task_by_identifier(&hosted.identifier) {
            Some(id) => id,
            None => {
                let id = TaskId::new(state.next_id());
                state.tasks.insert(
                    id,
                    Task {
                        id,
                        version: Version::INITIAL,
                        identifier: hosted.identifier.clone(),
                        role: hosted.role,
                        private_ip: hosted.private_ip,
                        public_ip: hosted.public_ip,
                        domain: None,
                        initiated: None,
                        seen: None,
                    },
                );
                id
            }
        };

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("task", id))?;
        task.initiated = Some(initiated);
        task.version = task.version.next();
        Ok(task.clone())
    }

    async fn stale_tasks(
        &self,
        keep: &BTreeSet<String>,
        seen_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| !keep.contains(&t.identifier))
            .filter(|t| t.seen.is_some_and(|seen| seen < seen_before))
            .cloned()
            .collect())
    }

    async fn unused_server_tasks(
        &self,
        keep: &BTreeSet<String>,
        initiated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.role.server_id().is_some())
            .filter(|t| !keep.contains(&t.identifier))
            .filter(|t| t.initiated.is_none_or(|at| at < initiated_before))
            .cloned()
            .collect())
    }

    async fn set_task_domain(&self, id: TaskId, domain: &str) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("task", id))?;
        if task.domain.as_deref() != Some(domain) {
            task.domain = Some(domain.to_string());
            task.version = task.version.next();
        }
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), DbError> {
        self.state.lock().await.tasks.remove(&id);
        Ok(())
    }

    async fn get_world(&self) -> Result<World, DbError> {
        Ok(self.state.lock().await.world.clone())
    }

    async fn update_world_hosts(
        &self,
        manager_hosts: &BTreeSet<IpAddr>,
        kiosk_hosts: &BTreeSet<IpAddr>,
    ) -> Result<Option<World>, DbError> {
        let mut state = self.state.lock().await;
        let world = &mut state.world;
        if world.manager_hosts == *manager_hosts && world.kiosk_hosts == *kiosk_hosts {
            return Ok(None);
        }
        world.manager_hosts = manager_hosts.clone();
        world.kiosk_hosts = kiosk_hosts.clone();
        world.version = world.version.next();
        Ok(Some(world.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::ServerAllocator;
    use areaplane_reconcile::RetryPolicy;
    use std::sync::Arc;

    /// Two areas on two servers, then area B deleted so its server is empty.
    async fn world_with_empty_server() -> (Arc<MemoryStore>, RegionId, AreaId, AreaId) {
        let store = Arc::new(MemoryStore::new());
        let region = store.insert_region("1", "Region0001").await.unwrap();
        let a = store
            .insert_area(region.id, 0, "A", Position::new(1250.0, 1800.0, 0.0))
            .await
            .unwrap();
        let b = store
            .insert_area(region.id, 1, "B", Position::new(1500.0, 750.0, 0.0))
            .await
            .unwrap();
        let allocator = ServerAllocator::new(store.clone(), false, RetryPolicy::immediate(3));
        allocator.allocate_servers().await.unwrap();
        store.delete_area(b.id).await.unwrap();
        allocator.allocate_servers().await.unwrap();

        (store, region.id, a.id, b.id)
    }

    #[tokio::test]
    async fn test_first_server_containing() {
        let (store, region_id, a, b) = world_with_empty_server().await;

        let holder = store.first_server_containing(region_id, a).await.unwrap().unwrap();
        assert!(holder.state.holds(a));
        assert!(holder.state.enabled);
        assert!(store.first_server_containing(region_id, b).await.unwrap().is_none());
        assert!(store
            .first_server_containing(RegionId::new(999), a)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_first_empty_server() {
        let (store, region_id, a, _) = world_with_empty_server().await;

        let empty = store.first_empty_server(region_id).await.unwrap().unwrap();
        assert!(empty.state.areas.is_empty());
        assert!(!empty.state.enabled);
        let holder = store.first_server_containing(region_id, a).await.unwrap().unwrap();
        assert_ne!(empty.id, holder.id);
        assert!(store.first_empty_server(RegionId::new(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_servers_with_areas_differing() {
        let (store, region_id, a, _) = world_with_empty_server().await;
        let holder = store.first_server_containing(region_id, a).await.unwrap().unwrap();
        let empty = store.first_empty_server(region_id).await.unwrap().unwrap();

        let only_a: BTreeSet<AreaId> = [a].into_iter().collect();
        let differing = store.servers_with_areas_differing(region_id, &only_a).await.unwrap();
        assert_eq!(differing.iter().map(|s| s.id).collect::<Vec<_>>(), vec![empty.id]);

        let none: BTreeSet<AreaId> = BTreeSet::new();
        let differing = store.servers_with_areas_differing(region_id, &none).await.unwrap();
        assert_eq!(differing.iter().map(|s| s.id).collect::<Vec<_>>(), vec![holder.id]);

        assert!(store
            .servers_with_areas_differing(RegionId::new(999), &only_a)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stale_server_version_conflicts() {
        let (store, region_id, a, _) = world_with_empty_server().await;
        let holder = store.first_server_containing(region_id, a).await.unwrap().unwrap();

        let mut stale = holder.clone();
        stale.state.active = true;
        store.update_server(&stale).await.unwrap();

        assert!(matches!(
            store.update_server(&stale).await,
            Err(DbError::Conflict { .. })
        ));
    }
}
