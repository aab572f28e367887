//! Server allocation: keeps one enabled server per area group of every
//! region and the derived server fields in line with their hosting tasks.
//!
//! A region pass reads a [`RegionSnapshot`], plans the desired state of
//! every server in memory and commits the plan in one store transaction.
//! A conflicting concurrent pass makes the commit fail; the whole region
//! pass is then re-planned from a fresh snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use areaplane_events::DomainEvent;
use areaplane_id::{RegionId, ServerId};
use areaplane_reconcile::{retry_transient, set_if_changed, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::grouping::{AreaGroup, AreaGroupingService};
use super::plan::{AllocationPlan, PlannedServer, ServerChange, ServerKey};
use crate::db::{DbError, RegionSnapshot, WorldStore};
use crate::error::{ManagerError, ManagerResult};
use crate::model::{Region, Server, ServerState, Task};

/// Body of the server-started notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStarted {
    pub server_id: ServerId,
}

/// Statistics from one allocation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    pub regions_processed: usize,
    pub regions_failed: usize,
    pub servers_updated: usize,
}

pub struct ServerAllocator {
    store: Arc<dyn WorldStore>,
    grouping: AreaGroupingService,
    ssl_enabled: bool,
    retry: RetryPolicy,
}

impl ServerAllocator {
    pub fn new(store: Arc<dyn WorldStore>, ssl_enabled: bool, retry: RetryPolicy) -> Self {
        Self {
            store,
            grouping: AreaGroupingService::new(),
            ssl_enabled,
            retry,
        }
    }

    /// Runs one allocation pass over every region.
    ///
    /// Regions are independent: a region whose retries are exhausted is
    /// logged at `warn` and skipped, and the events of the other regions are
    /// still returned, because their commits already happened. The pass (and
    /// so the scheduled job) fails only if every region failed; a skipped
    /// region is retried from scratch on the next tick either way.
    #[instrument(skip(self))]
    pub async fn allocate_servers(&self) -> ManagerResult<Vec<DomainEvent>> {
        let regions = retry_transient(&self.retry, "list_regions", || self.store.list_regions())
            .await?;

        let mut stats = AllocationStats::default();
        let mut events = Vec::new();
        let mut last_error = None;

        for region in &regions {
            match self.allocate_region(region.id).await {
                Ok(region_events) => {
                    stats.regions_processed += 1;
                    stats.servers_updated += region_events.len();
                    events.extend(region_events);
                }
                Err(e) => {
                    warn!(region_id = %region.id, error = %e, "Failed to allocate servers for region");
                    stats.regions_failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if stats.servers_updated > 0 || stats.regions_failed > 0 {
            info!(
                regions_processed = stats.regions_processed,
                regions_failed = stats.regions_failed,
                servers_updated = stats.servers_updated,
                "Server allocation pass complete"
            );
        }

        match last_error {
            Some(e) if stats.regions_processed == 0 => Err(e),
            _ => Ok(events),
        }
    }

    /// Allocates one region, retrying the whole pass on store contention.
    #[instrument(skip(self), fields(region_id = %region_id))]
    pub async fn allocate_region(&self, region_id: RegionId) -> ManagerResult<Vec<DomainEvent>> {
        let committed = retry_transient(&self.retry, "allocate_region", || {
            self.try_allocate_region(region_id)
        })
        .await?;

        Ok(committed
            .iter()
            .map(|server| DomainEvent::ServerUpdated(server.updated_payload()))
            .collect())
    }

    async fn try_allocate_region(&self, region_id: RegionId) -> ManagerResult<Vec<Server>> {
        let snapshot = self.store.region_snapshot(region_id).await?;
        let plan = self.plan_region(&snapshot, Utc::now());
        if plan.is_noop() {
            return Ok(Vec::new());
        }

        debug!(updated = plan.updated_count(), "Committing allocation plan");
        Ok(self.store.commit_allocation(&plan).await?)
    }

    /// Computes the desired state of every server of the region.
    ///
    /// Pure: the same snapshot and time always give the same plan.
    pub fn plan_region(&self, snapshot: &RegionSnapshot, now: DateTime<Utc>) -> AllocationPlan {
        struct Working {
            key: ServerKey,
            state: ServerState,
            changed: bool,
            used: bool,
        }

        let region = &snapshot.region;
        let mut working: Vec<Working> = snapshot
            .servers
            .iter()
            .map(|server| Working {
                key: ServerKey::Existing {
                    id: server.id,
                    version: server.version,
                },
                state: server.state.clone(),
                changed: false,
                used: false,
            })
            .collect();
        let mut created = 0;

        for group in self.grouping.group_areas(&snapshot.areas) {
            let first = group.first().id;
            let slot = working
                .iter()
                .position(|w| w.state.holds(first))
                .or_else(|| working.iter().position(|w| w.state.areas.is_empty() && !w.used));

            let slot = match slot {
                Some(slot) => slot,
                None => {
                    working.push(Working {
                        key: ServerKey::New(created),
                        state: ServerState::new(region.id, region.map_name.clone()),
                        changed: true,
                        used: false,
                    });
                    created += 1;
                    working.len() - 1
                }
            };

            // Take the group's areas away from whoever held them, so a later
            // lookup never finds an area on two servers.
            let group_ids = group.area_ids();
            for (n, other) in working.iter_mut().enumerate() {
                if n != slot && other.state.areas.iter().any(|a| group_ids.contains(&a.id)) {
                    other.state.areas.retain(|a| !group_ids.contains(&a.id));
                    other.changed = true;
                }
            }

            let entry = &mut working[slot];
            let task = entry.key.id().and_then(|id| snapshot.server_tasks.get(&id));
            entry.changed |= self.apply(&mut entry.state, region, Some(&group), task);
            entry.used = true;
        }

        for entry in working.iter_mut().filter(|w| !w.used) {
            let task = entry.key.id().and_then(|id| snapshot.server_tasks.get(&id));
            entry.changed |= self.apply(&mut entry.state, region, None, task);
        }

        let servers = working
            .into_iter()
            .map(|mut entry| {
                let has_task = entry
                    .key
                    .id()
                    .is_some_and(|id| snapshot.server_tasks.contains_key(&id));
                if has_task {
                    entry.state.seen = Some(now);
                }
                let change = match (entry.changed, has_task) {
                    (true, _) => ServerChange::Updated,
                    (false, true) => ServerChange::Seen,
                    (false, false) => ServerChange::Unchanged,
                };
                PlannedServer {
                    key: entry.key,
                    state: entry.state,
                    change,
                }
            })
            .collect();

        AllocationPlan {
            region_id: region.id,
            servers,
            expected_owners: snapshot.areas.iter().map(|a| (a.id, a.server_id)).collect(),
        }
    }

    /// Points `state` at `group` (or at nothing) and refreshes the derived
    /// fields. Returns true if any observable field changed.
    fn apply(
        &self,
        state: &mut ServerState,
        region: &Region,
        group: Option<&AreaGroup>,
        task: Option<&Task>,
    ) -> bool {
        let mut changed = false;
        changed |= set_if_changed(&mut state.region_id, region.id);
        changed |= set_if_changed(&mut state.map_name, region.map_name.clone());
        changed |= set_if_changed(
            &mut state.areas,
            group.map(AreaGroup::area_refs).unwrap_or_default(),
        );
        changed |= set_if_changed(&mut state.position, group.and_then(AreaGroup::position));
        changed |= set_if_changed(&mut state.enabled, !state.areas.is_empty());
        let active = state.active && task.is_some();
        changed |= set_if_changed(&mut state.active, active);
        changed |= self.refresh_addresses(state, task);
        changed
    }

    /// Recomputes the public address fields and the websocket url from the
    /// server's first task.
    fn refresh_addresses(&self, state: &mut ServerState, task: Option<&Task>) -> bool {
        let mut changed = false;
        changed |= set_if_changed(&mut state.public_ip, task.and_then(|t| t.public_ip));
        changed |= set_if_changed(
            &mut state.public_web_socket_port,
            task.and_then(|t| t.role.public_web_socket_port()),
        );
        changed |= set_if_changed(&mut state.domain, task.and_then(|t| t.domain.clone()));
        let url = web_socket_url(state, self.ssl_enabled);
        changed |= set_if_changed(&mut state.web_socket_url, url);
        changed
    }

    /// Marks a server active after its process reported in.
    ///
    /// Returns the `ServerUpdated` event, or `None` if the server was
    /// already active with up to date addresses.
    #[instrument(skip(self, started), fields(server_id = %server_id))]
    pub async fn handle_server_started(
        &self,
        server_id: ServerId,
        started: ServerStarted,
    ) -> ManagerResult<Option<DomainEvent>> {
        if started.server_id != server_id {
            return Err(ManagerError::Validation(format!(
                "server id mismatch: path {server_id}, body {}",
                started.server_id
            )));
        }

        let updated = retry_transient(&self.retry, "server_started", || {
            self.try_mark_started(server_id)
        })
        .await?;

        match updated {
            Some(server) => {
                info!(active = server.state.active, "Server started");
                Ok(Some(DomainEvent::ServerUpdated(server.updated_payload())))
            }
            None => {
                debug!("Server already marked started");
                Ok(None)
            }
        }
    }

    async fn try_mark_started(&self, server_id: ServerId) -> ManagerResult<Option<Server>> {
        let mut server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(|| DbError::not_found("server", server_id))?;
        let task = self.store.server_task(server_id).await?;

        let mut changed = set_if_changed(&mut server.state.active, true);
        changed |= self.refresh_addresses(&mut server.state, task.as_ref());
        if !changed {
            return Ok(None);
        }
        Ok(Some(self.store.update_server(&server).await?))
    }
}

/// `wss://domain:port` with transport security, `ws://ip:port` without;
/// only for enabled, active servers with a known address.
fn web_socket_url(state: &ServerState, ssl_enabled: bool) -> Option<String> {
    if !(state.enabled && state.active) {
        return None;
    }
    let ip = state.public_ip?;
    let port = state.public_web_socket_port?;
    if ssl_enabled {
        state.domain.as_ref().map(|domain| format!("wss://{domain}:{port}"))
    } else {
        Some(format!("ws://{}", SocketAddr::new(ip, port)))
    }
}
