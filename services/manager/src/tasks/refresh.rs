use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use areaplane_events::DomainEvent;
use areaplane_reconcile::{retry_transient, RetryPolicy};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::db::WorldStore;
use crate::error::ManagerResult;
use crate::hosting::{HostedTask, HostingProvider};
use crate::model::{TaskRole, World};

/// Polls the hosting provider and records what it runs.
pub struct TaskRefreshService {
    store: Arc<dyn WorldStore>,
    hosting: Arc<dyn HostingProvider>,
    retry: RetryPolicy,
}

impl TaskRefreshService {
    pub fn new(
        store: Arc<dyn WorldStore>,
        hosting: Arc<dyn HostingProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            hosting,
            retry,
        }
    }

    /// One refresh pass. Emits `WorldUpdated` when the manager or kiosk
    /// host set changed.
    #[instrument(skip(self), fields(provider = self.hosting.name()))]
    pub async fn refresh_tasks(&self) -> ManagerResult<Vec<DomainEvent>> {
        let hosted = self.hosting.poll().await?;
        let seen = Utc::now();
        debug!(count = hosted.len(), "Polled hosted tasks");

        let world = retry_transient(&self.retry, "refresh_tasks", || {
            self.record_poll(&hosted, seen)
        })
        .await?;

        Ok(world
            .map(|world| {
                info!(
                    manager_hosts = world.manager_hosts.len(),
                    kiosk_hosts = world.kiosk_hosts.len(),
                    "World hosts changed"
                );
                DomainEvent::WorldUpdated(world.updated_payload())
            })
            .into_iter()
            .collect())
    }

    async fn record_poll(
        &self,
        hosted: &[HostedTask],
        seen: DateTime<Utc>,
    ) -> ManagerResult<Option<World>> {
        let mut observed = BTreeSet::new();
        for task in hosted {
            self.store.upsert_polled_task(task, seen).await?;
            observed.insert(task.identifier.clone());
        }

        // Seen by an earlier poll but gone now.
        for task in self.store.stale_tasks(&observed, seen).await? {
            debug!(task_identifier = %task.identifier, "Deleting task no longer running");
            self.store.delete_task(task.id).await?;
        }

        let (manager_hosts, kiosk_hosts) = world_hosts(hosted);
        Ok(self
            .store
            .update_world_hosts(&manager_hosts, &kiosk_hosts)
            .await?)
    }
}

/// Addresses of the manager and kiosk tasks: the public address where one
/// is assigned, the private one otherwise.
fn world_hosts(hosted: &[HostedTask]) -> (BTreeSet<IpAddr>, BTreeSet<IpAddr>) {
    let mut managers = BTreeSet::new();
    let mut kiosks = BTreeSet::new();
    for task in hosted {
        let Some(ip) = task.public_ip.or(task.private_ip) else {
            continue;
        };
        match task.role {
            TaskRole::Manager => {
                managers.insert(ip);
            }
            TaskRole::Kiosk => {
                kiosks.insert(ip);
            }
            TaskRole::Server { .. } => {}
        }
    }
    (managers, kiosks)
}
