use std::collections::BTreeSet;
use std::sync::Arc;

use areaplane_events::DomainEvent;
use areaplane_reconcile::{retry_transient, RetryPolicy};
use chrono::{TimeDelta, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ManagerSettings;
use crate::db::WorldStore;
use crate::error::ManagerResult;
use crate::hosting::{HostingProvider, LaunchParameters};

/// Counters of one server-task pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerTaskStats {
    pub started: usize,
    pub start_failed: usize,
    pub stopped: usize,
    pub stop_failed: usize,
}

/// Keeps exactly one task running per enabled server.
pub struct ServerTaskAllocator {
    store: Arc<dyn WorldStore>,
    hosting: Arc<dyn HostingProvider>,
    settings: ManagerSettings,
    retry: RetryPolicy,
}

impl ServerTaskAllocator {
    pub fn new(
        store: Arc<dyn WorldStore>,
        hosting: Arc<dyn HostingProvider>,
        settings: ManagerSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            hosting,
            settings,
            retry,
        }
    }

    /// Job entry point. Server-task changes surface as `server.updated`
    /// events through the allocator and the start notification, so this
    /// pass emits none itself.
    pub async fn allocate_server_tasks(&self) -> ManagerResult<Vec<DomainEvent>> {
        let stats = self.run().await?;
        if stats != ServerTaskStats::default() {
            info!(
                started = stats.started,
                start_failed = stats.start_failed,
                stopped = stats.stopped,
                stop_failed = stats.stop_failed,
                "Server task allocation finished"
            );
        }
        Ok(Vec::new())
    }

    /// Starts missing tasks, then stops the ones no enabled server uses.
    #[instrument(skip(self), fields(provider = self.hosting.name()))]
    pub async fn run(&self) -> ManagerResult<ServerTaskStats> {
        let mut stats = ServerTaskStats::default();

        let servers = retry_transient(&self.retry, "enabled_servers_without_task", || {
            self.store.enabled_servers_without_task()
        })
        .await?;

        for server in &servers {
            let params = LaunchParameters::for_server(server, &self.settings);
            let hosted = match self.hosting.start_server_task(server, &params).await {
                Ok(hosted) => hosted,
                Err(e) => {
                    warn!(server_id = %server.id, error = %e, "Failed to start server task");
                    stats.start_failed += 1;
                    continue;
                }
            };

            if hosted.role.server_id() != Some(server.id) {
                error!(
                    server_id = %server.id,
                    task_identifier = %hosted.identifier,
                    "Started task reports a different server"
                );
                stats.start_failed += 1;
                continue;
            }

            let initiated = Utc::now();
            retry_transient(&self.retry, "record_started_task", || {
                self.store.record_started_task(&hosted, initiated)
            })
            .await?;
            info!(server_id = %server.id, task_identifier = %hosted.identifier, "Started server task");
            stats.started += 1;
        }

        let keep: BTreeSet<String> = retry_transient(&self.retry, "enabled_server_tasks", || {
            self.store.enabled_server_tasks()
        })
        .await?
        .into_iter()
        .map(|task| task.identifier)
        .collect();

        let grace = TimeDelta::from_std(self.settings.stale_task_grace).unwrap_or(TimeDelta::zero());
        let cutoff = Utc::now() - grace;
        let unused = retry_transient(&self.retry, "unused_server_tasks", || {
            self.store.unused_server_tasks(&keep, cutoff)
        })
        .await?;

        for task in unused {
            // A task never seen by a poll is not running yet, or never was.
            if task.seen.is_some() {
                if let Err(e) = self.hosting.stop_server_task(&task.identifier).await {
                    // The record stays so the stop is retried next pass.
                    warn!(task_identifier = %task.identifier, error = %e, "Failed to stop server task");
                    stats.stop_failed += 1;
                    continue;
                }
            }

            retry_transient(&self.retry, "delete_task", || self.store.delete_task(task.id)).await?;
            debug!(task_identifier = %task.identifier, "Removed unused server task");
            stats.stopped += 1;
        }

        Ok(stats)
    }
}
