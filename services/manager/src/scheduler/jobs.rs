use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use areaplane_events::DomainEvent;
use futures_util::future::BoxFuture;

use crate::allocation::ServerAllocator;
use crate::config::SchedulerConfig;
use crate::error::ManagerResult;
use crate::tasks::{ServerTaskAllocator, TaskDomainReconciler, TaskRefreshService};

/// Future returned by a job handler.
pub type JobFuture = BoxFuture<'static, ManagerResult<Vec<DomainEvent>>>;

/// Starts one run of a job.
pub type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Identity of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobName {
    AllocateServers,
    AllocateServerTasks,
    RefreshTasks,
    ManageTaskDomains,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::AllocateServers => "allocate-servers",
            JobName::AllocateServerTasks => "allocate-server-tasks",
            JobName::RefreshTasks => "refresh-tasks",
            JobName::ManageTaskDomains => "manage-task-domains",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct JobSpec {
    pub interval: Duration,
    pub handler: JobHandler,
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Job name to interval and handler.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobName, JobSpec>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing an earlier registration.
    pub fn insert<F>(&mut self, name: JobName, interval: Duration, handler: F) -> &mut Self
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        self.jobs.insert(
            name,
            JobSpec {
                interval,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn get(&self, name: JobName) -> Option<&JobSpec> {
        self.jobs.get(&name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn into_jobs(self) -> impl Iterator<Item = (JobName, JobSpec)> {
        self.jobs.into_iter()
    }

    /// The four reconciliation jobs of the manager.
    ///
    /// `allocate-servers` reports `Completed` when at least one region
    /// committed, even if other regions exhausted their retries; those are
    /// logged per region and re-planned on the next tick. It reports a
    /// failure only when no region could be allocated.
    pub fn reconciliation(
        config: &SchedulerConfig,
        allocator: Arc<ServerAllocator>,
        server_tasks: Arc<ServerTaskAllocator>,
        refresh: Arc<TaskRefreshService>,
        domains: Arc<TaskDomainReconciler>,
    ) -> Self {
        let mut table = Self::new();
        table
            .insert(JobName::AllocateServers, config.allocate_servers_interval, move || {
                let allocator = allocator.clone();
                Box::pin(async move { allocator.allocate_servers().await })
            })
            .insert(
                JobName::AllocateServerTasks,
                config.allocate_server_tasks_interval,
                move || {
                    let server_tasks = server_tasks.clone();
                    Box::pin(async move { server_tasks.allocate_server_tasks().await })
                },
            )
            .insert(JobName::RefreshTasks, config.refresh_tasks_interval, move || {
                let refresh = refresh.clone();
                Box::pin(async move { refresh.refresh_tasks().await })
            })
            .insert(
                JobName::ManageTaskDomains,
                config.manage_task_domains_interval,
                move || {
                    let domains = domains.clone();
                    Box::pin(async move { domains.manage_task_domains().await })
                },
            );
        table
    }
}
