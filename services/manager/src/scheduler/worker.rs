//! Scheduler background worker.
//!
//! Spawns one loop per registered job and runs until shutdown is signaled.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use areaplane_events::{topics, DomainEvent, EventEnvelope};
use futures_util::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::jobs::{JobName, JobSpec, JobTable};
use crate::publisher::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
}

/// Result of one trigger of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The run finished and its events were handed to the publisher.
    Completed { events: usize },
    /// The handler returned an error or panicked.
    Failed(String),
    /// The previous run was still in flight.
    Skipped,
}

/// A registered job together with its re-entrancy guard.
pub struct Job {
    name: JobName,
    spec: JobSpec,
    gate: Mutex<()>,
    running: AtomicBool,
    publisher: Arc<dyn EventPublisher>,
    source: String,
}

impl Job {
    pub fn new(
        name: JobName,
        spec: JobSpec,
        publisher: Arc<dyn EventPublisher>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name,
            spec,
            gate: Mutex::new(()),
            running: AtomicBool::new(false),
            publisher,
            source: source.into(),
        }
    }

    pub fn name(&self) -> JobName {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.spec.interval
    }

    pub fn state(&self) -> JobState {
        if self.running.load(Ordering::Acquire) {
            JobState::Running
        } else {
            JobState::Idle
        }
    }

    /// Runs the job once unless a run is already in flight.
    #[instrument(skip(self), fields(job = %self.name))]
    pub async fn run_once(&self) -> JobOutcome {
        let Ok(_guard) = self.gate.try_lock() else {
            debug!("Previous run still in flight, skipping trigger");
            return JobOutcome::Skipped;
        };

        self.running.store(true, Ordering::Release);
        let handler = self.spec.handler.clone();
        let result = AssertUnwindSafe(async move { handler().await })
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(events)) => {
                let count = events.len();
                self.fan_out(events).await;
                JobOutcome::Completed { events: count }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Job failed");
                JobOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Job panicked");
                JobOutcome::Failed(message)
            }
        };

        self.running.store(false, Ordering::Release);
        outcome
    }

    async fn fan_out(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }

        // One correlation id per run.
        let correlation = Uuid::now_v7().to_string();
        for event in events {
            let envelope = EventEnvelope::wrap(event, self.source.clone(), Some(correlation.clone()));
            match self.publisher.publish(topics::EVENTS, &envelope).await {
                Ok(()) => debug!(
                    event_type = %envelope.event_type,
                    message_id = %envelope.message_id,
                    "Published event"
                ),
                Err(e) => warn!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to publish event"
                ),
            }
        }
    }

    /// Triggers the job on its interval until shutdown is signaled.
    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.spec.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(job = %self.name, "Job loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Runs every job of a [`JobTable`].
pub struct SchedulerWorker {
    jobs: Vec<Arc<Job>>,
}

impl SchedulerWorker {
    /// `source` names this manager instance in published envelopes.
    pub fn new(table: JobTable, publisher: Arc<dyn EventPublisher>, source: &str) -> Self {
        let jobs = table
            .into_jobs()
            .map(|(name, spec)| Arc::new(Job::new(name, spec, publisher.clone(), source)))
            .collect();
        Self { jobs }
    }

    pub fn job(&self, name: JobName) -> Option<Arc<Job>> {
        self.jobs.iter().find(|job| job.name == name).cloned()
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), "Starting scheduler worker");

        let mut loops = JoinSet::new();
        for job in &self.jobs {
            info!(
                job = %job.name,
                interval_ms = job.interval().as_millis() as u64,
                "Scheduling job"
            );
            loops.spawn(job.clone().run_loop(shutdown.clone()));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job loop terminated abnormally");
            }
        }

        info!("Scheduler worker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManagerError;
    use crate::publisher::BroadcastPublisher;
    use areaplane_events::WorldUpdatedPayload;
    use areaplane_id::Version;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn world_event(version: i64) -> DomainEvent {
        DomainEvent::WorldUpdated(WorldUpdatedPayload {
            version: Version::new(version),
            manager_hosts: BTreeSet::new(),
            kiosk_hosts: BTreeSet::new(),
        })
    }

    fn job(table: &JobTable, name: JobName, publisher: Arc<dyn EventPublisher>) -> Job {
        Job::new(name, table.get(name).unwrap().clone(), publisher, "manager-test")
    }

    #[tokio::test]
    async fn test_completed_run_publishes_events() {
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let mut rx = publisher.subscribe();
        let mut table = JobTable::new();
        table.insert(JobName::RefreshTasks, Duration::from_secs(1), || {
            Box::pin(async { Ok(vec![world_event(1), world_event(2)]) })
        });
        let job = job(&table, JobName::RefreshTasks, publisher.clone());

        assert_eq!(job.run_once().await, JobOutcome::Completed { events: 2 });

        let (topic, first) = rx.recv().await.unwrap();
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(topic, topics::EVENTS);
        assert_eq!(first.source, "manager-test");
        assert!(first.correlation_id.is_some());
        assert_eq!(first.correlation_id, second.correlation_id);
        assert_eq!(job.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn test_failed_run_publishes_nothing() {
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let mut rx = publisher.subscribe();
        let mut table = JobTable::new();
        table.insert(JobName::AllocateServers, Duration::from_secs(1), || {
            Box::pin(async { Err(ManagerError::Validation("bad".to_string())) })
        });
        let job = job(&table, JobName::AllocateServers, publisher.clone());

        assert!(matches!(job.run_once().await, JobOutcome::Failed(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_run_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = JobTable::new();
        let counter = calls.clone();
        table.insert(JobName::ManageTaskDomains, Duration::from_secs(1), move || {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(Vec::new())
            })
        });
        let job = job(
            &table,
            JobName::ManageTaskDomains,
            Arc::new(BroadcastPublisher::new(4)),
        );

        assert_eq!(job.run_once().await, JobOutcome::Failed("boom".to_string()));
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.run_once().await, JobOutcome::Completed { events: 0 });
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let release = Arc::new(Notify::new());
        let mut table = JobTable::new();
        let gate = release.clone();
        table.insert(JobName::AllocateServerTasks, Duration::from_secs(1), move || {
            let gate = gate.clone();
            Box::pin(async move {
                gate.notified().await;
                Ok(Vec::new())
            })
        });
        let job = Arc::new(job(
            &table,
            JobName::AllocateServerTasks,
            Arc::new(BroadcastPublisher::new(4)),
        ));

        let first = tokio::spawn({
            let job = job.clone();
            async move { job.run_once().await }
        });
        while job.state() != JobState::Running {
            tokio::task::yield_now().await;
        }

        assert_eq!(job.run_once().await, JobOutcome::Skipped);

        release.notify_one();
        assert_eq!(first.await.unwrap(), JobOutcome::Completed { events: 0 });
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_until_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = JobTable::new();
        let counter = calls.clone();
        table.insert(JobName::RefreshTasks, Duration::from_millis(10), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
        });
        let worker = Arc::new(SchedulerWorker::new(
            table,
            Arc::new(BroadcastPublisher::new(4)),
            "manager-test",
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown_rx).await }
        });
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(worker.job(JobName::RefreshTasks).is_some());
    }
}
