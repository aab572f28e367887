//! Reconciliation scheduler.
//!
//! Every job of the [`JobTable`] runs on its own fixed interval. A job never
//! overlaps itself: a trigger arriving while the previous run is still in
//! flight is dropped, and ticks missed because of an overrun are skipped
//! rather than replayed. Events returned by a run are published after the
//! run completes.

mod jobs;
mod worker;

pub use jobs::{JobFuture, JobHandler, JobName, JobSpec, JobTable};
pub use worker::{Job, JobOutcome, JobState, SchedulerWorker};
