//! Reconcilers of hosting tasks.
//!
//! - [`TaskRefreshService`] mirrors the provider's running tasks into the
//!   store and keeps the world host sets current
//! - [`ServerTaskAllocator`] starts a task for every enabled server and stops
//!   tasks nobody uses
//! - [`TaskDomainReconciler`] gives tasks with a public address a DNS name
//!
//! Provider and DNS calls are made outside of any retried store unit of
//! work, so a store retry never repeats an external call.

mod domains;
mod refresh;
mod server_tasks;

pub use domains::{canonical_domain, TaskDomainReconciler};
pub use refresh::TaskRefreshService;
pub use server_tasks::{ServerTaskAllocator, ServerTaskStats};
