//! Server allocation.
//!
//! [`AreaGroupingService`] partitions a region's areas, [`ServerAllocator`]
//! maps the groups onto servers and [`AllocationPlan`] is what it hands to
//! the store.

mod allocator;
mod grouping;
mod plan;

pub use allocator::{AllocationStats, ServerAllocator, ServerStarted};
pub use grouping::{AreaGroup, AreaGroupingService};
pub use plan::{AllocationPlan, PlannedServer, ServerChange, ServerKey};
