//! # areaplane-events
//!
//! Domain event definitions and serialization for the areaplane world manager.
//!
//! ## Design Principles
//!
//! - Events are emitted only when a reconciliation step changed observable state
//! - Events carry the full current view of the changed entity, so subscribers
//!   never need to merge partial updates
//! - Delivery is best-effort; the store remains the source of truth
//! - Events are versioned for schema evolution
//!
//! ## Event Envelope
//!
//! Every published event is wrapped in an [`EventEnvelope`] with:
//! - A UUIDv7 message id (time ordered, unique per publish)
//! - The event type name and schema version
//! - The publishing manager instance (`source`)
//!
//! ## Event Types
//!
//! - Server events (`server.updated`)
//! - World events (`world.updated`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
