//! # areaplane-id
//!
//! Typed ID types for the world model managed by areaplane.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the persistence store (monotonic `BIGSERIAL` keys)
//! - IDs are typed so a `ServerId` can never be passed where an `AreaId` is expected
//! - The canonical string form is the bare decimal number, because server ids
//!   are embedded in hostnames (`42-server.example.com`) and launch parameters
//!   (`SERVER_ID=42`)
//! - Parsing is strict: empty, non-numeric and non-positive values are rejected
//!
//! ## Example
//!
//! ```
//! use areaplane_id::ServerId;
//!
//! let id: ServerId = "42".parse().unwrap();
//! assert_eq!(id.get(), 42);
//! assert_eq!(id.to_string(), "42");
//! ```

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
