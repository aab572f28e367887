//! Typed ID definitions for the world model.

use crate::define_id;

// =============================================================================
// World Model
// =============================================================================

define_id!(RegionId, "region");
define_id!(AreaId, "area");
define_id!(ServerId, "server");

// =============================================================================
// Hosting
// =============================================================================

define_id!(TaskId, "task");

// =============================================================================
// Optimistic Version
// =============================================================================

/// Optimistic-lock version of a stored row.
///
/// Every successful write increments the version; a write carrying a stale
/// version is rejected by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(i64);

impl Version {
    /// The version of a freshly inserted row.
    pub const INITIAL: Self = Self(0);

    /// Creates a version from a raw column value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns the version that a successful write produces.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Ok(Self(value))
    }
}

// =============================================================================
// Tests
// =============================================================================
