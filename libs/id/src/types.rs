//! Typed ID definitions and the store version token.
//!
//! Uids are ULID-based for sortability and uniqueness. A job uid changes when
//! a job is deleted and recreated under the same key, which is how units left
//! behind by a previous incarnation are told apart.

use crate::define_id;

// =============================================================================
// Jobs and Worker Units
// =============================================================================

define_id!(JobUid, "job");
define_id!(UnitId, "wu");

// =============================================================================
// Resource Version
// =============================================================================

/// Optimistic-concurrency token for a stored job object.
///
/// Every successful write produces a strictly greater version. A writer must
/// present the version it read; a mismatch means someone else wrote first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version of a freshly created object.
    pub const INITIAL: Self = Self(1);

    /// Creates a version from its raw value.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl From<ResourceVersion> for u64 {
    fn from(version: ResourceVersion) -> Self {
        version.0
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = u64::deserialize(deserializer)?;
        Ok(Self(version))
    }
}

// =============================================================================
// Tests
// =============================================================================
