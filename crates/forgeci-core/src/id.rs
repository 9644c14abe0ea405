//! Build-job identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a build job.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BuildJobId(Uuid);

impl BuildJobId {
    /// Create a new unique BuildJobId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a BuildJobId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BuildJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BuildJobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BuildJobId> for Uuid {
    fn from(id: BuildJobId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildJobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
