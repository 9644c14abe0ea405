//! Durable build-job lifecycle status.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a build job as recorded in durable storage.
///
/// `Missing` is a recoverable dead-letter state, not a terminal one: the
/// missing-job retrier may re-trigger such a job until its retry budget is
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Building,
    Successful,
    Failed,
    Cancelled,
    Missing,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Successful | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    /// Statuses for which the job is expected to be visible in the shared
    /// queue or processing map.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BuildStatus::Queued | BuildStatus::Building)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Successful => "SUCCESSFUL",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Cancelled => "CANCELLED",
            BuildStatus::Missing => "MISSING",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(BuildStatus::Queued),
            "BUILDING" => Ok(BuildStatus::Building),
            "SUCCESSFUL" => Ok(BuildStatus::Successful),
            "FAILED" => Ok(BuildStatus::Failed),
            "CANCELLED" => Ok(BuildStatus::Cancelled),
            "MISSING" => Ok(BuildStatus::Missing),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}
