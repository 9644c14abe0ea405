//! Build-job queue and result types.
//!
//! These types are the wire contract between the lifecycle manager and the
//! external build agents: they are serialized into the shared cluster
//! structures and must remain backwards compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::agent::BuildAgent;
use crate::{BuildJobId, BuildStatus, Priority};

/// The kind of repository a build or a push refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepositoryType {
    /// A student/team assignment repository.
    User,
    Template,
    Solution,
    Tests,
    Auxiliary,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryType::User => "USER",
            RepositoryType::Template => "TEMPLATE",
            RepositoryType::Solution => "SOLUTION",
            RepositoryType::Tests => "TESTS",
            RepositoryType::Auxiliary => "AUXILIARY",
        }
    }
}

impl std::fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RepositoryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "USER" => Ok(RepositoryType::User),
            "TEMPLATE" => Ok(RepositoryType::Template),
            "SOLUTION" => Ok(RepositoryType::Solution),
            "TESTS" => Ok(RepositoryType::Tests),
            "AUXILIARY" => Ok(RepositoryType::Auxiliary),
            other => Err(format!("unknown repository type: {other}")),
        }
    }
}

/// Repository metadata carried by a queued job.
///
/// The clone URLs are only meant for build agents; sanitized views for
/// dashboard subscribers must strip them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub repository_name: String,
    pub repository_type: RepositoryType,
    /// Which repository the triggering push went to. Drives the chained
    /// template build after a solution build of a tests/auxiliary push.
    pub triggered_by_push_to: RepositoryType,
    pub assignment_repository_url: Url,
    pub test_repository_url: Url,
}

/// Timing bookkeeping for a job. The estimate fields are UI hints only and
/// never feed back into scheduling decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimingInfo {
    pub submission_date: DateTime<Utc>,
    /// Set by the build agent when the job is claimed.
    pub build_start_date: Option<DateTime<Utc>>,
    pub build_completion_date: Option<DateTime<Utc>>,
    pub estimated_completion_date: Option<DateTime<Utc>>,
    pub estimated_duration_seconds: Option<u64>,
}

impl JobTimingInfo {
    pub fn submitted_at(submission_date: DateTime<Utc>) -> Self {
        Self {
            submission_date,
            build_start_date: None,
            build_completion_date: None,
            estimated_completion_date: None,
            estimated_duration_seconds: None,
        }
    }
}

/// The already-resolved, per-container build configuration. Script and image
/// generation happen outside this crate; the payload is consumed opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub docker_image: String,
    pub build_script: String,
    pub assignment_commit_hash: String,
    pub test_commit_hash: String,
    /// Identity of the container config this job builds; `None` for
    /// single-container exercises.
    pub container_id: Option<i64>,
    /// How many containers fan out for the same submission.
    pub container_count: u32,
    pub timeout_seconds: u64,
}

/// Compact outcome summary attached to a finished queue item for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub successful: bool,
    pub score: f64,
    pub passed_tests: u32,
    pub total_tests: u32,
}

/// One build job as it travels through the shared queue and processing map.
///
/// Immutable once created, except for the fields rewritten when the item
/// moves between structures: the agent assignment on claim and the status on
/// completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJobQueueItem {
    pub id: BuildJobId,
    /// Human-readable display name, e.g. "exercise-42 / student-7".
    pub name: String,
    /// The agent that claimed the job; `None` while queued.
    pub build_agent: Option<BuildAgent>,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub retry_count: u32,
    pub priority: Priority,
    /// `None` while queued or processing; set when the job completes.
    pub status: Option<BuildStatus>,
    pub repository_info: RepositoryInfo,
    pub timing_info: JobTimingInfo,
    pub build_config: BuildConfig,
    pub result: Option<ResultSummary>,
    /// Durable submission shared by all containers building the same commit.
    pub submission_id: Option<i64>,
}

/// A single line of build output reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogLine {
    pub time: DateTime<Utc>,
    pub log: String,
}

/// Raw outcome of one container build, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub branch: String,
    pub assignment_commit_hash: String,
    pub test_commit_hash: String,
    pub build_run_date: DateTime<Utc>,
    /// Whether the build tool itself completed without error.
    pub successful: bool,
    pub passed_tests: u32,
    pub failed_tests: u32,
}

impl BuildResult {
    pub fn total_tests(&self) -> u32 {
        self.passed_tests + self.failed_tests
    }
}

/// Failure cause attached to a result item, used to distinguish cooperative
/// cancellation from a genuine failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildExceptionCause {
    /// The job was cancelled cooperatively via the cancel topic.
    JobCancelled { job_id: BuildJobId },
    Other { description: String },
}

/// An error reported by the build agent alongside a result item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildException {
    pub message: String,
    pub cause: Option<BuildExceptionCause>,
}

impl BuildException {
    /// True when this exception represents the cancellation of exactly the
    /// given job.
    pub fn is_cancellation_of(&self, job_id: &BuildJobId) -> bool {
        matches!(&self.cause, Some(BuildExceptionCause::JobCancelled { job_id: cancelled }) if cancelled == job_id)
    }
}

/// One entry of the shared result queue: the originating job, the outcome
/// payload, the collected logs, and an optional failure cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultQueueItem {
    pub build_job: BuildJobQueueItem,
    pub build_result: BuildResult,
    pub build_logs: Vec<BuildLogLine>,
    pub exception: Option<BuildException>,
}
