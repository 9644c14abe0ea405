//! Collaborator ports.
//!
//! The lifecycle manager consumes its surroundings (VCS, grading, entity
//! lookup, notification delivery, websocket transport) through these narrow
//! traits. Production implementations live in the host application; tests use
//! in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::job::{BuildLogLine, BuildResult, RepositoryType};
use crate::{BuildJobId, Result};

/// Exam window of an exercise, when it belongs to one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamInfo {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Test exams never count towards a grade and queue at reduced urgency.
    pub test_exam: bool,
}

impl ExamInfo {
    pub fn is_in_progress(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now <= self.end_date
    }
}

/// One resolved build-container configuration of an exercise. Script and
/// image generation are external; this payload arrives ready to use.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub id: i64,
    pub name: String,
    pub docker_image: String,
    pub build_script: String,
    pub timeout_seconds: u64,
}

/// The slice of exercise state the lifecycle manager needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExerciseInfo {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
    pub test_repository_url: Url,
    pub due_date: Option<DateTime<Utc>>,
    pub included_in_score: bool,
    pub exam: Option<ExamInfo>,
    /// Courses flagged as test/sandbox courses queue behind real courses.
    pub course_is_test_course: bool,
    pub containers: Vec<ContainerConfig>,
}

/// A participation: one (student or reference) repository working on an
/// exercise.
#[derive(Debug, Clone, PartialEq)]
pub struct Participation {
    pub id: i64,
    pub exercise: ExerciseInfo,
    pub repository_name: String,
    pub repository_type: RepositoryType,
    pub repository_url: Url,
    pub owner_name: String,
    /// Submission after the due date in practice mode.
    pub practice_mode: bool,
    /// Exam test-run by an instructor.
    pub test_run: bool,
}

/// A graded outcome produced by the grading collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedResult {
    pub id: i64,
    pub score: f64,
    pub successful: bool,
    pub completion_date: DateTime<Utc>,
}

/// Resolves the latest commit of a repository.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    /// Latest commit hash on the default branch, or `None` when the
    /// repository has no commits yet.
    async fn latest_commit_hash(&self, repository_url: &Url) -> Result<Option<String>>;
}

/// Looks up participations and exercises owned by the host application.
#[async_trait]
pub trait ParticipationLookup: Send + Sync {
    /// `None` when the participation has been deleted in the meantime.
    async fn find_participation(&self, participation_id: i64) -> Result<Option<Participation>>;

    /// The template participation of an exercise, used for chained builds
    /// after a solution build of a tests/auxiliary push.
    async fn find_template_participation(&self, exercise_id: i64) -> Result<Option<Participation>>;
}

/// Computes graded results from raw build outcomes.
#[async_trait]
pub trait GradingService: Send + Sync {
    async fn process_build_result(
        &self,
        participation: &Participation,
        build_result: &BuildResult,
    ) -> Result<GradedResult>;

    /// A zero-score placeholder shown while the remaining containers of a
    /// multi-container build are still running.
    async fn create_placeholder_result(
        &self,
        participation: &Participation,
        submission_id: i64,
    ) -> Result<GradedResult>;
}

/// Delivers user- and admin-facing notifications. Implementations must
/// return promptly (hand off to their own transport) so notification
/// dispatch never blocks result draining.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_new_result(
        &self,
        participation: &Participation,
        result: &GradedResult,
    ) -> Result<()>;

    async fn notify_submission_error(
        &self,
        participation: &Participation,
        message: &str,
    ) -> Result<()>;

    async fn notify_agent_self_paused(
        &self,
        agent_name: &str,
        consecutive_failures: u32,
    ) -> Result<()>;
}

/// Persists build logs of finished jobs.
#[async_trait]
pub trait BuildLogSink: Send + Sync {
    async fn save_build_logs(&self, build_job_id: &BuildJobId, logs: &[BuildLogLine])
    -> Result<()>;
}

/// Pushes a sanitized payload to a named fan-out channel. The transport
/// (websocket session handling, STOMP, ...) is owned by the host application;
/// delivery is fire-and-forget.
pub trait Broadcaster: Send + Sync {
    fn send(&self, destination: &str, payload: serde_json::Value);
}
