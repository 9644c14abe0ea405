//! Trigger & priority service.
//!
//! Translates "a commit was pushed / a build was requested" into one
//! prioritized [`BuildJobQueueItem`] per build container, linked to a single
//! durable submission. The durable build-job row is always written before
//! the item becomes visible in the shared queue, so an agent can never claim
//! a job the durable store has not heard of.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use forgeci_cluster::ClusterStore;
use forgeci_core::job::{
    BuildConfig, BuildJobQueueItem, JobTimingInfo, RepositoryInfo, RepositoryType,
};
use forgeci_core::ports::{
    CommitResolver, ContainerConfig, GradingService, Participation,
};
use forgeci_core::{BuildJobId, Error, Priority};
use forgeci_db::{
    BuildJobRecord, BuildJobRepo, BuildStatisticsRepo, SubmissionRecord, SubmissionRepo,
};

use crate::{SchedulerError, SchedulerResult};

/// Estimation knobs, taken from the node configuration.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub default_build_duration: Duration,
    /// Multiplied onto the historical average so the estimate errs late.
    pub duration_safety_factor: f64,
}

impl From<&forgeci_config::BuildDurationSettings> for TriggerSettings {
    fn from(settings: &forgeci_config::BuildDurationSettings) -> Self {
        Self {
            default_build_duration: Duration::from_secs(settings.default_seconds),
            duration_safety_factor: settings.safety_factor,
        }
    }
}

/// One build request, as seen from a push hook, a manual trigger, a
/// build-all run, a missing-job retry or a chained template build.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub participation: Participation,
    /// Which repository the triggering push went to.
    pub triggered_by: RepositoryType,
    /// Instructor-requested "build all participations" run.
    pub build_all: bool,
    /// Reuse this commit instead of resolving the latest one (retries).
    pub assignment_commit_hash: Option<String>,
    /// Pin the test-suite commit (retries and chained template builds).
    pub test_commit_hash: Option<String>,
    pub retry_count: u32,
}

impl TriggerRequest {
    pub fn push(participation: Participation, triggered_by: RepositoryType) -> Self {
        Self {
            participation,
            triggered_by,
            build_all: false,
            assignment_commit_hash: None,
            test_commit_hash: None,
            retry_count: 0,
        }
    }
}

pub struct TriggerService {
    store: Arc<ClusterStore>,
    build_jobs: Arc<dyn BuildJobRepo>,
    submissions: Arc<dyn SubmissionRepo>,
    statistics: Arc<dyn BuildStatisticsRepo>,
    commits: Arc<dyn CommitResolver>,
    grading: Arc<dyn GradingService>,
    settings: TriggerSettings,
}

impl TriggerService {
    pub fn new(
        store: Arc<ClusterStore>,
        build_jobs: Arc<dyn BuildJobRepo>,
        submissions: Arc<dyn SubmissionRepo>,
        statistics: Arc<dyn BuildStatisticsRepo>,
        commits: Arc<dyn CommitResolver>,
        grading: Arc<dyn GradingService>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            store,
            build_jobs,
            submissions,
            statistics,
            commits,
            grading,
            settings,
        }
    }

    /// Enqueue the build jobs for one request: one queue item per container,
    /// all linked to the same durable submission.
    ///
    /// Returns the enqueued items; an empty vec means there was nothing to
    /// build yet (a repository without commits is a silent no-op).
    pub async fn trigger_build(
        &self,
        request: TriggerRequest,
    ) -> SchedulerResult<Vec<BuildJobQueueItem>> {
        let participation = &request.participation;
        let exercise = &participation.exercise;

        let Some(assignment_commit) = self
            .resolve_commit(
                request.assignment_commit_hash.clone(),
                &participation.repository_url,
            )
            .await?
        else {
            debug!(
                participation_id = participation.id,
                "assignment repository has no commits yet, nothing to build"
            );
            return Ok(Vec::new());
        };
        let Some(test_commit) = self
            .resolve_commit(
                request.test_commit_hash.clone(),
                &exercise.test_repository_url,
            )
            .await?
        else {
            debug!(
                participation_id = participation.id,
                "test repository has no commits yet, nothing to build"
            );
            return Ok(Vec::new());
        };

        if exercise.containers.is_empty() {
            return Err(SchedulerError::Core(Error::InvalidInput(format!(
                "exercise {} has no build containers configured",
                exercise.id
            ))));
        }

        let now = Utc::now();
        let priority = compute_priority(participation, request.build_all, now);
        let submission = self
            .get_or_create_submission(
                participation.id,
                &assignment_commit,
                now,
                exercise.containers.len() as u32,
            )
            .await?;

        if exercise.containers.len() > 1 {
            // A zero-score placeholder so the UI shows something before the
            // first container finishes.
            if let Err(e) = self
                .grading
                .create_placeholder_result(participation, submission.id)
                .await
            {
                warn!(
                    participation_id = participation.id,
                    error = %e,
                    "could not attach placeholder result"
                );
            }
        }

        let estimated_duration = self.estimated_build_duration(exercise.id).await;

        let mut items = Vec::with_capacity(exercise.containers.len());
        for container in &exercise.containers {
            let item = self.assemble_item(
                &request,
                container,
                &assignment_commit,
                &test_commit,
                priority,
                submission.id,
                estimated_duration,
                now,
            );

            // Write-before-publish: the durable row must exist before any
            // agent can observe the queue item.
            self.build_jobs
                .create(BuildJobRecord::queued_from(&item))
                .await?;
            self.store.build_job_queue().offer(item.clone()).await?;

            info!(
                job_id = %item.id,
                participation_id = participation.id,
                priority = %item.priority,
                "enqueued build job"
            );
            items.push(item);
        }
        Ok(items)
    }

    async fn resolve_commit(
        &self,
        pinned: Option<String>,
        repository_url: &url::Url,
    ) -> SchedulerResult<Option<String>> {
        if let Some(hash) = pinned {
            return Ok(Some(hash));
        }
        Ok(self.commits.latest_commit_hash(repository_url).await?)
    }

    /// Idempotent create-or-fetch: a concurrent creator of the same
    /// (participation, commit) submission is tolerated by re-reading.
    async fn get_or_create_submission(
        &self,
        participation_id: i64,
        commit_hash: &str,
        submission_date: DateTime<Utc>,
        container_count: u32,
    ) -> SchedulerResult<SubmissionRecord> {
        if let Some(existing) = self
            .submissions
            .find_by_participation_and_commit(participation_id, commit_hash)
            .await?
        {
            return Ok(existing);
        }

        match self
            .submissions
            .create(
                participation_id,
                commit_hash,
                submission_date,
                container_count,
            )
            .await
        {
            Ok(created) => Ok(created),
            Err(e) if e.is_duplicate() => {
                debug!(
                    participation_id,
                    commit_hash, "lost submission-create race, re-reading"
                );
                self.submissions
                    .find_by_participation_and_commit(participation_id, commit_hash)
                    .await?
                    .ok_or_else(|| {
                        SchedulerError::Database(forgeci_db::DbError::NotFound(format!(
                            "submission for participation {participation_id} at {commit_hash}"
                        )))
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn estimated_build_duration(&self, exercise_id: i64) -> Duration {
        let average_seconds = match self.statistics.find_by_exercise(exercise_id).await {
            Ok(Some(stats)) if stats.build_count > 0 => stats.average_duration_seconds as f64,
            Ok(_) => self.settings.default_build_duration.as_secs() as f64,
            Err(e) => {
                debug!(exercise_id, error = %e, "build statistics unavailable, using default");
                self.settings.default_build_duration.as_secs() as f64
            }
        };
        Duration::from_secs_f64(average_seconds * self.settings.duration_safety_factor)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_item(
        &self,
        request: &TriggerRequest,
        container: &ContainerConfig,
        assignment_commit: &str,
        test_commit: &str,
        priority: Priority,
        submission_id: i64,
        estimated_duration: Duration,
        now: DateTime<Utc>,
    ) -> BuildJobQueueItem {
        let participation = &request.participation;
        let exercise = &participation.exercise;
        let container_count = exercise.containers.len() as u32;

        let name = if container_count > 1 {
            format!(
                "{} / {} ({})",
                exercise.name, participation.owner_name, container.name
            )
        } else {
            format!("{} / {}", exercise.name, participation.owner_name)
        };

        let mut timing_info = JobTimingInfo::submitted_at(now);
        timing_info.estimated_duration_seconds = Some(estimated_duration.as_secs());
        timing_info.estimated_completion_date =
            Some(now + chrono::Duration::seconds(estimated_duration.as_secs() as i64));

        BuildJobQueueItem {
            id: BuildJobId::new(),
            name,
            build_agent: None,
            participation_id: participation.id,
            course_id: exercise.course_id,
            exercise_id: exercise.id,
            retry_count: request.retry_count,
            priority,
            status: None,
            repository_info: RepositoryInfo {
                repository_name: participation.repository_name.clone(),
                repository_type: participation.repository_type,
                triggered_by_push_to: request.triggered_by,
                assignment_repository_url: participation.repository_url.clone(),
                test_repository_url: exercise.test_repository_url.clone(),
            },
            timing_info,
            build_config: BuildConfig {
                docker_image: container.docker_image.clone(),
                build_script: container.build_script.clone(),
                assignment_commit_hash: assignment_commit.to_string(),
                test_commit_hash: test_commit.to_string(),
                container_id: if container_count > 1 {
                    Some(container.id)
                } else {
                    None
                },
                container_count,
                timeout_seconds: container.timeout_seconds,
            },
            result: None,
            submission_id: Some(submission_id),
        }
    }
}

/// Priority assignment, evaluated in order with the first matching rule
/// winning; the test-course penalty is applied on top.
pub fn compute_priority(
    participation: &Participation,
    build_all: bool,
    now: DateTime<Utc>,
) -> Priority {
    let exercise = &participation.exercise;
    let exam_in_progress = exercise
        .exam
        .as_ref()
        .is_some_and(|exam| exam.is_in_progress(now));
    let test_exam = exercise.exam.as_ref().is_some_and(|exam| exam.test_exam);
    let after_due_date = exercise.due_date.is_some_and(|due| now > due);

    let base = if build_all {
        Priority::BUILD_ALL
    } else if exam_in_progress && (test_exam || participation.test_run) {
        Priority::EXAM_ELEVATED
    } else if after_due_date && participation.practice_mode {
        Priority::PRACTICE
    } else if exam_in_progress {
        Priority::EXAM_CONDUCTION
    } else if !exercise.included_in_score {
        Priority::UNGRADED
    } else {
        Priority::NORMAL
    };

    if exercise.course_is_test_course {
        base.with_test_course_penalty()
    } else {
        base
    }
}
