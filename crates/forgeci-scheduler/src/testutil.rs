//! In-memory fakes and fixtures shared by the service tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use url::Url;

use forgeci_cluster::{ClusterProvider, ClusterStore, MemoryProvider};
use forgeci_core::agent::{BuildAgent, BuildAgentInformation, BuildAgentStatus};
use forgeci_core::job::{
    BuildJobQueueItem, BuildLogLine, BuildResult, RepositoryType, ResultQueueItem,
};
use forgeci_core::ports::{
    Broadcaster, BuildLogSink, CommitResolver, ContainerConfig, ExerciseInfo, GradedResult,
    GradingService, NotificationService, Participation, ParticipationLookup,
};
use forgeci_core::{BuildJobId, BuildStatus, Error, Result};
use forgeci_db::{
    BuildJobRecord, BuildJobSearchFilter, BuildJobSearchPage, BuildJobSortColumn,
    BuildStatisticsRecord, DbError, DbResult, SubmissionRecord,
};

pub use forgeci_db::{BuildJobRepo, BuildStatisticsRepo, SubmissionRepo};

use crate::fanout::FanoutService;
use crate::management::QueueManagementService;
use crate::missing::{MissingJobService, MissingJobSettings};
use crate::results::ResultProcessingService;
use crate::trigger::{TriggerRequest, TriggerService, TriggerSettings};

// ---------------------------------------------------------------------------
// In-memory repositories
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBuildJobRepo {
    rows: Mutex<HashMap<uuid::Uuid, BuildJobRecord>>,
}

impl MemoryBuildJobRepo {
    pub fn set_submission_date(&self, job_id: &BuildJobId, date: DateTime<Utc>) {
        if let Some(row) = self.rows.lock().get_mut(job_id.as_uuid()) {
            row.build_submission_date = date;
        }
    }

    pub fn set_retry_count(&self, job_id: &BuildJobId, retry_count: u32) {
        if let Some(row) = self.rows.lock().get_mut(job_id.as_uuid()) {
            row.retry_count = retry_count as i32;
        }
    }
}

#[async_trait]
impl BuildJobRepo for MemoryBuildJobRepo {
    async fn create(&self, record: BuildJobRecord) -> DbResult<BuildJobRecord> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&record.build_job_id) {
            return Err(DbError::Duplicate(format!(
                "build job {}",
                record.build_job_id
            )));
        }
        rows.insert(record.build_job_id, record.clone());
        Ok(record)
    }

    async fn find_by_job_id(&self, build_job_id: &BuildJobId) -> DbResult<Option<BuildJobRecord>> {
        Ok(self.rows.lock().get(build_job_id.as_uuid()).cloned())
    }

    async fn update_status(
        &self,
        build_job_id: &BuildJobId,
        status: BuildStatus,
        completion_date: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(build_job_id.as_uuid())
            .ok_or_else(|| DbError::NotFound(format!("build job {build_job_id}")))?;
        row.build_status = status.as_str().to_string();
        if completion_date.is_some() {
            row.build_completion_date = completion_date;
        }
        Ok(())
    }

    async fn mark_building(
        &self,
        build_job_id: &BuildJobId,
        build_start_date: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.get_mut(build_job_id.as_uuid()) {
            if row.build_status == BuildStatus::Queued.as_str() {
                row.build_status = BuildStatus::Building.as_str().to_string();
                row.build_start_date = Some(build_start_date);
            }
        }
        Ok(())
    }

    async fn increment_retry_count(&self, build_job_id: &BuildJobId) -> DbResult<()> {
        if let Some(row) = self.rows.lock().get_mut(build_job_id.as_uuid()) {
            row.retry_count += 1;
        }
        Ok(())
    }

    async fn find_in_flight_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<BuildJobRecord>> {
        let mut records: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|row| {
                matches!(
                    row.status(),
                    Some(BuildStatus::Queued) | Some(BuildStatus::Building)
                ) && row.build_submission_date < cutoff
            })
            .cloned()
            .collect();
        records.sort_by_key(|row| row.build_submission_date);
        Ok(records)
    }

    async fn find_missing_submitted_after(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<BuildJobRecord>> {
        let mut records: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|row| {
                row.status() == Some(BuildStatus::Missing) && row.build_submission_date >= since
            })
            .cloned()
            .collect();
        records.sort_by_key(|row| row.build_submission_date);
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn search(&self, filter: &BuildJobSearchFilter) -> DbResult<BuildJobSearchPage> {
        let mut matches: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|row| {
                filter
                    .build_status
                    .is_none_or(|status| row.build_status == status.as_str())
                    && filter.course_id.is_none_or(|id| row.course_id == id)
                    && filter.exercise_id.is_none_or(|id| row.exercise_id == id)
                    && filter
                        .participation_id
                        .is_none_or(|id| row.participation_id == id)
                    && filter
                        .build_agent_name
                        .as_ref()
                        .is_none_or(|name| row.build_agent_name.as_ref() == Some(name))
                    && filter
                        .submitted_after
                        .is_none_or(|after| row.build_submission_date >= after)
                    && filter
                        .submitted_before
                        .is_none_or(|before| row.build_submission_date <= before)
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                BuildJobSortColumn::SubmissionDate => {
                    a.build_submission_date.cmp(&b.build_submission_date)
                }
                BuildJobSortColumn::CompletionDate => {
                    a.build_completion_date.cmp(&b.build_completion_date)
                }
                BuildJobSortColumn::Status => a.build_status.cmp(&b.build_status),
            };
            if filter.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total = matches.len() as i64;
        let records = matches
            .into_iter()
            .skip((filter.page * filter.page_size) as usize)
            .take(filter.page_size as usize)
            .collect();
        Ok(BuildJobSearchPage { records, total })
    }
}

pub struct MemorySubmissionRepo {
    rows: Mutex<Vec<SubmissionRecord>>,
    next_id: AtomicI64,
    race_once: AtomicBool,
}

impl Default for MemorySubmissionRepo {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            race_once: AtomicBool::new(false),
        }
    }
}

impl MemorySubmissionRepo {
    pub fn count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn first_id(&self) -> Option<i64> {
        self.rows.lock().first().map(|row| row.id)
    }

    /// Make the next create lose against a simulated concurrent creator.
    pub fn inject_create_race(&self) {
        self.race_once.store(true, Ordering::SeqCst);
    }

    fn insert(
        &self,
        participation_id: i64,
        commit_hash: &str,
        submission_date: DateTime<Utc>,
        expected_container_count: u32,
    ) -> SubmissionRecord {
        let record = SubmissionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            participation_id,
            commit_hash: commit_hash.to_string(),
            submission_date,
            expected_container_count: expected_container_count as i32,
        };
        self.rows.lock().push(record.clone());
        record
    }
}

#[async_trait]
impl SubmissionRepo for MemorySubmissionRepo {
    async fn find_by_participation_and_commit(
        &self,
        participation_id: i64,
        commit_hash: &str,
    ) -> DbResult<Option<SubmissionRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|row| row.participation_id == participation_id && row.commit_hash == commit_hash)
            .cloned())
    }

    async fn create(
        &self,
        participation_id: i64,
        commit_hash: &str,
        submission_date: DateTime<Utc>,
        expected_container_count: u32,
    ) -> DbResult<SubmissionRecord> {
        if self.race_once.swap(false, Ordering::SeqCst) {
            // A concurrent node inserted the same submission first.
            self.insert(
                participation_id,
                commit_hash,
                submission_date,
                expected_container_count,
            );
            return Err(DbError::Duplicate(format!(
                "submission for participation {participation_id}"
            )));
        }
        let exists = self
            .find_by_participation_and_commit(participation_id, commit_hash)
            .await?
            .is_some();
        if exists {
            return Err(DbError::Duplicate(format!(
                "submission for participation {participation_id}"
            )));
        }
        Ok(self.insert(
            participation_id,
            commit_hash,
            submission_date,
            expected_container_count,
        ))
    }
}

#[derive(Default)]
pub struct MemoryStatisticsRepo {
    rows: Mutex<HashMap<i64, BuildStatisticsRecord>>,
}

#[async_trait]
impl BuildStatisticsRepo for MemoryStatisticsRepo {
    async fn find_by_exercise(
        &self,
        exercise_id: i64,
    ) -> DbResult<Option<BuildStatisticsRecord>> {
        Ok(self.rows.lock().get(&exercise_id).cloned())
    }

    async fn record_build_duration(
        &self,
        exercise_id: i64,
        duration_seconds: i64,
    ) -> DbResult<()> {
        let mut rows = self.rows.lock();
        let entry = rows.entry(exercise_id).or_insert(BuildStatisticsRecord {
            exercise_id,
            average_duration_seconds: 0,
            build_count: 0,
        });
        entry.average_duration_seconds = (entry.average_duration_seconds * entry.build_count
            + duration_seconds)
            / (entry.build_count + 1);
        entry.build_count += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCommitResolver {
    commits: Mutex<HashMap<String, String>>,
}

impl FakeCommitResolver {
    pub fn set_commit(&self, repository_url: &Url, hash: &str) {
        self.commits
            .lock()
            .insert(repository_url.to_string(), hash.to_string());
    }
}

#[async_trait]
impl CommitResolver for FakeCommitResolver {
    async fn latest_commit_hash(&self, repository_url: &Url) -> Result<Option<String>> {
        Ok(self.commits.lock().get(repository_url.as_str()).cloned())
    }
}

#[derive(Default)]
pub struct FakeParticipationLookup {
    participations: Mutex<HashMap<i64, Participation>>,
    templates: Mutex<HashMap<i64, Participation>>,
}

impl FakeParticipationLookup {
    pub fn register(&self, participation: Participation) {
        self.participations
            .lock()
            .insert(participation.id, participation);
    }

    pub fn register_template(&self, exercise_id: i64, participation: Participation) {
        self.templates.lock().insert(exercise_id, participation);
    }
}

#[async_trait]
impl ParticipationLookup for FakeParticipationLookup {
    async fn find_participation(&self, participation_id: i64) -> Result<Option<Participation>> {
        Ok(self.participations.lock().get(&participation_id).cloned())
    }

    async fn find_template_participation(
        &self,
        exercise_id: i64,
    ) -> Result<Option<Participation>> {
        Ok(self.templates.lock().get(&exercise_id).cloned())
    }
}

pub struct FakeGradingService {
    graded: Mutex<Vec<i64>>,
    placeholders: Mutex<Vec<i64>>,
    fail: AtomicBool,
    next_id: AtomicI64,
}

impl Default for FakeGradingService {
    fn default() -> Self {
        Self {
            graded: Mutex::new(Vec::new()),
            placeholders: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
        }
    }
}

impl FakeGradingService {
    pub fn graded_count(&self) -> usize {
        self.graded.lock().len()
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.lock().len()
    }

    pub fn fail_processing(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GradingService for FakeGradingService {
    async fn process_build_result(
        &self,
        participation: &Participation,
        build_result: &BuildResult,
    ) -> Result<GradedResult> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Grading("simulated grading failure".into()));
        }
        self.graded.lock().push(participation.id);
        let total = build_result.total_tests();
        Ok(GradedResult {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            score: if total == 0 {
                0.0
            } else {
                build_result.passed_tests as f64 * 100.0 / total as f64
            },
            successful: build_result.successful,
            completion_date: build_result.build_run_date,
        })
    }

    async fn create_placeholder_result(
        &self,
        participation: &Participation,
        _submission_id: i64,
    ) -> Result<GradedResult> {
        self.placeholders.lock().push(participation.id);
        Ok(GradedResult {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            score: 0.0,
            successful: false,
            completion_date: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeNotificationService {
    new_results: Mutex<Vec<i64>>,
    submission_errors: Mutex<Vec<(i64, String)>>,
    self_paused: Mutex<Vec<(String, u32)>>,
}

impl FakeNotificationService {
    pub fn new_result_count(&self) -> usize {
        self.new_results.lock().len()
    }

    pub fn submission_error_count(&self) -> usize {
        self.submission_errors.lock().len()
    }

    pub fn self_paused_count(&self) -> usize {
        self.self_paused.lock().len()
    }

    pub fn last_self_paused(&self) -> Option<(String, u32)> {
        self.self_paused.lock().last().cloned()
    }
}

#[async_trait]
impl NotificationService for FakeNotificationService {
    async fn notify_new_result(
        &self,
        participation: &Participation,
        _result: &GradedResult,
    ) -> Result<()> {
        self.new_results.lock().push(participation.id);
        Ok(())
    }

    async fn notify_submission_error(
        &self,
        participation: &Participation,
        message: &str,
    ) -> Result<()> {
        self.submission_errors
            .lock()
            .push((participation.id, message.to_string()));
        Ok(())
    }

    async fn notify_agent_self_paused(
        &self,
        agent_name: &str,
        consecutive_failures: u32,
    ) -> Result<()> {
        self.self_paused
            .lock()
            .push((agent_name.to_string(), consecutive_failures));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBuildLogSink {
    saved: Mutex<HashMap<BuildJobId, usize>>,
}

impl FakeBuildLogSink {
    pub fn saved_line_count(&self, job_id: &BuildJobId) -> Option<usize> {
        self.saved.lock().get(job_id).copied()
    }
}

#[async_trait]
impl BuildLogSink for FakeBuildLogSink {
    async fn save_build_logs(
        &self,
        build_job_id: &BuildJobId,
        logs: &[BuildLogLine],
    ) -> Result<()> {
        self.saved.lock().insert(*build_job_id, logs.len());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingBroadcaster {
    pub fn last_payload(&self, destination: &str) -> Option<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(dest, _)| dest == destination)
            .map(|(_, payload)| payload.clone())
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn send(&self, destination: &str, payload: serde_json::Value) {
        self.sent.lock().push((destination.to_string(), payload));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

static TRACING: std::sync::Once = std::sync::Once::new();

/// Route service logs through the test writer; `RUST_LOG` filters apply.
fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub provider: Arc<MemoryProvider>,
    pub store: Arc<ClusterStore>,
    pub build_jobs: Arc<MemoryBuildJobRepo>,
    pub submissions: Arc<MemorySubmissionRepo>,
    pub statistics: Arc<MemoryStatisticsRepo>,
    pub commits: Arc<FakeCommitResolver>,
    pub participations: Arc<FakeParticipationLookup>,
    pub grading: Arc<FakeGradingService>,
    pub notifications: Arc<FakeNotificationService>,
    pub build_logs: Arc<FakeBuildLogSink>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub trigger: Arc<TriggerService>,
    pub results: Arc<ResultProcessingService>,
    pub missing: Arc<MissingJobService>,
    pub fanout: Arc<FanoutService>,
    pub management: Arc<QueueManagementService>,
    missing_settings: MissingJobSettings,
}

impl Harness {
    pub fn new() -> Self {
        init_test_tracing();
        let provider = MemoryProvider::new("localhost:5701");
        let store = Arc::new(ClusterStore::new(ClusterProvider::Memory(provider.clone())));

        let build_jobs = Arc::new(MemoryBuildJobRepo::default());
        let submissions = Arc::new(MemorySubmissionRepo::default());
        let statistics = Arc::new(MemoryStatisticsRepo::default());
        let commits = Arc::new(FakeCommitResolver::default());
        let participations = Arc::new(FakeParticipationLookup::default());
        let grading = Arc::new(FakeGradingService::default());
        let notifications = Arc::new(FakeNotificationService::default());
        let build_logs = Arc::new(FakeBuildLogSink::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());

        let trigger = Arc::new(TriggerService::new(
            store.clone(),
            build_jobs.clone(),
            submissions.clone(),
            statistics.clone(),
            commits.clone(),
            grading.clone(),
            TriggerSettings {
                default_build_duration: std::time::Duration::from_secs(60),
                duration_safety_factor: 1.2,
            },
        ));

        let results = Arc::new(ResultProcessingService::new(
            store.clone(),
            build_jobs.clone(),
            statistics.clone(),
            participations.clone(),
            grading.clone(),
            notifications.clone(),
            build_logs.clone(),
            trigger.clone(),
        ));

        let missing_settings = MissingJobSettings {
            grace_period: std::time::Duration::from_secs(300),
            retry_window: std::time::Duration::from_secs(3600),
            max_retries: 3,
            retry_batch_size: 100,
        };
        let missing = Arc::new(MissingJobService::new(
            store.clone(),
            build_jobs.clone(),
            participations.clone(),
            trigger.clone(),
            missing_settings.clone(),
        ));

        let fanout = Arc::new(FanoutService::new(
            store.clone(),
            broadcaster.clone(),
            notifications.clone(),
            build_jobs.clone(),
        ));

        let management = Arc::new(QueueManagementService::new(
            store.clone(),
            build_jobs.clone(),
        ));

        Self {
            provider,
            store,
            build_jobs,
            submissions,
            statistics,
            commits,
            participations,
            grading,
            notifications,
            build_logs,
            broadcaster,
            trigger,
            results,
            missing,
            fanout,
            management,
            missing_settings,
        }
    }

    pub fn missing_settings(&self) -> &MissingJobSettings {
        &self.missing_settings
    }

    fn exercise(&self, exercise_id: i64, course_id: i64, containers: usize) -> ExerciseInfo {
        ExerciseInfo {
            id: exercise_id,
            course_id,
            name: format!("exercise-{exercise_id}"),
            test_repository_url: format!("https://vcs.example.org/ex{exercise_id}/tests")
                .parse()
                .unwrap(),
            due_date: None,
            included_in_score: true,
            exam: None,
            course_is_test_course: false,
            containers: (0..containers)
                .map(|index| ContainerConfig {
                    id: index as i64 + 1,
                    name: format!("container-{}", index + 1),
                    docker_image: "forgeci/maven:21".into(),
                    build_script: "#!/bin/sh\nmvn -B test".into(),
                    timeout_seconds: 120,
                })
                .collect(),
        }
    }

    fn participation_base(
        &self,
        id: i64,
        course_id: i64,
        containers: usize,
        repository_type: RepositoryType,
        repository: &str,
    ) -> Participation {
        Participation {
            id,
            exercise: self.exercise(1, course_id, containers),
            repository_name: format!("ex1-{repository}"),
            repository_type,
            repository_url: format!("https://vcs.example.org/ex1/{repository}-{id}")
                .parse()
                .unwrap(),
            owner_name: format!("student-{id}"),
            practice_mode: false,
            test_run: false,
        }
    }

    pub fn participation(&self) -> Participation {
        self.participation_base(1, 1, 1, RepositoryType::User, "student")
    }

    pub fn participation_with_id(&self, id: i64) -> Participation {
        self.participation_base(id, 1, 1, RepositoryType::User, "student")
    }

    pub fn participation_with_course(&self, course_id: i64) -> Participation {
        self.participation_base(course_id * 100, course_id, 1, RepositoryType::User, "student")
    }

    pub fn participation_with_containers(&self, containers: usize) -> Participation {
        self.participation_base(1, 1, containers, RepositoryType::User, "student")
    }

    pub fn solution_participation(&self) -> Participation {
        self.participation_base(2, 1, 1, RepositoryType::Solution, "solution")
    }

    pub fn template_participation(&self) -> Participation {
        self.participation_base(3, 1, 1, RepositoryType::Template, "template")
    }

    pub fn agent_information(&self, name: &str) -> BuildAgentInformation {
        BuildAgentInformation {
            agent: BuildAgent {
                name: name.into(),
                member_address: "10.0.0.1:5701".into(),
                display_name: name.into(),
            },
            max_concurrent_jobs: 4,
            current_jobs: vec![],
            status: BuildAgentStatus::Active,
            consecutive_failures: 0,
            recent_build_jobs: Default::default(),
        }
    }

    pub fn seed_commits(&self, participation: &Participation) {
        self.commits
            .set_commit(&participation.repository_url, &"a".repeat(40));
        self.commits
            .set_commit(&participation.exercise.test_repository_url, &"b".repeat(40));
    }

    pub fn register_participation(&self, participation: Participation) {
        self.participations.register(participation);
    }

    pub fn register_template(&self, exercise_id: i64, participation: Participation) {
        self.participations
            .register_template(exercise_id, participation);
    }

    pub async fn enqueue_job(&self, participation: &Participation) -> BuildJobQueueItem {
        self.trigger
            .trigger_build(TriggerRequest::push(
                participation.clone(),
                RepositoryType::User,
            ))
            .await
            .unwrap()
            .remove(0)
    }

    pub async fn register_agent(&self, name: &str) -> BuildAgent {
        let info = self.agent_information(name);
        let agent = info.agent.clone();
        self.store
            .agent_information_map()
            .put(name.to_string(), info)
            .await
            .unwrap();
        agent
    }

    pub async fn offer_result(&self, item: ResultQueueItem) {
        self.store.result_queue().offer(item).await.unwrap();
    }

    pub fn backdate_submission(&self, job_id: &BuildJobId, age: chrono::Duration) {
        self.build_jobs.set_submission_date(job_id, Utc::now() - age);
    }

    pub fn set_retry_count(&self, job_id: &BuildJobId, retry_count: u32) {
        self.build_jobs.set_retry_count(job_id, retry_count);
    }

    pub async fn mark_missing(&self, job_id: &BuildJobId) {
        self.build_jobs
            .update_status(job_id, BuildStatus::Missing, None)
            .await
            .unwrap();
    }
}

pub fn success_result(job: &BuildJobQueueItem) -> ResultQueueItem {
    ResultQueueItem {
        build_job: job.clone(),
        build_result: BuildResult {
            branch: "main".into(),
            assignment_commit_hash: job.build_config.assignment_commit_hash.clone(),
            test_commit_hash: job.build_config.test_commit_hash.clone(),
            build_run_date: Utc::now(),
            successful: true,
            passed_tests: 10,
            failed_tests: 0,
        },
        build_logs: vec![],
        exception: None,
    }
}
