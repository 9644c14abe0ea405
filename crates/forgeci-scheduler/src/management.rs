//! Queue administration and historical search.
//!
//! Cancellation of a queued job is a direct removal (no agent has claimed it
//! yet). Cancelling a processing job is cooperative: the map entry is
//! removed and the job id is published on the cancel topic; the executing
//! agent is expected to observe the signal and abort, but completion of the
//! abort is not guaranteed synchronously. Bulk cancellation is the repeated
//! application of the single-job path over filtered snapshots.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use forgeci_cluster::ClusterStore;
use forgeci_core::{BuildJobId, BuildStatus};
use forgeci_core::job::BuildJobQueueItem;
use forgeci_db::{BuildJobRepo, BuildJobSearchFilter, BuildJobSearchPage};

use crate::SchedulerResult;

pub struct QueueManagementService {
    store: Arc<ClusterStore>,
    build_jobs: Arc<dyn BuildJobRepo>,
}

impl QueueManagementService {
    pub fn new(store: Arc<ClusterStore>, build_jobs: Arc<dyn BuildJobRepo>) -> Self {
        Self { store, build_jobs }
    }

    /// Cancel one job wherever it currently lives. Returns whether the job
    /// was found in either structure.
    pub async fn cancel_build_job(&self, job_id: &BuildJobId) -> SchedulerResult<bool> {
        let queued = self.store.queued_jobs().await;
        if let Some(item) = queued.into_iter().find(|job| &job.id == job_id) {
            if self.store.build_job_queue().remove(&item).await? {
                info!(job_id = %job_id, "cancelled queued build job");
                self.mark_cancelled(job_id).await;
                return Ok(true);
            }
            // An agent claimed the job between snapshot and removal; fall
            // through to the cooperative path.
        }

        if self
            .store
            .processing_jobs_map()
            .remove(job_id)
            .await?
            .is_some()
        {
            self.store.canceled_build_jobs_topic().publish(*job_id).await?;
            info!(job_id = %job_id, "published cancellation for processing build job");
            self.mark_cancelled(job_id).await;
            return Ok(true);
        }

        Ok(false)
    }

    async fn mark_cancelled(&self, job_id: &BuildJobId) {
        if let Err(e) = self
            .build_jobs
            .update_status(job_id, BuildStatus::Cancelled, Some(Utc::now()))
            .await
        {
            warn!(job_id = %job_id, error = %e, "could not persist cancellation");
        }
    }

    pub async fn cancel_all_jobs(&self) -> SchedulerResult<usize> {
        let targets = self.collect_targets(|_| true).await;
        self.cancel_each(targets).await
    }

    pub async fn cancel_jobs_for_course(&self, course_id: i64) -> SchedulerResult<usize> {
        let targets = self.collect_targets(|job| job.course_id == course_id).await;
        self.cancel_each(targets).await
    }

    pub async fn cancel_jobs_for_participation(
        &self,
        participation_id: i64,
    ) -> SchedulerResult<usize> {
        let targets = self
            .collect_targets(|job| job.participation_id == participation_id)
            .await;
        self.cancel_each(targets).await
    }

    /// Queued items carry no agent assignment, so this only ever matches
    /// processing jobs.
    pub async fn cancel_jobs_for_agent(&self, agent_name: &str) -> SchedulerResult<usize> {
        let targets = self
            .collect_targets(|job| {
                job.build_agent
                    .as_ref()
                    .is_some_and(|agent| agent.name == agent_name)
            })
            .await;
        self.cancel_each(targets).await
    }

    async fn collect_targets(&self, matches: impl Fn(&BuildJobQueueItem) -> bool) -> Vec<BuildJobId> {
        let mut targets: Vec<BuildJobId> = Vec::new();
        for job in self.store.queued_jobs().await {
            if matches(&job) {
                targets.push(job.id);
            }
        }
        for job in self.store.processing_jobs().await {
            if matches(&job) {
                targets.push(job.id);
            }
        }
        targets
    }

    async fn cancel_each(&self, targets: Vec<BuildJobId>) -> SchedulerResult<usize> {
        let mut cancelled = 0;
        for job_id in targets {
            match self.cancel_build_job(&job_id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "cancellation failed"),
            }
        }
        Ok(cancelled)
    }

    /// Ask an agent to stop claiming new jobs. Advisory, via the pause
    /// topic; the agent confirms by updating its status in the agent map.
    pub async fn pause_build_agent(&self, agent_name: &str) -> SchedulerResult<()> {
        self.store
            .pause_build_agent_topic()
            .publish(agent_name.to_string())
            .await?;
        info!(agent = agent_name, "published pause request");
        Ok(())
    }

    pub async fn resume_build_agent(&self, agent_name: &str) -> SchedulerResult<()> {
        self.store
            .resume_build_agent_topic()
            .publish(agent_name.to_string())
            .await?;
        info!(agent = agent_name, "published resume request");
        Ok(())
    }

    /// Historical search over durable storage under filter, sort and
    /// pagination.
    pub async fn search_build_jobs(
        &self,
        filter: &BuildJobSearchFilter,
    ) -> SchedulerResult<BuildJobSearchPage> {
        Ok(self.build_jobs.search(filter).await?)
    }
}
