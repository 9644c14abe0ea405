//! Missing-job detection and bounded retry.
//!
//! The two-step claim (remove-from-queue / add-to-processing) spans no
//! transaction, so a crash can strand a job that durable storage believes is
//! QUEUED or BUILDING while neither shared structure knows it. This service
//! closes that gap: a periodic detector marks such jobs MISSING after a
//! grace period, and a separate retrier re-triggers recent MISSING jobs a
//! bounded number of times.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use forgeci_cluster::ClusterStore;
use forgeci_core::{BuildJobId, BuildStatus};
use forgeci_core::ports::ParticipationLookup;
use forgeci_db::{BuildJobRecord, BuildJobRepo};

use crate::trigger::{TriggerRequest, TriggerService};
use crate::SchedulerResult;

#[derive(Debug, Clone)]
pub struct MissingJobSettings {
    /// How long a QUEUED/BUILDING job may be unaccounted for before it is
    /// classified MISSING.
    pub grace_period: Duration,
    /// Only MISSING jobs submitted within this window are retried.
    pub retry_window: Duration,
    pub max_retries: u32,
    /// Upper bound on the retry batch fetched per pass.
    pub retry_batch_size: i64,
}

impl From<&forgeci_config::SchedulerSettings> for MissingJobSettings {
    fn from(settings: &forgeci_config::SchedulerSettings) -> Self {
        Self {
            grace_period: settings.grace_period,
            retry_window: settings.retry_window,
            max_retries: settings.max_missing_job_retries,
            retry_batch_size: 100,
        }
    }
}

pub struct MissingJobService {
    store: Arc<ClusterStore>,
    build_jobs: Arc<dyn BuildJobRepo>,
    participations: Arc<dyn ParticipationLookup>,
    trigger: Arc<TriggerService>,
    settings: MissingJobSettings,
}

impl MissingJobService {
    pub fn new(
        store: Arc<ClusterStore>,
        build_jobs: Arc<dyn BuildJobRepo>,
        participations: Arc<dyn ParticipationLookup>,
        trigger: Arc<TriggerService>,
        settings: MissingJobSettings,
    ) -> Self {
        Self {
            store,
            build_jobs,
            participations,
            trigger,
            settings,
        }
    }

    /// Detector pass: reconcile durable QUEUED/BUILDING rows older than the
    /// grace period against the shared queue and processing snapshots.
    /// Returns how many jobs were marked MISSING.
    pub async fn detect_missing_jobs(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.grace_period)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let stale = match self.build_jobs.find_in_flight_older_than(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "could not load in-flight build jobs");
                return 0;
            }
        };
        if stale.is_empty() {
            return 0;
        }

        let queued_ids: HashSet<BuildJobId> = self
            .store
            .queued_jobs()
            .await
            .into_iter()
            .map(|job| job.id)
            .collect();
        let processing_ids: HashSet<BuildJobId> =
            self.store.processing_job_ids().await.into_iter().collect();

        let mut marked = 0;
        for record in stale {
            let id = record.job_id();
            let accounted_for = match record.status() {
                // A claimed job may sit in the processing map before the
                // durable row advances to BUILDING.
                Some(BuildStatus::Queued) => {
                    queued_ids.contains(&id) || processing_ids.contains(&id)
                }
                Some(BuildStatus::Building) => processing_ids.contains(&id),
                _ => true,
            };
            if accounted_for {
                continue;
            }

            warn!(job_id = %id, "build job state is undeterminable, marking MISSING");
            match self
                .build_jobs
                .update_status(&id, BuildStatus::Missing, None)
                .await
            {
                Ok(()) => marked += 1,
                Err(e) => error!(job_id = %id, error = %e, "could not mark build job MISSING"),
            }
        }

        if marked > 0 {
            info!(marked, "marked unaccounted build jobs as MISSING");
        }
        marked
    }

    /// Retrier pass: re-trigger a bounded batch of recent MISSING jobs that
    /// still have retry budget. Jobs at the maximum are left untouched and
    /// surfaced to instructors through the search UI. Returns how many jobs
    /// were retried.
    pub async fn retry_missing_jobs(&self) -> usize {
        let since = Utc::now()
            - chrono::Duration::from_std(self.settings.retry_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let missing = match self
            .build_jobs
            .find_missing_submitted_after(since, self.settings.retry_batch_size)
            .await
        {
            Ok(missing) => missing,
            Err(e) => {
                error!(error = %e, "could not load MISSING build jobs");
                return 0;
            }
        };

        let mut retried = 0;
        for record in missing {
            if record.retry_count as u32 >= self.settings.max_retries {
                info!(
                    job_id = %record.job_id(),
                    retry_count = record.retry_count,
                    "retry budget exhausted, leaving job for manual intervention"
                );
                continue;
            }
            // One bad job never aborts the batch.
            match self.retry_job(&record).await {
                Ok(true) => retried += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %record.job_id(), error = %e, "retrying missing job failed");
                }
            }
        }

        if retried > 0 {
            info!(retried, "re-triggered missing build jobs");
        }
        retried
    }

    async fn retry_job(&self, record: &BuildJobRecord) -> SchedulerResult<bool> {
        let Some(participation) = self
            .participations
            .find_participation(record.participation_id)
            .await?
        else {
            info!(
                job_id = %record.job_id(),
                participation_id = record.participation_id,
                "participation no longer exists, not retrying"
            );
            return Ok(false);
        };

        let triggered_by = record
            .triggered_by_push_to
            .parse()
            .unwrap_or(forgeci_core::job::RepositoryType::User);

        // Reuse the original commit pair; the push that caused this job is
        // long gone.
        let request = TriggerRequest {
            participation,
            triggered_by,
            build_all: false,
            assignment_commit_hash: Some(record.assignment_commit_hash.clone()),
            test_commit_hash: Some(record.test_commit_hash.clone()),
            retry_count: record.retry_count as u32 + 1,
        };
        let enqueued = self.trigger.trigger_build(request).await?;
        if enqueued.is_empty() {
            return Ok(false);
        }

        self.build_jobs.increment_retry_count(&record.job_id()).await?;
        info!(
            job_id = %record.job_id(),
            retry = record.retry_count + 1,
            "re-triggered missing build job"
        );
        Ok(true)
    }
}
