//! Result processing service.
//!
//! Drains the shared result queue and makes every downstream effect of a
//! build outcome durable. Consumption is an atomic pop, so when several
//! nodes race to drain the queue each result item is obtained by exactly one
//! of them. Event-driven processing is paired with a periodic fallback drain
//! because event delivery can be lost under load.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use forgeci_cluster::{ClusterStore, QueueEvent};
use forgeci_core::BuildStatus;
use forgeci_core::job::{BuildJobQueueItem, RepositoryType, ResultQueueItem};
use forgeci_core::ports::{
    BuildLogSink, GradingService, NotificationService, ParticipationLookup,
};
use forgeci_db::{BuildJobRepo, BuildStatisticsRepo};

use crate::trigger::{TriggerRequest, TriggerService};

pub struct ResultProcessingService {
    store: Arc<ClusterStore>,
    build_jobs: Arc<dyn BuildJobRepo>,
    statistics: Arc<dyn BuildStatisticsRepo>,
    participations: Arc<dyn ParticipationLookup>,
    grading: Arc<dyn GradingService>,
    notifications: Arc<dyn NotificationService>,
    build_logs: Arc<dyn BuildLogSink>,
    trigger: Arc<TriggerService>,
}

impl ResultProcessingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ClusterStore>,
        build_jobs: Arc<dyn BuildJobRepo>,
        statistics: Arc<dyn BuildStatisticsRepo>,
        participations: Arc<dyn ParticipationLookup>,
        grading: Arc<dyn GradingService>,
        notifications: Arc<dyn NotificationService>,
        build_logs: Arc<dyn BuildLogSink>,
        trigger: Arc<TriggerService>,
    ) -> Self {
        Self {
            store,
            build_jobs,
            statistics,
            participations,
            grading,
            notifications,
            build_logs,
            trigger,
        }
    }

    /// React to result-queue events. Lagged receivers are tolerated; the
    /// fallback drain picks up whatever the event stream dropped.
    pub fn spawn_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut events = service.store.result_queue().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::Added(item)) => {
                        debug!(
                            job_id = %item.build_job.id,
                            "result added to queue, processing one result"
                        );
                        service.process_next_result().await;
                    }
                    Ok(QueueEvent::Removed(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "result event stream lagged, relying on fallback drain");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Pop and process one result. Returns `false` when the queue was empty
    /// or another node won the pop.
    pub async fn process_next_result(&self) -> bool {
        let item = match self.store.result_queue().poll().await {
            Ok(Some(item)) => item,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "polling the result queue failed");
                return false;
            }
        };
        self.process_result(item).await;
        true
    }

    /// Fallback drain, bounded by the queue size observed at tick start so a
    /// steady stream of new results cannot pin this task. Each item is
    /// processed in isolation.
    pub async fn drain_result_queue(&self) {
        let pending = self.store.result_queue_size().await;
        if pending == 0 {
            return;
        }
        debug!(pending, "fallback-draining result queue");
        for _ in 0..pending {
            if !self.process_next_result().await {
                break;
            }
        }
    }

    async fn process_result(&self, item: ResultQueueItem) {
        let job = item.build_job.clone();
        let status = classify_status(&item);
        let completion_date = item.build_result.build_run_date;
        info!(job_id = %job.id, status = %status, "processing build job result");

        let mut finished = job.clone();
        finished.status = Some(status);
        finished.timing_info.build_completion_date = Some(completion_date);
        finished.result = Some(forgeci_core::job::ResultSummary {
            successful: status == BuildStatus::Successful && item.build_result.successful,
            score: score_of(&item),
            passed_tests: item.build_result.passed_tests,
            total_tests: item.build_result.total_tests(),
        });

        let row_saved = self
            .build_jobs
            .update_status(&job.id, status, Some(completion_date))
            .await;
        if let Err(e) = &row_saved {
            error!(job_id = %job.id, error = %e, "could not persist build status");
        }

        self.record_job_on_agent(&finished).await;

        if !item.build_logs.is_empty() {
            if row_saved.is_ok() {
                if let Err(e) = self
                    .build_logs
                    .save_build_logs(&job.id, &item.build_logs)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "could not persist build logs");
                }
            } else {
                warn!(
                    job_id = %job.id,
                    "skipping build logs because the build job row was not saved"
                );
            }
        }

        let participation = match self.participations.find_participation(job.participation_id).await
        {
            Ok(Some(participation)) => Some(participation),
            Ok(None) => {
                warn!(
                    participation_id = job.participation_id,
                    job_id = %job.id,
                    "participation has been deleted, abandoning result processing"
                );
                None
            }
            Err(e) => {
                warn!(
                    participation_id = job.participation_id,
                    error = %e,
                    "participation lookup failed, abandoning result processing"
                );
                None
            }
        };

        if let Some(participation) = &participation {
            match status {
                BuildStatus::Successful => {
                    match self
                        .grading
                        .process_build_result(participation, &item.build_result)
                        .await
                    {
                        Ok(graded) => {
                            if let Err(e) = self
                                .notifications
                                .notify_new_result(participation, &graded)
                                .await
                            {
                                warn!(job_id = %job.id, error = %e, "result notification failed");
                            }
                        }
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "grading the build result failed");
                            if let Err(e) = self
                                .build_jobs
                                .update_status(&job.id, BuildStatus::Failed, Some(completion_date))
                                .await
                            {
                                error!(job_id = %job.id, error = %e, "could not record grading failure");
                            }
                            let _ = self
                                .notifications
                                .notify_submission_error(
                                    participation,
                                    "the build result could not be processed",
                                )
                                .await;
                        }
                    }

                    self.update_build_duration_statistics(&finished);
                }
                BuildStatus::Cancelled => {
                    debug!(job_id = %job.id, "build job was cancelled, no result to grade");
                }
                _ => {
                    let message = item
                        .exception
                        .as_ref()
                        .map(|exception| exception.message.clone())
                        .unwrap_or_else(|| "the build failed".to_string());
                    let _ = self
                        .notifications
                        .notify_submission_error(participation, &message)
                        .await;
                }
            }
        }

        // A finished solution build of a tests/auxiliary push keeps the
        // template repository in sync by enqueueing one template build for
        // the same test commit.
        if is_solution_build_of_test_or_aux_push(&job) {
            self.trigger_template_build(&job).await;
        }
    }

    /// Append/replace the finished job in the owning agent's bounded
    /// recent-jobs ring.
    async fn record_job_on_agent(&self, finished: &BuildJobQueueItem) {
        let Some(agent) = &finished.build_agent else {
            return;
        };
        let map = self.store.agent_information_map();
        match map.get(&agent.name).await {
            Ok(Some(mut info)) => {
                info.record_finished_job(finished.clone());
                if let Err(e) = map.put(agent.name.clone(), info).await {
                    debug!(agent = %agent.name, error = %e, "could not update agent bookkeeping");
                }
            }
            Ok(None) => {
                debug!(agent = %agent.name, "agent not registered, skipping bookkeeping");
            }
            Err(e) => {
                debug!(agent = %agent.name, error = %e, "agent lookup failed, skipping bookkeeping");
            }
        }
    }

    /// Deferred to a spawned task so statistics never hold up notifying the
    /// user of their result.
    fn update_build_duration_statistics(&self, finished: &BuildJobQueueItem) {
        let Some(start) = finished.timing_info.build_start_date else {
            return;
        };
        let Some(completion) = finished.timing_info.build_completion_date else {
            return;
        };
        let duration_seconds = (completion - start).num_seconds();
        if duration_seconds <= 0 {
            return;
        }

        let statistics = Arc::clone(&self.statistics);
        let exercise_id = finished.exercise_id;
        tokio::spawn(async move {
            if let Err(e) = statistics
                .record_build_duration(exercise_id, duration_seconds)
                .await
            {
                warn!(exercise_id, error = %e, "could not update build duration statistics");
            }
        });
    }

    async fn trigger_template_build(&self, job: &BuildJobQueueItem) {
        info!(job_id = %job.id, "triggering template build after solution build");
        let template = match self
            .participations
            .find_template_participation(job.exercise_id)
            .await
        {
            Ok(Some(template)) => template,
            Ok(None) => {
                // Visible to instructors in the UI: the template build is
                // simply absent and can be triggered manually.
                error!(
                    exercise_id = job.exercise_id,
                    "no template participation found, skipping chained template build"
                );
                return;
            }
            Err(e) => {
                error!(
                    exercise_id = job.exercise_id,
                    error = %e,
                    "template participation lookup failed, skipping chained template build"
                );
                return;
            }
        };

        let request = TriggerRequest {
            participation: template,
            triggered_by: job.repository_info.triggered_by_push_to,
            build_all: false,
            assignment_commit_hash: None,
            test_commit_hash: Some(job.build_config.test_commit_hash.clone()),
            retry_count: 0,
        };
        if let Err(e) = self.trigger.trigger_build(request).await {
            error!(
                exercise_id = job.exercise_id,
                error = %e,
                "chained template build could not be triggered"
            );
        }
    }
}

/// An exception whose cause is the cancellation of exactly this job means
/// CANCELLED; any other exception means FAILED; no exception means the job
/// ran to completion.
fn classify_status(item: &ResultQueueItem) -> BuildStatus {
    match &item.exception {
        Some(exception) if exception.is_cancellation_of(&item.build_job.id) => {
            BuildStatus::Cancelled
        }
        Some(_) => BuildStatus::Failed,
        None => BuildStatus::Successful,
    }
}

fn score_of(item: &ResultQueueItem) -> f64 {
    let total = item.build_result.total_tests();
    if total == 0 {
        return 0.0;
    }
    item.build_result.passed_tests as f64 * 100.0 / total as f64
}

fn is_solution_build_of_test_or_aux_push(job: &BuildJobQueueItem) -> bool {
    job.repository_info.repository_type == RepositoryType::Solution
        && matches!(
            job.repository_info.triggered_by_push_to,
            RepositoryType::Tests | RepositoryType::Auxiliary
        )
}
