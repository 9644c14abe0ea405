//! Per-node wiring.
//!
//! One [`SchedulerNode`] lives in every API-server process. Every node
//! listens for and drains build results; the reconciliation and liveness
//! tasks run only on nodes configured with the scheduler role flag.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use forgeci_cluster::{
    ClusterProvider, ClusterResult, ClusterStore, MemoryProvider, RedisProvider,
};
use forgeci_config::{ClusterBackend, ClusterSettings, SchedulerSettings, SystemConfig};
use forgeci_core::ports::{
    Broadcaster, BuildLogSink, CommitResolver, GradingService, NotificationService,
    ParticipationLookup,
};
use forgeci_db::{BuildJobRepo, BuildStatisticsRepo, SubmissionRepo};

use crate::fanout::FanoutService;
use crate::management::QueueManagementService;
use crate::missing::{MissingJobService, MissingJobSettings};
use crate::results::ResultProcessingService;
use crate::trigger::{TriggerService, TriggerSettings};

/// Durable storage handles.
pub struct Repositories {
    pub build_jobs: Arc<dyn BuildJobRepo>,
    pub submissions: Arc<dyn SubmissionRepo>,
    pub statistics: Arc<dyn BuildStatisticsRepo>,
}

/// External collaborator handles, owned by the host application.
pub struct Collaborators {
    pub commits: Arc<dyn CommitResolver>,
    pub participations: Arc<dyn ParticipationLookup>,
    pub grading: Arc<dyn GradingService>,
    pub notifications: Arc<dyn NotificationService>,
    pub build_logs: Arc<dyn BuildLogSink>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Connect the configured cluster backend.
pub async fn connect_cluster(settings: &ClusterSettings) -> ClusterResult<ClusterProvider> {
    match settings.backend {
        ClusterBackend::Memory => Ok(ClusterProvider::Memory(MemoryProvider::new("local"))),
        ClusterBackend::Redis => Ok(ClusterProvider::Redis(
            RedisProvider::connect(&settings.url, &settings.key_prefix).await?,
        )),
    }
}

pub struct SchedulerNode {
    pub store: Arc<ClusterStore>,
    pub trigger: Arc<TriggerService>,
    pub results: Arc<ResultProcessingService>,
    pub missing: Arc<MissingJobService>,
    pub fanout: Arc<FanoutService>,
    pub management: Arc<QueueManagementService>,
    settings: SchedulerSettings,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerNode {
    pub fn new(
        config: &SystemConfig,
        store: Arc<ClusterStore>,
        repositories: Repositories,
        collaborators: Collaborators,
    ) -> Self {
        let trigger = Arc::new(TriggerService::new(
            store.clone(),
            repositories.build_jobs.clone(),
            repositories.submissions.clone(),
            repositories.statistics.clone(),
            collaborators.commits.clone(),
            collaborators.grading.clone(),
            TriggerSettings::from(&config.build_durations),
        ));

        let results = Arc::new(ResultProcessingService::new(
            store.clone(),
            repositories.build_jobs.clone(),
            repositories.statistics.clone(),
            collaborators.participations.clone(),
            collaborators.grading.clone(),
            collaborators.notifications.clone(),
            collaborators.build_logs.clone(),
            trigger.clone(),
        ));

        let missing = Arc::new(MissingJobService::new(
            store.clone(),
            repositories.build_jobs.clone(),
            collaborators.participations.clone(),
            trigger.clone(),
            MissingJobSettings::from(&config.scheduler),
        ));

        let fanout = Arc::new(FanoutService::new(
            store.clone(),
            collaborators.broadcaster.clone(),
            collaborators.notifications.clone(),
            repositories.build_jobs.clone(),
        ));

        let management = Arc::new(QueueManagementService::new(
            store.clone(),
            repositories.build_jobs.clone(),
        ));

        Self {
            store,
            trigger,
            results,
            missing,
            fanout,
            management,
            settings: config.scheduler.clone(),
            handles: Vec::new(),
        }
    }

    /// Spawn the background tasks for this node.
    pub fn start(&mut self) {
        info!(
            scheduler_enabled = self.settings.enabled,
            member = %self.store.local_member_address(),
            "starting lifecycle services"
        );

        self.handles.push(self.results.spawn_listener());
        self.handles.extend(self.fanout.spawn_listeners());

        // Fallback drain on every node: event delivery can be lost under
        // load.
        {
            let results = Arc::clone(&self.results);
            let period = self.settings.result_poll_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    results.drain_result_queue().await;
                }
            }));
        }

        if !self.settings.enabled {
            return;
        }

        {
            let missing = Arc::clone(&self.missing);
            let period = self.settings.missing_job_check_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    missing.detect_missing_jobs().await;
                }
            }));
        }

        {
            let missing = Arc::clone(&self.missing);
            let period = self.settings.retry_check_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    missing.retry_missing_jobs().await;
                }
            }));
        }

        {
            let fanout = Arc::clone(&self.fanout);
            let period = self.settings.liveness_push_interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    fanout.push_liveness_snapshots().await;
                }
            }));
        }
    }

    /// Stop all background tasks. In-flight item processing is abandoned;
    /// unconsumed results stay in the shared queue for other nodes.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("stopped lifecycle services");
    }
}

impl Drop for SchedulerNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use forgeci_core::BuildStatus;
    use std::time::Duration;

    fn node_from(harness: &Harness, enabled: bool) -> SchedulerNode {
        let mut config = SystemConfig::default();
        config.scheduler.enabled = enabled;
        SchedulerNode::new(
            &config,
            harness.store.clone(),
            Repositories {
                build_jobs: harness.build_jobs.clone(),
                submissions: harness.submissions.clone(),
                statistics: harness.statistics.clone(),
            },
            Collaborators {
                commits: harness.commits.clone(),
                participations: harness.participations.clone(),
                grading: harness.grading.clone(),
                notifications: harness.notifications.clone(),
                build_logs: harness.build_logs.clone(),
                broadcaster: harness.broadcaster.clone(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn node_drains_results_via_the_fallback_poll() {
        let harness = Harness::new();
        let participation = harness.participation();
        harness.seed_commits(&participation);
        harness.register_participation(participation.clone());
        let job = harness.enqueue_job(&participation).await;
        harness.offer_result(success_result(&job)).await;

        let mut node = node_from(&harness, false);
        node.start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(harness.notifications.new_result_count(), 1);
        let record = harness.build_jobs.find_by_job_id(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status(), Some(BuildStatus::Successful));
        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_runs_only_with_the_scheduler_role() {
        let harness = Harness::new();
        let participation = harness.participation();
        harness.seed_commits(&participation);
        let job = harness.enqueue_job(&participation).await;
        harness.store.build_job_queue().poll().await.unwrap();
        harness.backdate_submission(&job.id, chrono::Duration::minutes(10));

        // Without the role flag, nothing reconciles.
        let mut node = node_from(&harness, false);
        node.start();
        tokio::time::sleep(Duration::from_secs(600)).await;
        let record = harness.build_jobs.find_by_job_id(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status(), Some(BuildStatus::Queued));
        node.shutdown();

        // With it, the stale job is detected.
        let mut scheduler = node_from(&harness, true);
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(600)).await;
        let record = harness.build_jobs.find_by_job_id(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status(), Some(BuildStatus::Missing));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_push_reaches_the_dashboards() {
        let harness = Harness::new();
        let mut node = node_from(&harness, true);
        node.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(
            harness
                .broadcaster
                .last_payload(crate::fanout::channels::ADMIN_RESULT_QUEUE_SIZE)
                .is_some()
        );
        node.shutdown();
    }
}
