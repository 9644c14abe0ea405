//! Store-event fan-out.
//!
//! Translates raw mutations of the shared structures into sanitized,
//! per-scope broadcasts for dashboards: a global admin view and per-course
//! views. Full build configurations and repository URLs never leave this
//! module. A periodic liveness push re-broadcasts complete snapshots because
//! event delivery can be lost without anyone noticing otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use forgeci_cluster::{ClusterStore, MapEvent, QueueEvent};
use forgeci_core::BuildJobId;
use forgeci_core::agent::{BuildAgentInformation, BuildAgentStatus};
use forgeci_core::job::BuildJobQueueItem;
use forgeci_core::ports::{Broadcaster, NotificationService};
use forgeci_db::BuildJobRepo;

/// Fan-out channel names.
pub mod channels {
    pub const ADMIN_QUEUED_JOBS: &str = "/topic/admin/queued-jobs";
    pub const ADMIN_RUNNING_JOBS: &str = "/topic/admin/running-jobs";
    pub const ADMIN_BUILD_AGENTS: &str = "/topic/admin/build-agents";
    pub const ADMIN_RESULT_QUEUE_SIZE: &str = "/topic/admin/result-queue-size";

    pub fn course_queued_jobs(course_id: i64) -> String {
        format!("/topic/courses/{course_id}/queued-jobs")
    }

    pub fn course_running_jobs(course_id: i64) -> String {
        format!("/topic/courses/{course_id}/running-jobs")
    }

    pub fn admin_job(job_id: &forgeci_core::BuildJobId) -> String {
        format!("/topic/admin/jobs/{job_id}")
    }

    pub fn course_job(course_id: i64, job_id: &forgeci_core::BuildJobId) -> String {
        format!("/topic/courses/{course_id}/jobs/{job_id}")
    }

    pub fn agent_detail(agent_name: &str) -> String {
        format!("/topic/admin/build-agents/{agent_name}")
    }
}

/// Sanitized job projection: no build configuration, no repository URLs, no
/// raw results.
#[derive(Debug, Clone, Serialize)]
pub struct BuildJobView {
    pub id: String,
    pub name: String,
    pub build_agent_name: Option<String>,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub retry_count: u32,
    pub priority: i32,
    pub status: Option<String>,
    pub submission_date: DateTime<Utc>,
    pub build_start_date: Option<DateTime<Utc>>,
    pub estimated_completion_date: Option<DateTime<Utc>>,
}

impl From<&BuildJobQueueItem> for BuildJobView {
    fn from(job: &BuildJobQueueItem) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            build_agent_name: job.build_agent.as_ref().map(|agent| agent.name.clone()),
            participation_id: job.participation_id,
            course_id: job.course_id,
            exercise_id: job.exercise_id,
            retry_count: job.retry_count,
            priority: job.priority.value(),
            status: job.status.map(|status| status.to_string()),
            submission_date: job.timing_info.submission_date,
            build_start_date: job.timing_info.build_start_date,
            estimated_completion_date: job.timing_info.estimated_completion_date,
        }
    }
}

/// Sanitized agent projection for the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct BuildAgentView {
    pub name: String,
    pub display_name: String,
    pub max_concurrent_jobs: u32,
    pub current_load: u32,
    pub status: BuildAgentStatus,
    pub consecutive_failures: u32,
    pub running_job_ids: Vec<String>,
}

impl From<&BuildAgentInformation> for BuildAgentView {
    fn from(info: &BuildAgentInformation) -> Self {
        Self {
            name: info.agent.name.clone(),
            display_name: info.agent.display_name.clone(),
            max_concurrent_jobs: info.max_concurrent_jobs,
            current_load: info.current_load(),
            status: info.status,
            consecutive_failures: info.consecutive_failures,
            running_job_ids: info
                .current_jobs
                .iter()
                .map(|job| job.id.to_string())
                .collect(),
        }
    }
}

pub struct FanoutService {
    store: Arc<ClusterStore>,
    broadcaster: Arc<dyn Broadcaster>,
    notifications: Arc<dyn NotificationService>,
    build_jobs: Arc<dyn BuildJobRepo>,
    /// Last observed status per agent, to notify on the transition into
    /// SelfPaused exactly once.
    last_agent_status: Mutex<HashMap<String, BuildAgentStatus>>,
}

impl FanoutService {
    pub fn new(
        store: Arc<ClusterStore>,
        broadcaster: Arc<dyn Broadcaster>,
        notifications: Arc<dyn NotificationService>,
        build_jobs: Arc<dyn BuildJobRepo>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            notifications,
            build_jobs,
            last_agent_status: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the queue, processing-map and agent-map change events.
    pub fn spawn_listeners(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let queue_task = {
            let service = Arc::clone(self);
            let mut events = service.store.build_job_queue().subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => service.handle_queue_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "queue event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let processing_task = {
            let service = Arc::clone(self);
            let mut events = service.store.processing_jobs_map().subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => service.handle_processing_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "processing event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let agent_task = {
            let service = Arc::clone(self);
            let mut events = service.store.agent_information_map().subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => service.handle_agent_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "agent event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        vec![queue_task, processing_task, agent_task]
    }

    pub async fn handle_queue_event(&self, event: QueueEvent<BuildJobQueueItem>) {
        let job = match &event {
            QueueEvent::Added(job) | QueueEvent::Removed(job) => job.clone(),
        };
        self.push_queued_snapshots(job.course_id).await;
        self.push_job_detail(&job);
    }

    pub async fn handle_processing_event(&self, event: MapEvent<BuildJobId, BuildJobQueueItem>) {
        let job = match &event {
            MapEvent::Added { value, .. }
            | MapEvent::Updated { value, .. }
            | MapEvent::Removed { value, .. } => value.clone(),
        };

        if let MapEvent::Added { .. } = &event {
            // The claim just became visible: advance the durable row so the
            // missing-job detector checks the right structure.
            let start = job.timing_info.build_start_date.unwrap_or_else(Utc::now);
            if let Err(e) = self.build_jobs.mark_building(&job.id, start).await {
                debug!(job_id = %job.id, error = %e, "could not mark build job BUILDING");
            }
        }

        self.push_running_snapshots(job.course_id).await;
        self.push_job_detail(&job);
    }

    pub async fn handle_agent_event(&self, event: MapEvent<String, BuildAgentInformation>) {
        match &event {
            MapEvent::Added { value, .. } | MapEvent::Updated { value, .. } => {
                if self.entered_self_paused(value) {
                    warn!(
                        agent = %value.agent.name,
                        consecutive_failures = value.consecutive_failures,
                        "build agent paused itself"
                    );
                    if let Err(e) = self
                        .notifications
                        .notify_agent_self_paused(
                            &value.agent.name,
                            value.consecutive_failures,
                        )
                        .await
                    {
                        error!(agent = %value.agent.name, error = %e, "admin notification failed");
                    }
                }
                self.send_json(
                    &channels::agent_detail(&value.agent.name),
                    &BuildAgentView::from(value),
                );
            }
            MapEvent::Removed { key, .. } => {
                self.last_agent_status.lock().remove(key);
            }
        }
        self.push_agent_snapshot().await;
    }

    fn entered_self_paused(&self, info: &BuildAgentInformation) -> bool {
        let previous = self
            .last_agent_status
            .lock()
            .insert(info.agent.name.clone(), info.status);
        info.status == BuildAgentStatus::SelfPaused
            && previous != Some(BuildAgentStatus::SelfPaused)
    }

    pub async fn push_queued_snapshots(&self, course_id: i64) {
        let jobs = self.store.queued_jobs().await;
        let views: Vec<BuildJobView> = jobs.iter().map(BuildJobView::from).collect();
        self.send_json(channels::ADMIN_QUEUED_JOBS, &views);

        let course_views: Vec<&BuildJobView> = views
            .iter()
            .filter(|view| view.course_id == course_id)
            .collect();
        self.send_json(&channels::course_queued_jobs(course_id), &course_views);
    }

    pub async fn push_running_snapshots(&self, course_id: i64) {
        let jobs = self.store.processing_jobs().await;
        let views: Vec<BuildJobView> = jobs.iter().map(BuildJobView::from).collect();
        self.send_json(channels::ADMIN_RUNNING_JOBS, &views);

        let course_views: Vec<&BuildJobView> = views
            .iter()
            .filter(|view| view.course_id == course_id)
            .collect();
        self.send_json(&channels::course_running_jobs(course_id), &course_views);
    }

    pub async fn push_agent_snapshot(&self) {
        let agents = self.store.build_agent_information().await;
        let views: Vec<BuildAgentView> = agents.iter().map(BuildAgentView::from).collect();
        self.send_json(channels::ADMIN_BUILD_AGENTS, &views);
    }

    fn push_job_detail(&self, job: &BuildJobQueueItem) {
        let view = BuildJobView::from(job);
        self.send_json(&channels::admin_job(&job.id), &view);
        self.send_json(&channels::course_job(job.course_id, &job.id), &view);
    }

    /// Periodic liveness push, independent of event delivery: full
    /// snapshots to every affected scope plus the current result-queue size.
    pub async fn push_liveness_snapshots(&self) {
        let queued = self.store.queued_jobs().await;
        let running = self.store.processing_jobs().await;

        let queued_views: Vec<BuildJobView> = queued.iter().map(BuildJobView::from).collect();
        let running_views: Vec<BuildJobView> = running.iter().map(BuildJobView::from).collect();
        self.send_json(channels::ADMIN_QUEUED_JOBS, &queued_views);
        self.send_json(channels::ADMIN_RUNNING_JOBS, &running_views);

        let course_ids: HashSet<i64> = queued
            .iter()
            .chain(running.iter())
            .map(|job| job.course_id)
            .collect();
        for course_id in course_ids {
            let course_queued: Vec<&BuildJobView> = queued_views
                .iter()
                .filter(|view| view.course_id == course_id)
                .collect();
            let course_running: Vec<&BuildJobView> = running_views
                .iter()
                .filter(|view| view.course_id == course_id)
                .collect();
            self.send_json(&channels::course_queued_jobs(course_id), &course_queued);
            self.send_json(&channels::course_running_jobs(course_id), &course_running);
        }

        self.push_agent_snapshot().await;

        let result_queue_size = self.store.result_queue_size().await;
        self.send_json(
            channels::ADMIN_RESULT_QUEUE_SIZE,
            &serde_json::json!({ "size": result_queue_size }),
        );
    }

    fn send_json(&self, destination: &str, payload: &impl Serialize) {
        match serde_json::to_value(payload) {
            Ok(value) => self.broadcaster.send(destination, value),
            Err(e) => error!(destination, error = %e, "could not serialize fan-out payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use forgeci_cluster::QueueEvent;

    #[tokio::test]
    async fn queue_events_push_sanitized_snapshots_to_admin_and_course_scopes() {
        let harness = Harness::new();
        let participation = harness.participation();
        harness.seed_commits(&participation);
        let job = harness.enqueue_job(&participation).await;

        harness
            .fanout
            .handle_queue_event(QueueEvent::Added(job.clone()))
            .await;

        let admin = harness
            .broadcaster
            .last_payload(channels::ADMIN_QUEUED_JOBS)
            .expect("admin snapshot sent");
        let rendered = admin.to_string();
        // Build configuration and repository URLs never reach subscribers.
        assert!(!rendered.contains("build_script"));
        assert!(!rendered.contains("vcs.example.org"));
        assert!(rendered.contains(&job.id.to_string()));

        let course = harness
            .broadcaster
            .last_payload(&channels::course_queued_jobs(job.course_id))
            .expect("course snapshot sent");
        assert_eq!(course.as_array().map(|jobs| jobs.len()), Some(1));
        // A course that never had a job in the queue got nothing.
        assert!(
            harness
                .broadcaster
                .last_payload(&channels::course_queued_jobs(424242))
                .is_none()
        );
    }

    #[tokio::test]
    async fn processing_claim_advances_the_durable_row_to_building() {
        let harness = Harness::new();
        let participation = harness.participation();
        harness.seed_commits(&participation);
        let job = harness.enqueue_job(&participation).await;

        harness
            .fanout
            .handle_processing_event(MapEvent::Added {
                key: job.id,
                value: job.clone(),
            })
            .await;

        let record = harness.build_jobs.find_by_job_id(&job.id).await.unwrap().unwrap();
        assert_eq!(record.status(), Some(forgeci_core::BuildStatus::Building));
        assert!(record.build_start_date.is_some());
    }

    #[tokio::test]
    async fn self_pause_transition_notifies_admins_exactly_once() {
        let harness = Harness::new();
        let mut info = harness.agent_information("agent-1");

        info.status = BuildAgentStatus::Active;
        harness
            .fanout
            .handle_agent_event(MapEvent::Added {
                key: "agent-1".into(),
                value: info.clone(),
            })
            .await;
        assert_eq!(harness.notifications.self_paused_count(), 0);

        info.status = BuildAgentStatus::SelfPaused;
        info.consecutive_failures = 4;
        harness
            .fanout
            .handle_agent_event(MapEvent::Updated {
                key: "agent-1".into(),
                value: info.clone(),
            })
            .await;
        // A repeated update in the same state stays silent.
        harness
            .fanout
            .handle_agent_event(MapEvent::Updated {
                key: "agent-1".into(),
                value: info.clone(),
            })
            .await;

        assert_eq!(harness.notifications.self_paused_count(), 1);
        assert_eq!(
            harness.notifications.last_self_paused(),
            Some(("agent-1".to_string(), 4))
        );
    }

    #[tokio::test]
    async fn liveness_push_includes_the_result_queue_size() {
        let harness = Harness::new();
        let participation = harness.participation();
        harness.seed_commits(&participation);
        let job = harness.enqueue_job(&participation).await;
        harness.offer_result(success_result(&job)).await;

        harness.fanout.push_liveness_snapshots().await;

        let size = harness
            .broadcaster
            .last_payload(channels::ADMIN_RESULT_QUEUE_SIZE)
            .expect("liveness signal sent");
        assert_eq!(size["size"], 1);
        assert!(
            harness
                .broadcaster
                .last_payload(channels::ADMIN_BUILD_AGENTS)
                .is_some()
        );
    }
}
