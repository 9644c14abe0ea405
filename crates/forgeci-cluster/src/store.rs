//! Typed accessor over the named cluster structures.
//!
//! All structures are created lazily on first access. Read helpers degrade
//! to empty results instead of failing while the cluster connection is not
//! yet active, so dashboard read paths never hard-fail during startup.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use forgeci_core::BuildJobId;
use forgeci_core::agent::BuildAgentInformation;
use forgeci_core::job::{BuildJobQueueItem, ResultQueueItem};

use crate::provider::{ClusterProvider, DynMap, DynQueue, DynTopic};
use crate::queue::Prioritized;

/// Named structures shared with the external build agents. These names are a
/// wire contract; renaming one orphans in-flight state.
pub const BUILD_JOB_QUEUE: &str = "build-job-queue";
pub const PROCESSING_JOBS: &str = "processing-jobs";
pub const BUILD_RESULT_QUEUE: &str = "build-result-queue";
pub const BUILD_AGENT_INFORMATION: &str = "build-agent-information";
pub const DOCKER_IMAGE_LAST_BUILD: &str = "docker-image-last-build";
pub const CANCELED_BUILD_JOBS_TOPIC: &str = "canceled-build-jobs";
pub const PAUSE_BUILD_AGENT_TOPIC: &str = "pause-build-agent";
pub const RESUME_BUILD_AGENT_TOPIC: &str = "resume-build-agent";

impl Prioritized for BuildJobQueueItem {
    fn priority_value(&self) -> i64 {
        self.priority.value() as i64
    }
}

/// Lazily-initialized typed handles over one cluster provider.
pub struct ClusterStore {
    provider: ClusterProvider,
    build_job_queue: OnceLock<DynQueue<BuildJobQueueItem>>,
    processing_jobs: OnceLock<DynMap<BuildJobId, BuildJobQueueItem>>,
    result_queue: OnceLock<DynQueue<ResultQueueItem>>,
    agent_information: OnceLock<DynMap<String, BuildAgentInformation>>,
    docker_image_last_build: OnceLock<DynMap<String, DateTime<Utc>>>,
    canceled_build_jobs: OnceLock<DynTopic<BuildJobId>>,
    pause_build_agent: OnceLock<DynTopic<String>>,
    resume_build_agent: OnceLock<DynTopic<String>>,
}

impl ClusterStore {
    pub fn new(provider: ClusterProvider) -> Self {
        Self {
            provider,
            build_job_queue: OnceLock::new(),
            processing_jobs: OnceLock::new(),
            result_queue: OnceLock::new(),
            agent_information: OnceLock::new(),
            docker_image_last_build: OnceLock::new(),
            canceled_build_jobs: OnceLock::new(),
            pause_build_agent: OnceLock::new(),
            resume_build_agent: OnceLock::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.provider.is_running()
    }

    pub fn local_member_address(&self) -> String {
        self.provider.local_member_address()
    }

    /// The shared priority queue of build jobs. Use this handle for writes
    /// and subscriptions; prefer [`ClusterStore::queued_jobs`] for reads.
    pub fn build_job_queue(&self) -> &DynQueue<BuildJobQueueItem> {
        self.build_job_queue
            .get_or_init(|| self.provider.priority_queue(BUILD_JOB_QUEUE))
    }

    /// The shared map of jobs currently claimed by an agent, keyed by job
    /// id.
    pub fn processing_jobs_map(&self) -> &DynMap<BuildJobId, BuildJobQueueItem> {
        self.processing_jobs
            .get_or_init(|| self.provider.map(PROCESSING_JOBS))
    }

    /// The shared queue of finished-build results reported by agents.
    pub fn result_queue(&self) -> &DynQueue<ResultQueueItem> {
        self.result_queue
            .get_or_init(|| self.provider.queue(BUILD_RESULT_QUEUE))
    }

    pub fn agent_information_map(&self) -> &DynMap<String, BuildAgentInformation> {
        self.agent_information
            .get_or_init(|| self.provider.map(BUILD_AGENT_INFORMATION))
    }

    /// Last time each docker image was used by a build, written by the
    /// agents and read by image-cleanup tooling.
    pub fn docker_image_last_build_map(&self) -> &DynMap<String, DateTime<Utc>> {
        self.docker_image_last_build
            .get_or_init(|| self.provider.map(DOCKER_IMAGE_LAST_BUILD))
    }

    pub fn canceled_build_jobs_topic(&self) -> &DynTopic<BuildJobId> {
        self.canceled_build_jobs
            .get_or_init(|| self.provider.topic(CANCELED_BUILD_JOBS_TOPIC))
    }

    pub fn pause_build_agent_topic(&self) -> &DynTopic<String> {
        self.pause_build_agent
            .get_or_init(|| self.provider.topic(PAUSE_BUILD_AGENT_TOPIC))
    }

    pub fn resume_build_agent_topic(&self) -> &DynTopic<String> {
        self.resume_build_agent
            .get_or_init(|| self.provider.topic(RESUME_BUILD_AGENT_TOPIC))
    }

    pub async fn queued_jobs(&self) -> Vec<BuildJobQueueItem> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.build_job_queue().peek_all().await {
            Ok(jobs) => jobs,
            Err(e) => {
                debug!(error = %e, "reading queued jobs failed, returning empty snapshot");
                Vec::new()
            }
        }
    }

    pub async fn queued_jobs_size(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.build_job_queue().size().await.unwrap_or(0)
    }

    pub async fn queued_jobs_for_course(&self, course_id: i64) -> Vec<BuildJobQueueItem> {
        self.queued_jobs()
            .await
            .into_iter()
            .filter(|job| job.course_id == course_id)
            .collect()
    }

    pub async fn queued_jobs_for_participation(
        &self,
        participation_id: i64,
    ) -> Vec<BuildJobQueueItem> {
        self.queued_jobs()
            .await
            .into_iter()
            .filter(|job| job.participation_id == participation_id)
            .collect()
    }

    pub async fn processing_jobs(&self) -> Vec<BuildJobQueueItem> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.processing_jobs_map().values().await {
            Ok(jobs) => jobs,
            Err(e) => {
                debug!(error = %e, "reading processing jobs failed, returning empty snapshot");
                Vec::new()
            }
        }
    }

    pub async fn processing_jobs_size(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.processing_jobs_map().len().await.unwrap_or(0)
    }

    pub async fn processing_job_ids(&self) -> Vec<BuildJobId> {
        if !self.is_running() {
            return Vec::new();
        }
        self.processing_jobs_map().keys().await.unwrap_or_default()
    }

    pub async fn processing_jobs_for_course(&self, course_id: i64) -> Vec<BuildJobQueueItem> {
        self.processing_jobs()
            .await
            .into_iter()
            .filter(|job| job.course_id == course_id)
            .collect()
    }

    pub async fn processing_jobs_for_participation(
        &self,
        participation_id: i64,
    ) -> Vec<BuildJobQueueItem> {
        self.processing_jobs()
            .await
            .into_iter()
            .filter(|job| job.participation_id == participation_id)
            .collect()
    }

    pub async fn processing_jobs_for_agent(&self, agent_name: &str) -> Vec<BuildJobQueueItem> {
        self.processing_jobs()
            .await
            .into_iter()
            .filter(|job| {
                job.build_agent
                    .as_ref()
                    .is_some_and(|agent| agent.name == agent_name)
            })
            .collect()
    }

    pub async fn result_queue_items(&self) -> Vec<ResultQueueItem> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.result_queue().peek_all().await {
            Ok(items) => items,
            Err(e) => {
                debug!(error = %e, "reading result queue failed, returning empty snapshot");
                Vec::new()
            }
        }
    }

    pub async fn result_queue_size(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.result_queue().size().await.unwrap_or(0)
    }

    pub async fn build_agent_information(&self) -> Vec<BuildAgentInformation> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.agent_information_map().values().await {
            Ok(agents) => agents,
            Err(e) => {
                debug!(error = %e, "reading agent information failed, returning empty snapshot");
                Vec::new()
            }
        }
    }
}
