//! Build-agent bookkeeping types.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::job::BuildJobQueueItem;

/// How many finished jobs an agent keeps for the dashboard history.
pub const RECENT_BUILD_JOBS_CAPACITY: usize = 20;

/// Identity of a build agent in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildAgent {
    /// Short machine name, unique within the cluster.
    pub name: String,
    pub member_address: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildAgentStatus {
    Active,
    Idle,
    /// Paused by an administrator.
    Paused,
    /// The agent paused itself, e.g. after too many consecutive build
    /// failures. Triggers an administrator notification.
    SelfPaused,
}

/// Snapshot of one agent's state in the shared agent-status map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAgentInformation {
    pub agent: BuildAgent,
    pub max_concurrent_jobs: u32,
    /// Jobs currently executing on this agent, bounded by
    /// `max_concurrent_jobs`.
    pub current_jobs: Vec<BuildJobQueueItem>,
    pub status: BuildAgentStatus,
    pub consecutive_failures: u32,
    /// Ring buffer of recently finished jobs, newest last.
    pub recent_build_jobs: VecDeque<BuildJobQueueItem>,
}

impl BuildAgentInformation {
    pub fn current_load(&self) -> u32 {
        self.current_jobs.len() as u32
    }

    /// Append or replace (by id) a finished job in the recent-jobs ring,
    /// evicting the oldest entry when the ring is full.
    pub fn record_finished_job(&mut self, job: BuildJobQueueItem) {
        if let Some(existing) = self
            .recent_build_jobs
            .iter_mut()
            .find(|recent| recent.id == job.id)
        {
            *existing = job;
            return;
        }
        if self.recent_build_jobs.len() >= RECENT_BUILD_JOBS_CAPACITY {
            self.recent_build_jobs.pop_front();
        }
        self.recent_build_jobs.push_back(job);
    }
}
