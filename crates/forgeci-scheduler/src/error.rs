//! Scheduler error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] forgeci_core::Error),

    #[error(transparent)]
    Database(#[from] forgeci_db::DbError),

    #[error(transparent)]
    Cluster(#[from] forgeci_cluster::ClusterError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
