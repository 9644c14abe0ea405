//! Error types for ForgeCI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("commit resolution failed: {0}")]
    CommitResolution(String),

    #[error("grading failed: {0}")]
    Grading(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("build logs could not be persisted: {0}")]
    BuildLogs(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
