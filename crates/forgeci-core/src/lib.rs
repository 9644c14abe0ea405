//! Core domain types and traits for the ForgeCI build-job lifecycle manager.
//!
//! This crate contains:
//! - Build-job identifiers and the queue/result item types shared with
//!   external build agents
//! - Build status and priority classes
//! - Build-agent bookkeeping types
//! - Collaborator port traits (commit resolution, grading, notifications,
//!   build-log persistence, fan-out delivery)

pub mod agent;
pub mod error;
pub mod id;
pub mod job;
pub mod ports;
pub mod priority;
pub mod status;

pub use error::{Error, Result};
pub use id::BuildJobId;
pub use priority::Priority;
pub use status::BuildStatus;
