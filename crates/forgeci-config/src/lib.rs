//! KDL configuration parsing for ForgeCI.
//!
//! One `forgeci.kdl` file per node selects the cluster backend, points at
//! durable storage and tunes the scheduler periods. Every section is
//! optional; omitted values fall back to defaults that match a single-node
//! development setup.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BuildDurationSettings, ClusterBackend, ClusterSettings, DatabaseSettings, SchedulerSettings,
    SystemConfig, load_system_config, parse_system_config,
};
