//! Shared cluster-state abstraction for ForgeCI.
//!
//! All coordination between stateless API nodes and the external build
//! agents happens through named, network-replicated structures: a priority
//! queue of build jobs, a map of processing jobs, a queue of build results,
//! an agent-status map, and a handful of pub/sub topics. This crate unifies
//! the two backing technologies (single-process memory for development and
//! tests, Redis for production clusters) behind one set of trait
//! abstractions, selected by configuration.
//!
//! The [`store::ClusterStore`] accessor owns lazily-created typed handles to
//! every named structure and is the only type the lifecycle services talk
//! to.

pub mod backend;
pub mod error;
pub mod map;
pub mod provider;
pub mod queue;
pub mod store;
pub mod topic;

pub use backend::{MemoryProvider, RedisProvider};
pub use error::{ClusterError, ClusterResult};
pub use map::{DistributedMap, MapEvent};
pub use provider::{ClusterProvider, DynMap, DynQueue, DynTopic};
pub use queue::{DistributedQueue, Prioritized, QueueEvent};
pub use store::ClusterStore;
pub use topic::DistributedTopic;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;

/// Bound for values stored in cluster structures.
pub trait StoreValue:
    Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> StoreValue for T where
    T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Bound for map keys. Keys travel as their string form so that both
/// backends agree on the hash-field encoding.
pub trait StoreKey: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static {}
