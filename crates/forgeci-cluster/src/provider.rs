//! Backend selection.

use std::sync::Arc;

use crate::backend::{MemoryProvider, RedisProvider};
use crate::map::DistributedMap;
use crate::queue::{DistributedQueue, Prioritized};
use crate::topic::DistributedTopic;
use crate::{StoreKey, StoreValue};

pub type DynQueue<T> = Arc<dyn DistributedQueue<T>>;
pub type DynMap<K, V> = Arc<dyn DistributedMap<K, V>>;
pub type DynTopic<T> = Arc<dyn DistributedTopic<T>>;

/// The configured backing technology for all cluster structures.
///
/// Both adapters hand out the same structure instance for the same name, so
/// every service in the process observes identical state.
#[derive(Clone)]
pub enum ClusterProvider {
    Memory(Arc<MemoryProvider>),
    Redis(Arc<RedisProvider>),
}

impl ClusterProvider {
    pub fn priority_queue<T: StoreValue + Prioritized>(&self, name: &str) -> DynQueue<T> {
        match self {
            ClusterProvider::Memory(provider) => provider.priority_queue(name),
            ClusterProvider::Redis(provider) => provider.priority_queue(name),
        }
    }

    pub fn queue<T: StoreValue>(&self, name: &str) -> DynQueue<T> {
        match self {
            ClusterProvider::Memory(provider) => provider.queue(name),
            ClusterProvider::Redis(provider) => provider.queue(name),
        }
    }

    pub fn map<K: StoreKey, V: StoreValue>(&self, name: &str) -> DynMap<K, V> {
        match self {
            ClusterProvider::Memory(provider) => provider.map(name),
            ClusterProvider::Redis(provider) => provider.map(name),
        }
    }

    pub fn topic<T: StoreValue>(&self, name: &str) -> DynTopic<T> {
        match self {
            ClusterProvider::Memory(provider) => provider.topic(name),
            ClusterProvider::Redis(provider) => provider.topic(name),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            ClusterProvider::Memory(provider) => provider.is_running(),
            ClusterProvider::Redis(provider) => provider.is_running(),
        }
    }

    pub fn local_member_address(&self) -> String {
        match self {
            ClusterProvider::Memory(provider) => provider.member_address(),
            ClusterProvider::Redis(provider) => provider.member_address(),
        }
    }
}
