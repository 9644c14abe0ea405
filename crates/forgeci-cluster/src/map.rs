//! Distributed map abstraction.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{ClusterResult, StoreKey, StoreValue};

/// Change event emitted by a map. Removal events carry the removed value so
/// projections can route them without a second lookup.
#[derive(Debug, Clone)]
pub enum MapEvent<K, V> {
    Added { key: K, value: V },
    Updated { key: K, value: V },
    Removed { key: K, value: V },
}

/// A key/value map replicated across the cluster.
#[async_trait]
pub trait DistributedMap<K: StoreKey, V: StoreValue>: Send + Sync {
    async fn get(&self, key: &K) -> ClusterResult<Option<V>>;

    async fn put(&self, key: K, value: V) -> ClusterResult<()>;

    /// Remove an entry, returning the previous value if present.
    async fn remove(&self, key: &K) -> ClusterResult<Option<V>>;

    async fn values(&self) -> ClusterResult<Vec<V>>;

    async fn keys(&self) -> ClusterResult<Vec<K>>;

    async fn len(&self) -> ClusterResult<usize>;

    /// Change events for this map; best-effort delivery, see
    /// [`crate::queue::DistributedQueue::subscribe`].
    fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>>;
}
