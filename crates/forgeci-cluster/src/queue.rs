//! Distributed queue abstraction.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{ClusterResult, StoreValue};

/// Change event emitted by a queue.
#[derive(Debug, Clone)]
pub enum QueueEvent<T> {
    Added(T),
    Removed(T),
}

/// Items stored in a priority queue expose a numeric urgency. Lower values
/// are polled first; the order among equal values is deliberately left
/// unspecified.
pub trait Prioritized {
    fn priority_value(&self) -> i64;
}

/// A queue replicated across the cluster.
///
/// `poll` is the one operation required to be atomic across concurrent
/// callers on any node: every item is handed to exactly one caller.
#[async_trait]
pub trait DistributedQueue<T: StoreValue>: Send + Sync {
    async fn offer(&self, item: T) -> ClusterResult<()>;

    async fn poll(&self) -> ClusterResult<Option<T>>;

    /// Snapshot of all queued items without consuming them, most urgent
    /// first for priority queues.
    async fn peek_all(&self) -> ClusterResult<Vec<T>>;

    async fn size(&self) -> ClusterResult<usize>;

    /// Remove one occurrence of `item`. Returns whether anything was
    /// removed.
    async fn remove(&self, item: &T) -> ClusterResult<bool>;

    /// Change events for this queue. Delivery is best effort: receivers can
    /// lag and drop events, which is why consumers pair subscriptions with
    /// periodic fallback drains.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T>>;
}
