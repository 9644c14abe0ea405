//! Distributed pub/sub topic abstraction.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{ClusterResult, StoreValue};

/// A fire-and-forget pub/sub topic. Messages are delivered to every
/// subscriber on every node that is listening at publish time; there is no
/// replay.
#[async_trait]
pub trait DistributedTopic<T: StoreValue>: Send + Sync {
    async fn publish(&self, message: T) -> ClusterResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<T>;
}
