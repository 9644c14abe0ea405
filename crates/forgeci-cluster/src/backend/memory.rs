//! In-process backend for single-node deployments, development and tests.
//!
//! All structures live in this process; "replication" degenerates to shared
//! ownership through `Arc`. Two `ClusterStore`s built over the same
//! `MemoryProvider` observe the same data, which the concurrency tests rely
//! on.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::map::{DistributedMap, MapEvent};
use crate::queue::{DistributedQueue, Prioritized, QueueEvent};
use crate::topic::DistributedTopic;
use crate::{ClusterResult, StoreKey, StoreValue};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-process provider of named structures.
pub struct MemoryProvider {
    member_address: String,
    running: AtomicBool,
    structures: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl MemoryProvider {
    pub fn new(member_address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            member_address: member_address.into(),
            running: AtomicBool::new(true),
            structures: DashMap::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    /// Simulate cluster startup/shutdown. Read paths of the store degrade to
    /// empty results while not running.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, AtomicOrdering::Relaxed);
    }

    pub fn member_address(&self) -> String {
        self.member_address.clone()
    }

    fn get_or_create<S: Send + Sync + 'static>(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<S>,
    ) -> Arc<S> {
        let key = format!("{name}@{}", std::any::type_name::<S>());
        let entry = self
            .structures
            .entry(key)
            .or_insert_with(|| create() as Arc<dyn Any + Send + Sync>)
            .clone();
        match entry.downcast::<S>() {
            Ok(structure) => structure,
            // The registry key embeds the concrete type name.
            Err(_) => unreachable!("structure registered under a different type"),
        }
    }

    pub fn queue<T: StoreValue>(&self, name: &str) -> Arc<MemoryQueue<T>> {
        self.get_or_create(name, || Arc::new(MemoryQueue::new()))
    }

    pub fn priority_queue<T: StoreValue + Prioritized>(
        &self,
        name: &str,
    ) -> Arc<MemoryPriorityQueue<T>> {
        self.get_or_create(name, || Arc::new(MemoryPriorityQueue::new()))
    }

    pub fn map<K: StoreKey, V: StoreValue>(&self, name: &str) -> Arc<MemoryMap<K, V>> {
        self.get_or_create(name, || Arc::new(MemoryMap::new()))
    }

    pub fn topic<T: StoreValue>(&self, name: &str) -> Arc<MemoryTopic<T>> {
        self.get_or_create(name, || Arc::new(MemoryTopic::new()))
    }
}

/// FIFO queue backed by a mutexed `VecDeque`.
pub struct MemoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    events: broadcast::Sender<QueueEvent<T>>,
}

impl<T: StoreValue> MemoryQueue<T> {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            items: Mutex::new(VecDeque::new()),
            events,
        }
    }
}

#[async_trait]
impl<T: StoreValue> DistributedQueue<T> for MemoryQueue<T> {
    async fn offer(&self, item: T) -> ClusterResult<()> {
        self.items.lock().push_back(item.clone());
        let _ = self.events.send(QueueEvent::Added(item));
        Ok(())
    }

    async fn poll(&self) -> ClusterResult<Option<T>> {
        let item = self.items.lock().pop_front();
        if let Some(item) = &item {
            let _ = self.events.send(QueueEvent::Removed(item.clone()));
        }
        Ok(item)
    }

    async fn peek_all(&self) -> ClusterResult<Vec<T>> {
        Ok(self.items.lock().iter().cloned().collect())
    }

    async fn size(&self) -> ClusterResult<usize> {
        Ok(self.items.lock().len())
    }

    async fn remove(&self, item: &T) -> ClusterResult<bool> {
        let removed = {
            let mut items = self.items.lock();
            match items.iter().position(|queued| queued == item) {
                Some(index) => {
                    items.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.events.send(QueueEvent::Removed(item.clone()));
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T>> {
        self.events.subscribe()
    }
}

struct HeapEntry<T> {
    seq: u64,
    item: T,
}

impl<T: Prioritized> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T: Prioritized> Eq for HeapEntry<T> {}

impl<T: Prioritized> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Prioritized> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry, so lower priority values and
        // earlier insertions must compare greater.
        other
            .item
            .priority_value()
            .cmp(&self.item.priority_value())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue backed by a mutexed `BinaryHeap`. Lower priority values
/// are polled first; ties fall back to insertion order, which is an
/// implementation detail and not part of the contract.
pub struct MemoryPriorityQueue<T> {
    items: Mutex<BinaryHeap<HeapEntry<T>>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<QueueEvent<T>>,
}

impl<T: StoreValue + Prioritized> MemoryPriorityQueue<T> {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            items: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }
}

#[async_trait]
impl<T: StoreValue + Prioritized> DistributedQueue<T> for MemoryPriorityQueue<T> {
    async fn offer(&self, item: T) -> ClusterResult<()> {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.items.lock().push(HeapEntry {
            seq,
            item: item.clone(),
        });
        let _ = self.events.send(QueueEvent::Added(item));
        Ok(())
    }

    async fn poll(&self) -> ClusterResult<Option<T>> {
        let item = self.items.lock().pop().map(|entry| entry.item);
        if let Some(item) = &item {
            let _ = self.events.send(QueueEvent::Removed(item.clone()));
        }
        Ok(item)
    }

    async fn peek_all(&self) -> ClusterResult<Vec<T>> {
        let items = self.items.lock();
        let mut entries: Vec<_> = items
            .iter()
            .map(|entry| (entry.item.priority_value(), entry.seq, entry.item.clone()))
            .collect();
        entries.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        Ok(entries.into_iter().map(|(_, _, item)| item).collect())
    }

    async fn size(&self) -> ClusterResult<usize> {
        Ok(self.items.lock().len())
    }

    async fn remove(&self, item: &T) -> ClusterResult<bool> {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            let mut entries: Vec<_> = std::mem::take(&mut *items).into_vec();
            if let Some(index) = entries.iter().position(|entry| &entry.item == item) {
                entries.remove(index);
            }
            let after = entries.len();
            *items = entries.into_iter().collect();
            after < before
        };
        if removed {
            let _ = self.events.send(QueueEvent::Removed(item.clone()));
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T>> {
        self.events.subscribe()
    }
}

/// Map backed by a `DashMap`.
pub struct MemoryMap<K: StoreKey, V> {
    entries: DashMap<K, V>,
    events: broadcast::Sender<MapEvent<K, V>>,
}

impl<K: StoreKey, V: StoreValue> MemoryMap<K, V> {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> DistributedMap<K, V> for MemoryMap<K, V> {
    async fn get(&self, key: &K) -> ClusterResult<Option<V>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: K, value: V) -> ClusterResult<()> {
        let previous = self.entries.insert(key.clone(), value.clone());
        let event = match previous {
            Some(_) => MapEvent::Updated { key, value },
            None => MapEvent::Added { key, value },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn remove(&self, key: &K) -> ClusterResult<Option<V>> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if let Some(value) = &removed {
            let _ = self.events.send(MapEvent::Removed {
                key: key.clone(),
                value: value.clone(),
            });
        }
        Ok(removed)
    }

    async fn values(&self) -> ClusterResult<Vec<V>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn keys(&self) -> ClusterResult<Vec<K>> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn len(&self) -> ClusterResult<usize> {
        Ok(self.entries.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>> {
        self.events.subscribe()
    }
}

/// Topic backed by a broadcast channel.
pub struct MemoryTopic<T> {
    messages: broadcast::Sender<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreValue> MemoryTopic<T> {
    fn new() -> Self {
        let (messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            messages,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: StoreValue> DistributedTopic<T> for MemoryTopic<T> {
    async fn publish(&self, message: T) -> ClusterResult<()> {
        let _ = self.messages.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<T> {
        self.messages.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
        priority: i64,
    }

    impl Prioritized for Item {
        fn priority_value(&self) -> i64 {
            self.priority
        }
    }

    #[tokio::test]
    async fn priority_queue_polls_most_urgent_first() {
        let provider = MemoryProvider::new("localhost:0");
        let queue = provider.priority_queue::<Item>("jobs");

        for priority in [3, 1, 2] {
            queue
                .offer(Item {
                    id: priority as u32,
                    priority,
                })
                .await
                .unwrap();
        }

        let order: Vec<i64> = [
            queue.poll().await.unwrap().unwrap().priority,
            queue.poll().await.unwrap().unwrap().priority,
            queue.poll().await.unwrap().unwrap().priority,
        ]
        .into();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queue.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn peek_all_orders_without_consuming() {
        let provider = MemoryProvider::new("localhost:0");
        let queue = provider.priority_queue::<Item>("jobs");
        for priority in [2, 3, 1] {
            queue.offer(Item { id: 0, priority }).await.unwrap();
        }

        let snapshot = queue.peek_all().await.unwrap();
        assert_eq!(
            snapshot.iter().map(|item| item.priority).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(queue.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn named_structures_are_shared() {
        let provider = MemoryProvider::new("localhost:0");
        let first = provider.queue::<Item>("results");
        let second = provider.queue::<Item>("results");

        first.offer(Item { id: 7, priority: 0 }).await.unwrap();
        assert_eq!(second.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_events_report_adds_and_removes() {
        let provider = MemoryProvider::new("localhost:0");
        let queue = provider.queue::<Item>("results");
        let mut events = queue.subscribe();

        queue.offer(Item { id: 1, priority: 0 }).await.unwrap();
        queue.poll().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Added(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            QueueEvent::Removed(_)
        ));
    }

    #[tokio::test]
    async fn map_distinguishes_add_from_update() {
        let provider = MemoryProvider::new("localhost:0");
        let map = provider.map::<String, Item>("agents");
        let mut events = map.subscribe();

        map.put("a".into(), Item { id: 1, priority: 0 }).await.unwrap();
        map.put("a".into(), Item { id: 2, priority: 0 }).await.unwrap();
        map.remove(&"a".to_string()).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), MapEvent::Added { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            MapEvent::Updated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            MapEvent::Removed { .. }
        ));
        assert_eq!(map.len().await.unwrap(), 0);
    }
}
