//! Redis backend for multi-node clusters.
//!
//! Structure mapping: priority queues are sorted sets scored by priority,
//! fifo queues are lists, maps are hashes, topics are pub/sub channels.
//! Change events are published on a per-structure channel and forwarded into
//! a local broadcast channel by a background task, so subscribers see events
//! regardless of which node performed the mutation.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::map::{DistributedMap, MapEvent};
use crate::queue::{DistributedQueue, Prioritized, QueueEvent};
use crate::topic::DistributedTopic;
use crate::{ClusterError, ClusterResult, StoreKey, StoreValue};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Redis-backed provider of named structures.
pub struct RedisProvider {
    client: redis::Client,
    conn: ConnectionManager,
    key_prefix: String,
    running: AtomicBool,
    structures: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl RedisProvider {
    /// Connect and verify the server is reachable.
    pub async fn connect(url: &str, key_prefix: &str) -> ClusterResult<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(url, "connected to redis cluster backend");

        Ok(Arc::new(Self {
            client,
            conn,
            key_prefix: key_prefix.to_string(),
            running: AtomicBool::new(true),
            structures: DashMap::new(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn member_address(&self) -> String {
        self.client.get_connection_info().addr.to_string()
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    fn events_channel(&self, name: &str) -> String {
        format!("{}events:{}", self.key_prefix, name)
    }

    fn topic_channel(&self, name: &str) -> String {
        format!("{}topic:{}", self.key_prefix, name)
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

    pub fn queue<T: StoreValue>(&self, name: &str) -> Arc<RedisQueue<T>> {
        self.get_or_create(name, || {
            Arc::new(RedisQueue::new(
                self.client.clone(),
                self.conn.clone(),
                self.key(name),
                self.events_channel(name),
            ))
        })
    }

    pub fn priority_queue<T: StoreValue + Prioritized>(
        &self,
        name: &str,
    ) -> Arc<RedisPriorityQueue<T>> {
        self.get_or_create(name, || {
            Arc::new(RedisPriorityQueue::new(
                self.client.clone(),
                self.conn.clone(),
                self.key(name),
                self.events_channel(name),
            ))
        })
    }

    pub fn map<K: StoreKey, V: StoreValue>(&self, name: &str) -> Arc<RedisMap<K, V>> {
        self.get_or_create(name, || {
            Arc::new(RedisMap::new(
                self.client.clone(),
                self.conn.clone(),
                self.key(name),
                self.events_channel(name),
            ))
        })
    }

    pub fn topic<T: StoreValue>(&self, name: &str) -> Arc<RedisTopic<T>> {
        self.get_or_create(name, || {
            Arc::new(RedisTopic::new(
                self.client.clone(),
                self.conn.clone(),
                self.topic_channel(name),
            ))
        })
    }
}

/// Forward messages from a redis pub/sub channel into a local broadcast
/// channel, reconnecting on subscription loss.
fn spawn_forwarder<E: Clone + Send + 'static>(
    client: redis::Client,
    channel: String,
    sender: broadcast::Sender<E>,
    decode: impl Fn(&str) -> Option<E> + Send + Sync + 'static,
) {
    tokio::spawn(async move {
        loop {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(channel, error = %e, "failed to open event subscription");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(channel, error = %e, "failed to subscribe to event channel");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel, error = %e, "dropping undecodable event payload");
                        continue;
                    }
                };
                if let Some(event) = decode(&payload) {
                    let _ = sender.send(event);
                }
            }

            warn!(channel, "event subscription lost, reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", bound = "T: StoreValue")]
enum QueueEventWire<T> {
    Added { item: T },
    Removed { item: T },
}

impl<T: StoreValue> From<QueueEventWire<T>> for QueueEvent<T> {
    fn from(wire: QueueEventWire<T>) -> Self {
        match wire {
            QueueEventWire::Added { item } => QueueEvent::Added(item),
            QueueEventWire::Removed { item } => QueueEvent::Removed(item),
        }
    }
}

async fn publish_event<T: StoreValue>(
    conn: &ConnectionManager,
    channel: &str,
    event: QueueEventWire<T>,
) -> ClusterResult<()> {
    let payload = serde_json::to_string(&event)?;
    let mut conn = conn.clone();
    let _: i64 = redis::cmd("PUBLISH")
        .arg(channel)
        .arg(payload)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

/// FIFO queue as a redis list.
pub struct RedisQueue<T> {
    conn: ConnectionManager,
    key: String,
    events_channel: String,
    events: broadcast::Sender<QueueEvent<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreValue> RedisQueue<T> {
    fn new(
        client: redis::Client,
        conn: ConnectionManager,
        key: String,
        events_channel: String,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        spawn_forwarder(client, events_channel.clone(), events.clone(), |payload| {
            serde_json::from_str::<QueueEventWire<T>>(payload)
                .ok()
                .map(QueueEvent::from)
        });
        Self {
            conn,
            key,
            events_channel,
            events,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: StoreValue> DistributedQueue<T> for RedisQueue<T> {
    async fn offer(&self, item: T) -> ClusterResult<()> {
        let serialized = serde_json::to_string(&item)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(serialized)
            .query_async(&mut conn)
            .await?;
        publish_event(&self.conn, &self.events_channel, QueueEventWire::Added { item }).await
    }

    async fn poll(&self) -> ClusterResult<Option<T>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = redis::cmd("LPOP")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        match popped {
            Some(serialized) => {
                let item: T = serde_json::from_str(&serialized)?;
                publish_event(
                    &self.conn,
                    &self.events_channel,
                    QueueEventWire::Removed { item: item.clone() },
                )
                .await?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn peek_all(&self) -> ClusterResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        entries
            .iter()
            .map(|entry| serde_json::from_str(entry).map_err(ClusterError::from))
            .collect()
    }

    async fn size(&self) -> ClusterResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len as usize)
    }

    async fn remove(&self, item: &T) -> ClusterResult<bool> {
        let serialized = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.key)
            .arg(1)
            .arg(serialized)
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            publish_event(
                &self.conn,
                &self.events_channel,
                QueueEventWire::Removed { item: item.clone() },
            )
            .await?;
        }
        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T>> {
        self.events.subscribe()
    }
}

/// Priority queue as a redis sorted set scored by priority. Members with
/// equal scores order lexicographically, which keeps the tie-break
/// deliberately unspecified.
pub struct RedisPriorityQueue<T> {
    conn: ConnectionManager,
    key: String,
    events_channel: String,
    events: broadcast::Sender<QueueEvent<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreValue + Prioritized> RedisPriorityQueue<T> {
    fn new(
        client: redis::Client,
        conn: ConnectionManager,
        key: String,
        events_channel: String,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        spawn_forwarder(client, events_channel.clone(), events.clone(), |payload| {
            serde_json::from_str::<QueueEventWire<T>>(payload)
                .ok()
                .map(QueueEvent::from)
        });
        Self {
            conn,
            key,
            events_channel,
            events,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: StoreValue + Prioritized> DistributedQueue<T> for RedisPriorityQueue<T> {
    async fn offer(&self, item: T) -> ClusterResult<()> {
        let serialized = serde_json::to_string(&item)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(item.priority_value())
            .arg(serialized)
            .query_async(&mut conn)
            .await?;
        publish_event(&self.conn, &self.events_channel, QueueEventWire::Added { item }).await
    }

    async fn poll(&self) -> ClusterResult<Option<T>> {
        let mut conn = self.conn.clone();
        // ZPOPMIN is atomic on the server, so concurrent pollers on
        // different nodes each receive distinct members. The reply is a
        // flat [member, score] array.
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(&self.key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        match popped.into_iter().next() {
            Some(serialized) => {
                let item: T = serde_json::from_str(&serialized)?;
                publish_event(
                    &self.conn,
                    &self.events_channel,
                    QueueEventWire::Removed { item: item.clone() },
                )
                .await?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn peek_all(&self) -> ClusterResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        entries
            .iter()
            .map(|entry| serde_json::from_str(entry).map_err(ClusterError::from))
            .collect()
    }

    async fn size(&self) -> ClusterResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len as usize)
    }

    async fn remove(&self, item: &T) -> ClusterResult<bool> {
        let serialized = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.key)
            .arg(serialized)
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            publish_event(
                &self.conn,
                &self.events_channel,
                QueueEventWire::Removed { item: item.clone() },
            )
            .await?;
        }
        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent<T>> {
        self.events.subscribe()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", bound = "V: StoreValue")]
enum MapEventWire<V> {
    Added { key: String, value: V },
    Updated { key: String, value: V },
    Removed { key: String, value: V },
}

/// Map as a redis hash. Keys travel as their string form.
pub struct RedisMap<K, V> {
    conn: ConnectionManager,
    key: String,
    events_channel: String,
    events: broadcast::Sender<MapEvent<K, V>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: StoreKey, V: StoreValue> RedisMap<K, V> {
    fn new(
        client: redis::Client,
        conn: ConnectionManager,
        key: String,
        events_channel: String,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        spawn_forwarder(client, events_channel.clone(), events.clone(), |payload| {
            let wire: MapEventWire<V> = serde_json::from_str(payload).ok()?;
            match wire {
                MapEventWire::Added { key, value } => {
                    Some(MapEvent::Added { key: key.parse().ok()?, value })
                }
                MapEventWire::Updated { key, value } => {
                    Some(MapEvent::Updated { key: key.parse().ok()?, value })
                }
                MapEventWire::Removed { key, value } => {
                    Some(MapEvent::Removed { key: key.parse().ok()?, value })
                }
            }
        });
        Self {
            conn,
            key,
            events_channel,
            events,
            _marker: PhantomData,
        }
    }

    async fn publish_map_event(&self, event: MapEventWire<V>) -> ClusterResult<()> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&self.events_channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> DistributedMap<K, V> for RedisMap<K, V> {
    async fn get(&self, key: &K) -> ClusterResult<Option<V>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(key.to_string())
            .query_async(&mut conn)
            .await?;
        value
            .map(|value| serde_json::from_str(&value).map_err(ClusterError::from))
            .transpose()
    }

    async fn put(&self, key: K, value: V) -> ClusterResult<()> {
        let serialized = serde_json::to_string(&value)?;
        let field = key.to_string();
        let mut conn = self.conn.clone();
        let created: i64 = redis::cmd("HSET")
            .arg(&self.key)
            .arg(&field)
            .arg(serialized)
            .query_async(&mut conn)
            .await?;
        let event = if created > 0 {
            MapEventWire::Added { key: field, value }
        } else {
            MapEventWire::Updated { key: field, value }
        };
        self.publish_map_event(event).await
    }

    async fn remove(&self, key: &K) -> ClusterResult<Option<V>> {
        let previous = self.get(key).await?;
        let field = key.to_string();
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(&self.key)
            .arg(&field)
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            if let Some(value) = previous.clone() {
                self.publish_map_event(MapEventWire::Removed { key: field, value })
                    .await?;
            }
        }
        Ok(previous)
    }

    async fn values(&self) -> ClusterResult<Vec<V>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = redis::cmd("HVALS")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        values
            .iter()
            .map(|value| serde_json::from_str(value).map_err(ClusterError::from))
            .collect()
    }

    async fn keys(&self) -> ClusterResult<Vec<K>> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = redis::cmd("HKEYS")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(fields
            .into_iter()
            .filter_map(|field| match field.parse() {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!(map = %self.key, field, "skipping unparsable map key");
                    None
                }
            })
            .collect())
    }

    async fn len(&self) -> ClusterResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("HLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(len as usize)
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>> {
        self.events.subscribe()
    }
}

/// Topic as a plain redis pub/sub channel.
pub struct RedisTopic<T> {
    conn: ConnectionManager,
    channel: String,
    messages: broadcast::Sender<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreValue> RedisTopic<T> {
    fn new(client: redis::Client, conn: ConnectionManager, channel: String) -> Self {
        let (messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        spawn_forwarder(client, channel.clone(), messages.clone(), |payload| {
            serde_json::from_str::<T>(payload).ok()
        });
        Self {
            conn,
            channel,
            messages,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: StoreValue> DistributedTopic<T> for RedisTopic<T> {
    async fn publish(&self, message: T) -> ClusterResult<()> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<T> {
        self.messages.subscribe()
    }
}
