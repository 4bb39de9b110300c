//! Shared presence state and the cross-instance relay.
//!
//! [`PresenceStore`] is the contract the router consumes: who is online (no
//! expiry, explicitly cleared), who is typing (auto-expiring markers) and a
//! fire-and-forget publish/subscribe primitive. [`RedisPresenceStore`] backs
//! it with Redis for multi-instance deployments; [`MemoryPresenceStore`]
//! keeps everything in process.
//!
//! Neither backend replays: a subscriber that is not listening when a message
//! is published never sees it.

use crate::ws::types::{Topic, UserId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A stream of raw relay payloads for one topic. It ends when the
/// underlying subscription is lost.
pub type Subscription = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    async fn set_present(&self, user_id: UserId) -> Result<(), PresenceError>;

    async fn clear_present(&self, user_id: UserId) -> Result<(), PresenceError>;

    async fn is_present(&self, user_id: UserId) -> Result<bool, PresenceError>;

    /// Every identity currently marked present, on any instance.
    async fn online_users(&self) -> Result<Vec<UserId>, PresenceError>;

    /// Marks `user_id` as typing in `conversation_id` for the store's typing TTL.
    async fn set_typing(&self, user_id: UserId, conversation_id: &str)
    -> Result<(), PresenceError>;

    async fn is_typing(&self, user_id: UserId, conversation_id: &str)
    -> Result<bool, PresenceError>;

    async fn typing_users(&self, conversation_id: &str) -> Result<Vec<UserId>, PresenceError>;

    /// Drops typing markers whose lifetime has passed. Backends with native
    /// expiry have nothing to do.
    async fn sweep_expired_typing(&self) -> Result<usize, PresenceError> {
        Ok(0)
    }

    /// Publishes `payload` on `topic`, returning how many subscribers got it.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, PresenceError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PresenceError>;
}

fn presence_key(user_id: UserId) -> String {
    format!("user:online:{user_id}")
}

fn typing_key(conversation_id: &str, user_id: UserId) -> String {
    format!("typing:{conversation_id}:{user_id}")
}

// Keys end in `:<user id>`; anything else under the pattern is ignored.
fn trailing_user_id(key: &str) -> Option<UserId> {
    key.rsplit(':').next().and_then(|id| id.parse().ok())
}

// --- Redis ---

/// [`PresenceStore`] backed by Redis keys and Redis Pub/Sub.
#[derive(Clone)]
pub struct RedisPresenceStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    typing_ttl: Duration,
}

impl fmt::Debug for RedisPresenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPresenceStore")
            .field("typing_ttl", &self.typing_ttl)
            .finish()
    }
}

impl RedisPresenceStore {
    /// Opens the client, establishes the shared command connection and
    /// checks it with a `PING`.
    pub async fn connect(redis_url: &str, typing_ttl: Duration) -> Result<Self, PresenceError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to Redis presence store.");
        Ok(Self {
            client,
            conn,
            typing_ttl,
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, PresenceError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_present(&self, user_id: UserId) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(presence_key(user_id), "1").await?;
        Ok(())
    }

    async fn clear_present(&self, user_id: UserId) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(presence_key(user_id)).await?;
        Ok(())
    }

    async fn is_present(&self, user_id: UserId) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let present: bool = conn.exists(presence_key(user_id)).await?;
        Ok(present)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
        let keys = self.scan_keys("user:online:*").await?;
        Ok(keys.iter().filter_map(|k| trailing_user_id(k)).collect())
    }

    async fn set_typing(
        &self,
        user_id: UserId,
        conversation_id: &str,
    ) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let millis = self.typing_ttl.as_millis().max(1) as u64;
        let _: () = conn
            .pset_ex(typing_key(conversation_id, user_id), "1", millis)
            .await?;
        Ok(())
    }

    async fn is_typing(
        &self,
        user_id: UserId,
        conversation_id: &str,
    ) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let typing: bool = conn.exists(typing_key(conversation_id, user_id)).await?;
        Ok(typing)
    }

    async fn typing_users(&self, conversation_id: &str) -> Result<Vec<UserId>, PresenceError> {
        let keys = self.scan_keys(&format!("typing:{conversation_id}:*")).await?;
        Ok(keys.iter().filter_map(|k| trailing_user_id(k)).collect())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<usize, PresenceError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, payload).await?;
        debug!(?topic, ?receivers, "Published relay message to Redis");
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PresenceError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        debug!(?topic, "Subscribed to Redis channel");

        let topic: Topic = topic.to_string();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(topic = %topic, "Failed to get payload from Redis message: {}", e);
                    None
                }
            };
            async move { payload }
        });
        Ok(messages.boxed())
    }
}

// --- In process ---

const CHANNEL_CAPACITY: usize = 1024;

/// [`PresenceStore`] kept entirely in memory. Suitable for a single instance
/// and for tests; two routers sharing one `Arc<MemoryPresenceStore>` behave
/// like two instances sharing a broker.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    present: DashSet<UserId>,
    typing: DashMap<(String, UserId), Instant>,
    channels: DashMap<Topic, broadcast::Sender<String>>,
    typing_ttl: Duration,
}

impl MemoryPresenceStore {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            present: DashSet::new(),
            typing: DashMap::new(),
            channels: DashMap::new(),
            typing_ttl,
        }
    }

    /// Live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn marker_live(&self, key: &(String, UserId)) -> bool {
        self.typing
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_present(&self, user_id: UserId) -> Result<(), PresenceError> {
        self.present.insert(user_id);
        Ok(())
    }

    async fn clear_present(&self, user_id: UserId) -> Result<(), PresenceError> {
        self.present.remove(&user_id);
        Ok(())
    }

    async fn is_present(&self, user_id: UserId) -> Result<bool, PresenceError> {
        Ok(self.present.contains(&user_id))
    }

    async fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
        let mut users: Vec<UserId> = self.present.iter().map(|u| *u).collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn set_typing(
        &self,
        user_id: UserId,
        conversation_id: &str,
    ) -> Result<(), PresenceError> {
        self.typing.insert(
            (conversation_id.to_string(), user_id),
            Instant::now() + self.typing_ttl,
        );
        Ok(())
    }

    async fn is_typing(
        &self,
        user_id: UserId,
        conversation_id: &str,
    ) -> Result<bool, PresenceError> {
        Ok(self.marker_live(&(conversation_id.to_string(), user_id)))
    }

    async fn typing_users(&self, conversation_id: &str) -> Result<Vec<UserId>, PresenceError> {
        let now = Instant::now();
        let mut users: Vec<UserId> = self
            .typing
            .iter()
            .filter(|e| e.key().0 == conversation_id && *e.value() > now)
            .map(|e| e.key().1)
            .collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn sweep_expired_typing(&self) -> Result<usize, PresenceError> {
        let now = Instant::now();
        let before = self.typing.len();
        self.typing.retain(|_, expires| *expires > now);
        Ok(before.saturating_sub(self.typing.len()))
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<usize, PresenceError> {
        let receivers = match self.channels.get(topic) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if receivers == 0 {
            self.channels.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PresenceError> {
        let rx = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let topic: Topic = topic.to_string();

        let messages = stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Relay subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn presence_is_explicit() {
        let store = MemoryPresenceStore::new(Duration::from_secs(10));
        assert!(!store.is_present(1).await.unwrap());

        store.set_present(1).await.unwrap();
        store.set_present(3).await.unwrap();
        assert!(store.is_present(1).await.unwrap());
        assert_eq!(store.online_users().await.unwrap(), vec![1, 3]);

        store.clear_present(1).await.unwrap();
        assert!(!store.is_present(1).await.unwrap());
        assert_eq!(store.online_users().await.unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_marker_expires_unless_refreshed() {
        let store = MemoryPresenceStore::new(Duration::from_secs(10));
        store.set_typing(1, "private:2").await.unwrap();
        assert!(store.is_typing(1, "private:2").await.unwrap());
        assert!(!store.is_typing(1, "group:2").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        store.set_typing(1, "private:2").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.is_typing(1, "private:2").await.unwrap());
        assert_eq!(store.typing_users("private:2").await.unwrap(), vec![1]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!store.is_typing(1, "private:2").await.unwrap());
        assert!(store.typing_users("private:2").await.unwrap().is_empty());
        assert_eq!(store.sweep_expired_typing().await.unwrap(), 1);
        assert_eq!(store.sweep_expired_typing().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_only_current_subscribers() {
        let store = Arc::new(MemoryPresenceStore::new(Duration::from_secs(10)));
        assert_eq!(store.publish("ws:user:1", "early".into()).await.unwrap(), 0);

        let mut sub = store.subscribe("ws:user:1").await.unwrap();
        let mut other = store.subscribe("ws:user:2").await.unwrap();
        assert_eq!(store.publish("ws:user:1", "hello".into()).await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));

        store.publish("ws:user:2", "two".into()).await.unwrap();
        assert_eq!(other.next().await.as_deref(), Some("two"));
    }

    #[test]
    fn keys_parse_back_to_user_ids() {
        assert_eq!(trailing_user_id(&presence_key(42)), Some(42));
        assert_eq!(trailing_user_id(&typing_key("group:7", 9)), Some(9));
        assert_eq!(trailing_user_id("user:online:x"), None);
    }
}
