//! Real-time channel publisher.
//!
//! Every user has a topic named after their identifier. Connected clients
//! subscribe to it through the `/realtime` WebSocket route and receive every
//! event published on it while they are connected. Nothing is buffered for
//! clients that are offline; the stored notification is the source of truth.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Event name used when a new notification is announced.
pub const NEW_NOTIFICATION_EVENT: &str = "new_notification";

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeEvent {
    pub event: String,
    pub payload: Value,
}

#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    /// Fire-and-forget publish; no delivery acknowledgement is expected.
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<()>;
}

/// In-process topic fan-out backed by one broadcast channel per topic.
#[derive(Debug, Default)]
pub struct TopicHub {
    topics: RwLock<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on a topic. Dropping the receiver unsubscribes.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<RealtimeEvent> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    pub async fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop topics nobody listens to anymore.
    pub async fn prune(&self) {
        self.topics
            .write()
            .await
            .retain(|_, tx| tx.receiver_count() > 0);
    }
}

#[async_trait]
impl RealtimePublisher for TopicHub {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        let topics = self.topics.read().await;
        let Some(tx) = topics.get(topic) else {
            debug!(topic, event, "no listeners on topic");
            return Ok(());
        };
        let message = RealtimeEvent {
            event: event.to_string(),
            payload,
        };
        // A send error only means every listener went away in the meantime.
        match tx.send(message) {
            Ok(listeners) => debug!(topic, event, listeners, "published realtime event"),
            Err(_) => debug!(topic, event, "listeners left before publish"),
        }
        Ok(())
    }
}
