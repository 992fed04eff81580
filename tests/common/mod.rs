#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use life_agent::db;
use life_agent::dispatch::Dispatcher;
use life_agent::model::PushSubscription;
use life_agent::push::{PushError, PushTransport, StaleEndpointHook};
use life_agent::realtime::RealtimePublisher;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub async fn user(pool: &sqlx::SqlitePool, id: &str) -> String {
    db::ensure_user(pool, id, fixed_now()).await.unwrap();
    id.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    pub calls: Arc<Mutex<Vec<Published>>>,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl RealtimePublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        self.calls.lock().await.push(Published {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        });
        if self.fail {
            return Err(anyhow!("realtime service unavailable"));
        }
        Ok(())
    }
}

/// How the fake push service answers a given endpoint.
#[derive(Debug, Clone, Copy)]
pub enum PushReply {
    Gone,
    Reject(u16),
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(String, Value)>>>,
    pub replies: Arc<Mutex<HashMap<String, PushReply>>>,
}

impl RecordingTransport {
    pub async fn reply_for(&self, endpoint: &str, reply: PushReply) {
        self.replies.lock().await.insert(endpoint.to_string(), reply);
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let body: Value = serde_json::from_slice(payload).map_err(|e| PushError::Transport(e.into()))?;
        self.sent
            .lock()
            .await
            .push((subscription.endpoint.clone(), body));
        match self.replies.lock().await.get(&subscription.endpoint) {
            None => Ok(()),
            Some(PushReply::Gone) => Err(PushError::Gone(410)),
            Some(PushReply::Reject(status)) => Err(PushError::Rejected {
                status: *status,
                body: "rejected".into(),
            }),
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingStaleHook {
    pub gone: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StaleEndpointHook for RecordingStaleHook {
    async fn endpoint_gone(&self, subscription: &PushSubscription) {
        self.gone.lock().await.push(subscription.endpoint.clone());
    }
}

pub struct Harness {
    pub pool: sqlx::SqlitePool,
    pub publisher: RecordingPublisher,
    pub transport: RecordingTransport,
    pub stale: RecordingStaleHook,
    pub dispatcher: Dispatcher,
}

pub async fn harness_with(publisher: RecordingPublisher) -> Harness {
    let pool = setup_pool().await;
    let transport = RecordingTransport::default();
    let stale = RecordingStaleHook::default();
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(publisher.clone()),
        Arc::new(transport.clone()),
        Arc::new(stale.clone()),
    );
    Harness {
        pool,
        publisher,
        transport,
        stale,
        dispatcher,
    }
}

pub async fn harness() -> Harness {
    harness_with(RecordingPublisher::default()).await
}

pub async fn subscribe(pool: &sqlx::SqlitePool, user_id: &str, endpoint: &str) {
    db::upsert_push_subscription(pool, user_id, endpoint, None, "p256dh-key", "auth-key", fixed_now())
        .await
        .unwrap();
}
