//! Notification dispatch: persist, announce, push.
//!
//! The three steps have decreasing criticality. Only the durable write can
//! fail a dispatch; announce and push failures are caught where they happen,
//! logged, and reported in the returned [`DispatchOutcome`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::model::{Notification, NotificationContent, PushSubscription};
use crate::push::{PushError, PushPayload, PushTransport, StaleEndpointHook};
use crate::realtime::{RealtimePublisher, NEW_NOTIFICATION_EVENT};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid notification: {0}")]
    Validation(&'static str),
    #[error("failed to store notification: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Gone,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub endpoint: String,
    pub status: DeliveryStatus,
}

/// What happened during one dispatch call. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub notification: Notification,
    pub published: bool,
    pub deliveries: Vec<DeliveryReport>,
}

impl DispatchOutcome {
    pub fn delivered_count(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Delivered)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.deliveries.len() - self.delivered_count()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    publisher: Arc<dyn RealtimePublisher>,
    transport: Arc<dyn PushTransport>,
    stale_hook: Arc<dyn StaleEndpointHook>,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        publisher: Arc<dyn RealtimePublisher>,
        transport: Arc<dyn PushTransport>,
        stale_hook: Arc<dyn StaleEndpointHook>,
    ) -> Self {
        Self {
            pool,
            publisher,
            transport,
            stale_hook,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Persist a notification for `owner_id`, announce it on the owner's topic
    /// and push it to every registered endpoint.
    #[instrument(skip_all, fields(owner_id = %owner_id, kind = content.kind.as_str()))]
    pub async fn dispatch(
        &self,
        owner_id: &str,
        content: NotificationContent,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        content.validate().map_err(DispatchError::Validation)?;

        let status = content.initial_status(now);
        let notification = db::insert_notification(&self.pool, owner_id, &content, status, now)
            .await
            .map_err(DispatchError::Store)?;

        let published = self.announce(&notification).await;
        let deliveries = self.push_to_all(&notification).await;

        info!(
            notification_id = %notification.id,
            published,
            endpoints = deliveries.len(),
            "dispatched notification"
        );
        Ok(DispatchOutcome {
            notification,
            published,
            deliveries,
        })
    }

    async fn announce(&self, notification: &Notification) -> bool {
        let payload = match serde_json::to_value(notification) {
            Ok(v) => v,
            Err(err) => {
                warn!(?err, notification_id = %notification.id, "failed to encode realtime payload");
                return false;
            }
        };
        match self
            .publisher
            .publish(&notification.user_id, NEW_NOTIFICATION_EVENT, payload)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, notification_id = %notification.id, "realtime publish failed");
                false
            }
        }
    }

    async fn push_to_all(&self, notification: &Notification) -> Vec<DeliveryReport> {
        let subscriptions = match db::get_push_subscriptions(&self.pool, &notification.user_id).await {
            Ok(subs) => subs,
            Err(err) => {
                warn!(?err, user_id = %notification.user_id, "failed to load push subscriptions");
                return Vec::new();
            }
        };
        if subscriptions.is_empty() {
            debug!(user_id = %notification.user_id, "no push subscriptions");
            return Vec::new();
        }

        let payload = match PushPayload::from_notification(notification).to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(?err, notification_id = %notification.id, "failed to encode push payload");
                return subscriptions
                    .into_iter()
                    .map(|s| DeliveryReport {
                        endpoint: s.endpoint,
                        status: DeliveryStatus::Failed(format!("{:#}", err)),
                    })
                    .collect();
            }
        };

        self.deliver_all(&subscriptions, &payload).await
    }

    /// Send `payload` to every subscription concurrently. One endpoint's
    /// failure never affects another; reports keep the input order.
    pub async fn deliver_all(
        &self,
        subscriptions: &[PushSubscription],
        payload: &[u8],
    ) -> Vec<DeliveryReport> {
        join_all(subscriptions.iter().map(|sub| self.deliver_one(sub, payload))).await
    }

    async fn deliver_one(&self, subscription: &PushSubscription, payload: &[u8]) -> DeliveryReport {
        let status = match self.transport.send(subscription, payload).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(PushError::Gone(code)) => {
                warn!(endpoint = %subscription.endpoint, code, "push endpoint gone");
                self.stale_hook.endpoint_gone(subscription).await;
                DeliveryStatus::Gone
            }
            Err(err) => {
                warn!(%err, endpoint = %subscription.endpoint, "push delivery failed");
                DeliveryStatus::Failed(err.to_string())
            }
        };
        DeliveryReport {
            endpoint: subscription.endpoint.clone(),
            status,
        }
    }

    /// Acknowledge one notification. `None` covers both a missing record and
    /// one owned by another user.
    pub async fn mark_as_read(
        &self,
        notification_id: &str,
        requesting_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        db::mark_notification_read(&self.pool, notification_id, requesting_user_id, now).await
    }

    pub async fn mark_all_as_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        db::mark_all_read(&self.pool, user_id, now).await
    }

    pub async fn list_unread(&self, user_id: &str) -> Result<Vec<Notification>> {
        db::list_unread(&self.pool, user_id).await
    }
}
