//! Web push delivery transport.
//!
//! Payloads are encrypted (RFC 8291, `aes128gcm`) and VAPID-signed (RFC 8292)
//! with the `web-push` crate; the HTTP request itself goes out through
//! `reqwest` so the client and its connection pool are shared.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessage,
    WebPushMessageBuilder,
};

use crate::config::{Config, VAPID_PRIVATE_KEY_LEN};
use crate::db::{self, Pool};
use crate::model::{Notification, PushSubscription};

#[derive(Debug, Error)]
pub enum PushError {
    /// The push service reports the endpoint as permanently invalid.
    #[error("push endpoint is gone (HTTP {0})")]
    Gone(u16),
    #[error("push service rejected message (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("push transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

/// JSON body the service worker receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub notification_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

impl PushPayload {
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            title: n.title.clone(),
            body: n.message.clone().unwrap_or_default(),
            notification_id: n.id.clone(),
            kind: n.kind.as_str().to_string(),
            entity_type: n.entity_type.clone(),
            entity_id: n.entity_id.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode push payload")
    }
}

#[derive(Clone)]
pub struct WebPushTransport {
    http: Client,
    vapid_private_key: String,
    subject: String,
    ttl_seconds: u32,
}

impl fmt::Debug for WebPushTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebPushTransport")
            .field("subject", &self.subject)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl WebPushTransport {
    pub fn new(vapid_private_key: String, subject: String, ttl_seconds: u32) -> Result<Self> {
        // `VapidSignatureBuilder::from_base64` panics on any other length.
        let key_len = BASE64URL
            .decode(vapid_private_key.trim())
            .context("VAPID private key is not base64url")?
            .len();
        ensure!(
            key_len == VAPID_PRIVATE_KEY_LEN,
            "VAPID private key must be a raw 32-byte scalar, got {} bytes",
            key_len
        );
        let http = Client::builder()
            .user_agent("life-agent/0.1")
            .build()
            .context("failed to build push HTTP client")?;
        Ok(Self {
            http,
            vapid_private_key,
            subject,
            ttl_seconds,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.push.vapid_private_key.clone(),
            cfg.push.subject.clone(),
            cfg.push.ttl_seconds,
        )
    }

    /// Encrypt and sign `payload` for one subscription.
    pub fn build_message(
        &self,
        subscription: &PushSubscription,
        payload: &[u8],
    ) -> Result<WebPushMessage> {
        let sub_info =
            SubscriptionInfo::new(&subscription.endpoint, &subscription.p256dh, &subscription.auth);

        let mut sig_builder = VapidSignatureBuilder::from_base64(self.vapid_private_key.trim(), &sub_info)
            .context("failed to build VAPID signature")?;
        sig_builder.add_claim("sub", self.subject.as_str());
        let signature = sig_builder.build().context("failed to sign VAPID JWT")?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl_seconds);
        builder.build().context("failed to build web push message")
    }

    pub fn build_request(&self, message: WebPushMessage) -> Result<reqwest::Request> {
        let mut request = self
            .http
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }
        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }
        if let Some(payload) = message.payload {
            request = request
                .header("Content-Encoding", payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");
            for (key, value) in &payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }
            request = request.body(payload.content);
        }

        request.build().context("failed to build push request")
    }
}

/// Map a push service response onto the transport result.
pub fn classify_response(status: StatusCode, body: String) -> Result<(), PushError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(PushError::Gone(status.as_u16())),
        _ => Err(PushError::Rejected {
            status: status.as_u16(),
            body,
        }),
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let message = self.build_message(subscription, payload)?;
        let request = self.build_request(message)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("web push HTTP request failed")?;
        let status = res.status();
        let body = if status.is_success() {
            String::new()
        } else {
            res.text().await.unwrap_or_default()
        };
        classify_response(status, body)
    }
}

/// Called for every delivery that reports a permanently invalid endpoint.
#[async_trait]
pub trait StaleEndpointHook: Send + Sync {
    async fn endpoint_gone(&self, subscription: &PushSubscription);
}

/// Default hook: record the dead endpoint and leave the subscription alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStaleEndpoint;

#[async_trait]
impl StaleEndpointHook for LogStaleEndpoint {
    async fn endpoint_gone(&self, subscription: &PushSubscription) {
        info!(
            user_id = %subscription.user_id,
            endpoint = %subscription.endpoint,
            "push endpoint gone; subscription kept"
        );
    }
}

/// Opt-in hook that deletes the subscription if it still points at the dead endpoint.
#[derive(Debug, Clone)]
pub struct PruneStaleEndpoint {
    pool: Pool,
}

impl PruneStaleEndpoint {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StaleEndpointHook for PruneStaleEndpoint {
    async fn endpoint_gone(&self, subscription: &PushSubscription) {
        match db::delete_push_subscription_endpoint(
            &self.pool,
            &subscription.user_id,
            &subscription.endpoint,
        )
        .await
        {
            Ok(true) => info!(user_id = %subscription.user_id, "pruned stale push subscription"),
            Ok(false) => {}
            Err(err) => warn!(?err, user_id = %subscription.user_id, "failed to prune stale push subscription"),
        }
    }
}
