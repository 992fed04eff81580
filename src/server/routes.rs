use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiError;
use super::session::{CronCaller, Session};
use super::AppState;
use crate::db;
use crate::model::{EntityRef, Notification, NotificationContent, NotificationKind, PushSubscription};
use crate::sweeper::SweepSummary;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationBody {
    pub title: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl CreateNotificationBody {
    fn into_content(self) -> Result<NotificationContent, ApiError> {
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ApiError::Validation("title is required".into()))?;

        let kind = match self.kind.as_deref() {
            None => NotificationKind::default(),
            Some(raw) => NotificationKind::parse_kind(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown notification type: {}", raw)))?,
        };

        let entity = match (self.entity_type, self.entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityRef {
                entity_type,
                entity_id,
            }),
            (None, None) => None,
            _ => {
                return Err(ApiError::Validation(
                    "entity_type and entity_id must be given together".into(),
                ))
            }
        };

        Ok(NotificationContent {
            kind,
            title,
            message: self.message,
            entity,
            scheduled_for: self.scheduled_for,
        })
    }
}

pub async fn create_notification(
    State(state): State<AppState>,
    session: Session,
    Json(body): Json<CreateNotificationBody>,
) -> Result<Json<Notification>, ApiError> {
    let content = body.into_content()?;
    let outcome = state
        .dispatcher
        .dispatch(&session.user_id, content, Utc::now())
        .await?;
    Ok(Json(outcome.notification))
}

#[derive(Debug, Serialize)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<NotificationList>, ApiError> {
    let notifications = state.dispatcher.list_unread(&session.user_id).await?;
    Ok(Json(NotificationList { notifications }))
}

pub async fn read_one(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    state
        .dispatcher
        .mark_as_read(&id, &session.user_id, Utc::now())
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn read_all(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Value>, ApiError> {
    let count = state
        .dispatcher
        .mark_all_as_read(&session.user_id, Utc::now())
        .await?;
    Ok(Json(json!({ "success": true, "count": count })))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// `PushSubscription.toJSON()` as produced by the browser.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeBody {
    pub endpoint: String,
    #[serde(default)]
    pub expiration_time: Option<i64>,
    pub keys: SubscriptionKeys,
}

pub async fn put_subscription(
    State(state): State<AppState>,
    session: Session,
    Json(body): Json<SubscribeBody>,
) -> Result<Json<PushSubscription>, ApiError> {
    if !body.endpoint.starts_with("https://") {
        return Err(ApiError::Validation("endpoint must be an https URL".into()));
    }
    if body.keys.p256dh.is_empty() || body.keys.auth.is_empty() {
        return Err(ApiError::Validation("subscription keys are required".into()));
    }
    let expiration = body
        .expiration_time
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    let subscription = db::upsert_push_subscription(
        &state.pool,
        &session.user_id,
        &body.endpoint,
        expiration,
        &body.keys.p256dh,
        &body.keys.auth,
        Utc::now(),
    )
    .await?;
    info!(user_id = %session.user_id, "push subscription stored");
    Ok(Json(subscription))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Value>, ApiError> {
    let subscription = db::get_push_subscriptions(&state.pool, &session.user_id)
        .await?
        .into_iter()
        .next();
    Ok(Json(json!({ "subscription": subscription })))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Value>, ApiError> {
    let removed = db::delete_push_subscription(&state.pool, &session.user_id).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

pub async fn public_key(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "public_key": state.vapid_public_key.as_ref() }))
}

pub async fn sweep_notifications(
    State(state): State<AppState>,
    _cron: CronCaller,
) -> Result<Json<SweepSummary>, ApiError> {
    Ok(Json(state.sweeper.sweep_notifications(Utc::now()).await?))
}

pub async fn sweep_tasks(
    State(state): State<AppState>,
    _cron: CronCaller,
) -> Result<Json<SweepSummary>, ApiError> {
    Ok(Json(state.sweeper.sweep_tasks(Utc::now()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(v: Value) -> CreateNotificationBody {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn defaults_to_system_kind() {
        let content = body(json!({ "title": "Hi" })).into_content().unwrap();
        assert_eq!(content.kind, NotificationKind::System);
        assert!(content.entity.is_none());
    }

    #[test]
    fn blank_title_is_rejected() {
        let err = body(json!({ "title": "   " })).into_content().unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(body(json!({})).into_content().is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = body(json!({ "title": "Hi", "type": "carrier_pigeon" }))
            .into_content()
            .unwrap_err();
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[test]
    fn half_an_entity_is_rejected() {
        let err = body(json!({ "title": "Hi", "entity_id": "t-1" }))
            .into_content()
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let content = body(json!({ "title": "Hi", "entity_id": "t-1", "entity_type": "task", "type": "task_reminder" }))
            .into_content()
            .unwrap();
        assert_eq!(content.entity, Some(EntityRef::task("t-1")));
        assert_eq!(content.kind, NotificationKind::TaskReminder);
    }
}
