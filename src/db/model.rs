//! Row parsing at the store boundary.
//!
//! SQLite hands back loosely typed rows; everything leaving the repository is
//! converted into the domain entities here. An unknown status or kind string
//! is an error rather than a silent default. Timestamps are stored as Unix
//! milliseconds.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{Notification, NotificationKind, NotificationStatus, PushSubscription, Task};

/// Column list shared by every query that returns a full notification.
pub const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, message, entity_type, entity_id, \
     status, scheduled_for, created_at, read_at";

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

pub fn parse_notification(row: &SqliteRow) -> Result<Notification> {
    let id: String = row.try_get("id")?;

    let kind_str: String = row.try_get("kind")?;
    let kind = NotificationKind::parse_kind(&kind_str)
        .ok_or_else(|| anyhow!("notification {} has unknown kind {}", id, kind_str))?;

    let status_str: String = row.try_get("status")?;
    let status = NotificationStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("notification {} has unknown status {}", id, status_str))?;

    Ok(Notification {
        user_id: row.try_get("user_id")?,
        kind,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        status,
        scheduled_for: opt_from_millis(row.try_get("scheduled_for")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        read_at: opt_from_millis(row.try_get("read_at")?)?,
        id,
    })
}

pub fn parse_subscription(row: &SqliteRow) -> Result<PushSubscription> {
    Ok(PushSubscription {
        user_id: row.try_get("user_id")?,
        endpoint: row.try_get("endpoint")?,
        expiration_time: opt_from_millis(row.try_get("expiration_time")?)?,
        p256dh: row.try_get("p256dh")?,
        auth: row.try_get("auth")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

pub fn parse_task(row: &SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        due_at: opt_from_millis(row.try_get("due_at")?)?,
        completed: row.try_get::<i64, _>("completed")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn millis_conversion_keeps_precision() {
        let at = Utc.timestamp_millis_opt(1_714_557_600_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }

    #[test]
    fn out_of_range_millis_is_an_error() {
        assert!(from_millis(i64::MAX).is_err());
    }
}
