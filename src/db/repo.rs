use super::model::{
    parse_notification, parse_subscription, parse_task, to_millis, NOTIFICATION_COLUMNS,
};
use crate::model::{
    EntityRef, Notification, NotificationContent, NotificationKind, NotificationStatus,
    PushSubscription, Task,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users and sessions
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn ensure_user(pool: &Pool, user_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT INTO users (id, created_at) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
        .bind(user_id)
        .bind(to_millis(now))
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_session(
    pool: &Pool,
    user_id: &str,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(token)
        .bind(user_id)
        .bind(to_millis(expires_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Resolve a bearer token into the user it was issued to. Expired tokens resolve to `None`.
#[instrument(skip_all)]
pub async fn resolve_session(pool: &Pool, token: &str, now: DateTime<Utc>) -> Result<Option<String>> {
    let user_id = sqlx::query_scalar::<_, String>(
        "SELECT user_id FROM sessions WHERE token = ? AND expires_at > ?",
    )
    .bind(token)
    .bind(to_millis(now))
    .fetch_optional(pool)
    .await?;
    Ok(user_id)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(user_id = %user_id, kind = content.kind.as_str()))]
pub async fn insert_notification(
    pool: &Pool,
    user_id: &str,
    content: &NotificationContent,
    status: NotificationStatus,
    now: DateTime<Utc>,
) -> Result<Notification> {
    let id = uuid::Uuid::new_v4().to_string();
    let (entity_type, entity_id) = match &content.entity {
        Some(e) => (Some(e.entity_type.as_str()), Some(e.entity_id.as_str())),
        None => (None, None),
    };
    let sql = format!(
        "INSERT INTO notifications (id, user_id, kind, title, message, entity_type, entity_id, status, scheduled_for, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
        NOTIFICATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&id)
        .bind(user_id)
        .bind(content.kind.as_str())
        .bind(&content.title)
        .bind(content.message.as_deref())
        .bind(entity_type)
        .bind(entity_id)
        .bind(status.as_str())
        .bind(content.scheduled_for.map(to_millis))
        .bind(to_millis(now))
        .fetch_one(pool)
        .await
        .context("failed to insert notification")?;
    parse_notification(&row)
}

/// Fetch a notification scoped to its owner. Someone else's notification is `None`.
#[instrument(skip_all)]
pub async fn get_notification(pool: &Pool, id: &str, user_id: &str) -> Result<Option<Notification>> {
    let sql = format!(
        "SELECT {} FROM notifications WHERE id = ? AND user_id = ?",
        NOTIFICATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(parse_notification).transpose()
}

/// Transition a notification to `read`. Already-read rows keep their original `read_at`.
/// Returns `None` when the row is missing or owned by someone else.
#[instrument(skip_all)]
pub async fn mark_notification_read(
    pool: &Pool,
    id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Notification>> {
    let sql = format!(
        "UPDATE notifications SET status = 'read', read_at = COALESCE(read_at, ?) \
         WHERE id = ? AND user_id = ? RETURNING {}",
        NOTIFICATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(to_millis(now))
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(parse_notification).transpose()
}

/// Mark every unread notification of a user as read in one transaction.
#[instrument(skip_all)]
pub async fn mark_all_read(pool: &Pool, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE notifications SET status = 'read', read_at = ? WHERE user_id = ? AND status != 'read'",
    )
    .bind(to_millis(now))
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn list_unread(pool: &Pool, user_id: &str) -> Result<Vec<Notification>> {
    let sql = format!(
        "SELECT {} FROM notifications WHERE user_id = ? AND status IN ('pending', 'sent') \
         ORDER BY created_at DESC, rowid DESC",
        NOTIFICATION_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
    rows.iter().map(parse_notification).collect()
}

/// Ids of pending notifications whose scheduled time has been reached.
#[instrument(skip_all)]
pub async fn due_pending_notification_ids(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM notifications WHERE status = 'pending' AND scheduled_for IS NOT NULL \
         AND scheduled_for <= ? ORDER BY scheduled_for ASC",
    )
    .bind(to_millis(now))
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Move the given pending notifications to `sent` as one batch. Either every
/// eligible row is updated or, on error, none is.
#[instrument(skip_all, fields(count = ids.len()))]
pub async fn promote_to_sent(pool: &Pool, ids: &[String], now: DateTime<Utc>) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "UPDATE notifications SET status = 'sent' WHERE status = 'pending' \
         AND scheduled_for <= ? AND id IN ({})",
        placeholders
    );
    let mut tx = pool.begin().await?;
    let mut query = sqlx::query(&sql).bind(to_millis(now));
    for id in ids {
        query = query.bind(id);
    }
    let res = query
        .execute(&mut *tx)
        .await
        .context("failed to promote due notifications")?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

/// Whether an equivalent notification was created for this user since `since`.
#[instrument(skip_all)]
pub async fn recent_notification_exists(
    pool: &Pool,
    user_id: &str,
    kind: NotificationKind,
    entity: Option<&EntityRef>,
    since: DateTime<Utc>,
) -> Result<bool> {
    let count: i64 = match entity {
        Some(e) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND kind = ? \
                 AND entity_type = ? AND entity_id = ? AND created_at >= ?",
            )
            .bind(user_id)
            .bind(kind.as_str())
            .bind(&e.entity_type)
            .bind(&e.entity_id)
            .bind(to_millis(since))
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND kind = ? \
                 AND entity_id IS NULL AND created_at >= ?",
            )
            .bind(user_id)
            .bind(kind.as_str())
            .bind(to_millis(since))
            .fetch_one(pool)
            .await?
        }
    };
    Ok(count > 0)
}

// ---------------------------------------------------------------------------
// Push subscriptions
// ---------------------------------------------------------------------------

/// Store the user's push endpoint, replacing any previous one (last writer wins).
#[instrument(skip_all)]
pub async fn upsert_push_subscription(
    pool: &Pool,
    user_id: &str,
    endpoint: &str,
    expiration_time: Option<DateTime<Utc>>,
    p256dh: &str,
    auth: &str,
    now: DateTime<Utc>,
) -> Result<PushSubscription> {
    let row = sqlx::query(
        "INSERT INTO push_subscriptions (user_id, endpoint, expiration_time, p256dh, auth, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET endpoint = excluded.endpoint, \
            expiration_time = excluded.expiration_time, p256dh = excluded.p256dh, \
            auth = excluded.auth, created_at = excluded.created_at \
         RETURNING user_id, endpoint, expiration_time, p256dh, auth, created_at",
    )
    .bind(user_id)
    .bind(endpoint)
    .bind(expiration_time.map(to_millis))
    .bind(p256dh)
    .bind(auth)
    .bind(to_millis(now))
    .fetch_one(pool)
    .await
    .context("failed to upsert push subscription")?;
    parse_subscription(&row)
}

#[instrument(skip_all)]
pub async fn get_push_subscriptions(pool: &Pool, user_id: &str) -> Result<Vec<PushSubscription>> {
    let rows = sqlx::query(
        "SELECT user_id, endpoint, expiration_time, p256dh, auth, created_at \
         FROM push_subscriptions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_subscription).collect()
}

#[instrument(skip_all)]
pub async fn delete_push_subscription(pool: &Pool, user_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM push_subscriptions WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Delete the user's subscription only if it still points at `endpoint`, so a
/// newer re-subscription is never removed because an old endpoint died.
#[instrument(skip_all)]
pub async fn delete_push_subscription_endpoint(
    pool: &Pool,
    user_id: &str,
    endpoint: &str,
) -> Result<bool> {
    let res = sqlx::query("DELETE FROM push_subscriptions WHERE user_id = ? AND endpoint = ?")
        .bind(user_id)
        .bind(endpoint)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Tasks (read by the sweeper; written by the task CRUD surface)
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_task(
    pool: &Pool,
    user_id: &str,
    title: &str,
    due_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let row = sqlx::query(
        "INSERT INTO tasks (id, user_id, title, due_at, completed, created_at) VALUES (?, ?, ?, ?, 0, ?) \
         RETURNING id, user_id, title, due_at, completed",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(title)
    .bind(due_at.map(to_millis))
    .bind(to_millis(now))
    .fetch_one(pool)
    .await?;
    parse_task(&row)
}

#[instrument(skip_all)]
pub async fn complete_task(pool: &Pool, task_id: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE tasks SET completed = 1 WHERE id = ?")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Users with at least one incomplete task that has a due date.
#[instrument(skip_all)]
pub async fn users_with_open_tasks(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT user_id FROM tasks WHERE completed = 0 AND due_at IS NOT NULL ORDER BY user_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn open_tasks_for_user(pool: &Pool, user_id: &str) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT id, user_id, title, due_at, completed FROM tasks \
         WHERE user_id = ? AND completed = 0 AND due_at IS NOT NULL ORDER BY due_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_task).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/life-agent-test/a.db"),
            "sqlite:///tmp/life-agent-test/a.db?mode=rwc"
        );
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/life-agent-test/a.db?mode=ro"),
            "sqlite:///tmp/life-agent-test/a.db?mode=ro"
        );
    }

    #[tokio::test]
    async fn read_transitions_are_owner_scoped() {
        let pool = setup_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();
        ensure_user(&pool, "bob", t0()).await.unwrap();

        let content = NotificationContent::new(NotificationKind::System, "hello");
        let n = insert_notification(&pool, "alice", &content, NotificationStatus::Sent, t0())
            .await
            .unwrap();

        assert!(mark_notification_read(&pool, &n.id, "bob", t0())
            .await
            .unwrap()
            .is_none());
        assert!(get_notification(&pool, &n.id, "bob").await.unwrap().is_none());

        let first = mark_notification_read(&pool, &n.id, "alice", t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, NotificationStatus::Read);
        assert_eq!(first.read_at, Some(t0()));

        let later = t0() + Duration::minutes(5);
        let second = mark_notification_read(&pool, &n.id, "alice", later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.status, NotificationStatus::Read);
        assert_eq!(second.read_at, Some(t0()));
    }

    #[tokio::test]
    async fn promote_skips_future_and_non_pending_rows() {
        let pool = setup_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();

        let due = NotificationContent::new(NotificationKind::System, "due")
            .scheduled_for(t0() - Duration::minutes(1));
        let future = NotificationContent::new(NotificationKind::System, "future")
            .scheduled_for(t0() + Duration::hours(1));
        let due = insert_notification(&pool, "alice", &due, NotificationStatus::Pending, t0())
            .await
            .unwrap();
        let future =
            insert_notification(&pool, "alice", &future, NotificationStatus::Pending, t0())
                .await
                .unwrap();

        let ids = due_pending_notification_ids(&pool, t0()).await.unwrap();
        assert_eq!(ids, vec![due.id.clone()]);

        // Even if handed a future id, the guard keeps it pending.
        let updated = promote_to_sent(&pool, &[due.id.clone(), future.id.clone()], t0())
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let still = get_notification(&pool, &future.id, "alice").await.unwrap().unwrap();
        assert_eq!(still.status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn subscription_upsert_replaces_previous_endpoint() {
        let pool = setup_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();

        upsert_push_subscription(&pool, "alice", "https://push/1", None, "k1", "a1", t0())
            .await
            .unwrap();
        upsert_push_subscription(&pool, "alice", "https://push/2", None, "k2", "a2", t0())
            .await
            .unwrap();

        let subs = get_push_subscriptions(&pool, "alice").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].endpoint, "https://push/2");

        assert!(!delete_push_subscription_endpoint(&pool, "alice", "https://push/1")
            .await
            .unwrap());
        assert!(delete_push_subscription(&pool, "alice").await.unwrap());
        assert!(get_push_subscriptions(&pool, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_sessions_do_not_resolve() {
        let pool = setup_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();
        create_session(&pool, "alice", "tok", t0() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(
            resolve_session(&pool, "tok", t0()).await.unwrap().as_deref(),
            Some("alice")
        );
        assert!(resolve_session(&pool, "tok", t0() + Duration::hours(2))
            .await
            .unwrap()
            .is_none());
        assert!(resolve_session(&pool, "nope", t0()).await.unwrap().is_none());
    }
}
