//! Time-based sweeps, invoked by an external timer.
//!
//! `sweep_notifications` promotes scheduled notifications whose time has come;
//! `sweep_tasks` derives reminders from task due dates and creates them through
//! the [`Dispatcher`], so they get the same announce and push fan-out.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::db;
use crate::dispatch::Dispatcher;
use crate::model::{EntityRef, NotificationContent, NotificationKind, Task};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Notifications promoted or created.
    pub count: u64,
    /// Derived reminders suppressed by the dedup window.
    pub skipped: u64,
    /// Users or batches that failed and were left for the next run.
    pub failed: u64,
}

#[derive(Clone)]
pub struct Sweeper {
    dispatcher: Dispatcher,
    due_soon: Duration,
    dedup_window: Option<Duration>,
}

impl Sweeper {
    pub fn new(dispatcher: Dispatcher, due_soon: Duration, dedup_window: Option<Duration>) -> Self {
        Self {
            dispatcher,
            due_soon,
            dedup_window,
        }
    }

    /// Move every pending notification whose `scheduled_for` has been reached to `sent`.
    #[instrument(skip_all)]
    pub async fn sweep_notifications(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let pool = self.dispatcher.pool();
        let ids = db::due_pending_notification_ids(pool, now).await?;
        if ids.is_empty() {
            return Ok(SweepSummary::default());
        }
        let count = db::promote_to_sent(pool, &ids, now).await?;
        info!(count, "promoted due notifications");
        Ok(SweepSummary {
            count,
            ..Default::default()
        })
    }

    /// Derive overdue, due-soon and due-today reminders for every user with open tasks.
    #[instrument(skip_all)]
    pub async fn sweep_tasks(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let pool = self.dispatcher.pool();
        let users = db::users_with_open_tasks(pool).await?;
        let mut summary = SweepSummary::default();

        for user_id in users {
            let tasks = match db::open_tasks_for_user(pool, &user_id).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    warn!(?err, %user_id, "failed to load tasks; skipping user");
                    summary.failed += 1;
                    continue;
                }
            };
            for content in derive_reminders(&tasks, now, self.due_soon) {
                if self.recently_sent(&user_id, &content, now).await {
                    summary.skipped += 1;
                    continue;
                }
                match self.dispatcher.dispatch(&user_id, content, now).await {
                    Ok(_) => summary.count += 1,
                    Err(err) => {
                        warn!(%err, %user_id, "failed to create task reminder");
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            created = summary.count,
            skipped = summary.skipped,
            failed = summary.failed,
            "task sweep finished"
        );
        Ok(summary)
    }

    async fn recently_sent(&self, user_id: &str, content: &NotificationContent, now: DateTime<Utc>) -> bool {
        let Some(window) = self.dedup_window else {
            return false;
        };
        match db::recent_notification_exists(
            self.dispatcher.pool(),
            user_id,
            content.kind,
            content.entity.as_ref(),
            now - window,
        )
        .await
        {
            Ok(exists) => exists,
            Err(err) => {
                warn!(?err, user_id, "dedup lookup failed; creating reminder anyway");
                false
            }
        }
    }
}

/// Start of the next UTC day.
fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now + Duration::days(1))
}

/// Reminders for one user's open tasks, in creation order:
/// one overdue summary, one per task due within `due_soon`, one due-today summary.
pub fn derive_reminders(tasks: &[Task], now: DateTime<Utc>, due_soon: Duration) -> Vec<NotificationContent> {
    let open = || tasks.iter().filter(|t| !t.completed);
    let soon_until = now + due_soon;
    let end_of_day = next_midnight(now);
    let mut out = Vec::new();

    let overdue = open().filter(|t| matches!(t.due_at, Some(d) if d < now)).count();
    if overdue > 0 {
        out.push(
            NotificationContent::new(NotificationKind::TaskOverdue, "Overdue tasks")
                .with_message(format!("You have {} overdue task(s)", overdue)),
        );
    }

    for task in open() {
        let Some(due) = task.due_at else { continue };
        if due >= now && due <= soon_until {
            out.push(
                NotificationContent::new(NotificationKind::TaskReminder, "Task due soon")
                    .with_message(format!(
                        "\"{}\" is due at {} UTC",
                        task.title,
                        due.format("%H:%M")
                    ))
                    .with_entity(EntityRef::task(&task.id)),
            );
        }
    }

    let due_today = open()
        .filter(|t| matches!(t.due_at, Some(d) if d >= now && d < end_of_day))
        .count();
    if due_today > 0 {
        out.push(
            NotificationContent::new(NotificationKind::DailySummary, "Tasks due today")
                .with_message(format!("You have {} task(s) due today", due_today)),
        );
    }

    out
}
