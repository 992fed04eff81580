use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Read,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Read => "read",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "read" => Some(NotificationStatus::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskReminder,
    TaskOverdue,
    DailySummary,
    HabitReminder,
    Insight,
    #[default]
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TaskReminder => "task_reminder",
            NotificationKind::TaskOverdue => "task_overdue",
            NotificationKind::DailySummary => "daily_summary",
            NotificationKind::HabitReminder => "habit_reminder",
            NotificationKind::Insight => "insight",
            NotificationKind::System => "system",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "task_reminder" => Some(NotificationKind::TaskReminder),
            "task_overdue" => Some(NotificationKind::TaskOverdue),
            "daily_summary" => Some(NotificationKind::DailySummary),
            "habit_reminder" => Some(NotificationKind::HabitReminder),
            "insight" => Some(NotificationKind::Insight),
            "system" => Some(NotificationKind::System),
            _ => None,
        }
    }
}

/// Reference to the entity a notification is about (e.g. a task).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn task(task_id: &str) -> Self {
        Self {
            entity_type: "task".into(),
            entity_id: task_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status: NotificationStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn entity(&self) -> Option<EntityRef> {
        match (&self.entity_type, &self.entity_id) {
            (Some(t), Some(id)) => Some(EntityRef {
                entity_type: t.clone(),
                entity_id: id.clone(),
            }),
            _ => None,
        }
    }
}

/// Logical content of a notification before it is persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationContent {
    pub kind: NotificationKind,
    pub title: String,
    pub message: Option<String>,
    pub entity: Option<EntityRef>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NotificationContent {
    pub fn new(kind: NotificationKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.title.trim().is_empty() {
            return Err("title is required");
        }
        Ok(())
    }

    /// Initial status for a freshly dispatched notification.
    pub fn initial_status(&self, now: DateTime<Utc>) -> NotificationStatus {
        match self.scheduled_for {
            Some(at) if at > now => NotificationStatus::Pending,
            _ => NotificationStatus::Sent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    pub user_id: String,
    pub endpoint: String,
    pub expiration_time: Option<DateTime<Utc>>,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub completed: bool,
}
