use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Delivery status of a notification record.
///
/// `pending -> {sent, failed, scheduled}`, `scheduled -> {sent, failed, canceled}`.
/// `sent`, `failed` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Scheduled,
    Canceled,
}

impl NotificationStatus {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            "scheduled" => Some(NotificationStatus::Scheduled),
            "canceled" => Some(NotificationStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Canceled
        )
    }
}

impl TryFrom<&str> for NotificationStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value).ok_or_else(|| format!("Invalid notification status: {}", value))
    }
}

/// Scheduler-side lifecycle of a record, tracked independently of the delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    NotScheduled,
    Queued,
    Canceled,
    Fired,
}

impl ScheduleState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_scheduled" => Some(ScheduleState::NotScheduled),
            "queued" => Some(ScheduleState::Queued),
            "canceled" => Some(ScheduleState::Canceled),
            "fired" => Some(ScheduleState::Fired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleState::NotScheduled => "not_scheduled",
            ScheduleState::Queued => "queued",
            ScheduleState::Canceled => "canceled",
            ScheduleState::Fired => "fired",
        }
    }
}

/// A persisted notification: content, targets, requested actions and lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub subject: String,
    pub body: String,
    /// Ordered, de-duplicated recipient addresses.
    pub recipients: Vec<String>,
    pub push_token: Option<String>,
    pub email_action: bool,
    pub push_action: bool,
    /// Email provider name the record was dispatched with (absent for push-only).
    pub provider: Option<String>,
    pub scheduled: bool,
    pub delivery_time: Option<NaiveDateTime>,
    pub status: NotificationStatus,
    pub schedule_state: ScheduleState,
    /// Outcome of every backend action of the last attempt, or the failure that prevented it.
    pub provider_response: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to create a notification record.
#[derive(Debug, Clone)]
pub struct CreateNotification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub push_token: Option<String>,
    pub email_action: bool,
    pub push_action: bool,
    pub provider: Option<String>,
    pub delivery_time: Option<NaiveDateTime>,
}

impl CreateNotification {
    pub fn is_scheduled(&self) -> bool {
        self.delivery_time.is_some()
    }
}
