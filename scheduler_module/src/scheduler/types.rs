use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Lifecycle state of a scheduled message.
///
/// `Pending` rows are eligible for dispatch. `Processing` is the claim
/// marker that makes dispatch at-most-once across overlapping poll
/// cycles. `Sent`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, SchedulerError> {
        match raw {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            "cancelled" => Ok(MessageStatus::Cancelled),
            other => Err(SchedulerError::Storage(format!(
                "unknown message status '{other}'"
            ))),
        }
    }
}

/// Custom repeat cadence: a day interval with an optional cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CustomInterval {
    pub interval_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

/// How a message repeats after a successful send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecurrenceRule {
    None,
    Daily,
    Weekly,
    Monthly,
    Custom(CustomInterval),
}

impl RecurrenceRule {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrenceRule::None)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            RecurrenceRule::None => "none",
            RecurrenceRule::Daily => "daily",
            RecurrenceRule::Weekly => "weekly",
            RecurrenceRule::Monthly => "monthly",
            RecurrenceRule::Custom(_) => "custom",
        }
    }

    /// Serialized cadence parameters; `Some` exactly for `Custom`.
    pub(crate) fn payload_json(&self) -> Result<Option<String>, SchedulerError> {
        match self {
            RecurrenceRule::Custom(interval) => Ok(Some(serde_json::to_string(interval)?)),
            _ => Ok(None),
        }
    }

    pub(crate) fn from_columns(
        label: &str,
        payload: Option<&str>,
    ) -> Result<Self, SchedulerError> {
        match label {
            "none" => Ok(RecurrenceRule::None),
            "daily" => Ok(RecurrenceRule::Daily),
            "weekly" => Ok(RecurrenceRule::Weekly),
            "monthly" => Ok(RecurrenceRule::Monthly),
            "custom" => {
                let Some(payload) = payload else {
                    return Err(SchedulerError::Storage(
                        "custom recurrence row has no payload".to_string(),
                    ));
                };
                Ok(RecurrenceRule::Custom(serde_json::from_str(payload)?))
            }
            other => Err(SchedulerError::Storage(format!(
                "unknown recurrence '{other}'"
            ))),
        }
    }
}

/// A queued outbound message as persisted in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub id: i64,
    pub recipient: String,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
    pub recurrence: RecurrenceRule,
    /// Provider override for this message; `None` routes to the
    /// manager's active service at dispatch time.
    pub service_hint: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Outcome class of one dispatch attempt.
///
/// `Failed` means a provider was reached and reported failure; `Error`
/// means the attempt died before reaching any provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Sent,
    Failed,
    Error,
}

impl HistoryStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Sent => "sent",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Error => "error",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, SchedulerError> {
        match raw {
            "sent" => Ok(HistoryStatus::Sent),
            "failed" => Ok(HistoryStatus::Failed),
            "error" => Ok(HistoryStatus::Error),
            other => Err(SchedulerError::Storage(format!(
                "unknown history status '{other}'"
            ))),
        }
    }
}

/// One dispatch attempt to append to history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub recipient: String,
    pub body: String,
    pub service: String,
    pub status: HistoryStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub error_detail: Option<Value>,
}

/// A dispatch attempt as read back from history.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub id: i64,
    pub recipient: String,
    pub body: String,
    pub service: String,
    pub status: HistoryStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub error_detail: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurrence_round_trips_through_columns() {
        let custom = RecurrenceRule::Custom(CustomInterval {
            interval_days: 3,
            end_date: None,
        });
        let payload = custom.payload_json().unwrap();
        assert!(payload.is_some());
        let restored =
            RecurrenceRule::from_columns(custom.label(), payload.as_deref()).unwrap();
        assert_eq!(restored, custom);

        assert_eq!(RecurrenceRule::Weekly.payload_json().unwrap(), None);
        assert_eq!(
            RecurrenceRule::from_columns("weekly", None).unwrap(),
            RecurrenceRule::Weekly
        );
    }

    #[test]
    fn custom_recurrence_without_payload_is_rejected() {
        assert!(RecurrenceRule::from_columns("custom", None).is_err());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(MessageStatus::parse("done").is_err());
        assert_eq!(
            MessageStatus::parse("processing").unwrap(),
            MessageStatus::Processing
        );
    }
}
