//! Scheduling and dispatch engine for queued outbound text messages.
//!
//! A background worker polls the SQLite store for due messages, claims
//! each one, routes the send through the configured provider layer,
//! records the outcome in append-only history, advances recurrence and
//! notifies subscribers through a typed event channel.

pub mod config;
pub mod events;
pub mod manager;

mod scheduler;

pub use scheduler::{
    CustomInterval, HistoryEntry, HistoryRecord, HistoryStatus, MessageScheduler, MessageStatus,
    RecurrenceRule, ScheduledMessage, SchedulerControl, SchedulerError, SqliteMessageStore,
};
