//! Message scheduling: state machine types, recurrence arithmetic,
//! SQLite persistence and the polling dispatch loop.

mod core;
mod recurrence;
mod store;
mod types;

pub use self::core::{MessageScheduler, SchedulerControl};
pub use self::store::SqliteMessageStore;
pub use self::types::{
    CustomInterval, HistoryEntry, HistoryRecord, HistoryStatus, MessageStatus, RecurrenceRule,
    ScheduledMessage, SchedulerError,
};
