use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use sms_services_module::Credentials;

use super::types::{
    HistoryEntry, HistoryRecord, HistoryStatus, MessageStatus, RecurrenceRule, ScheduledMessage,
    SchedulerError,
};

const MESSAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient TEXT NOT NULL,
    body TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    recurrence TEXT NOT NULL DEFAULT 'none',
    recurrence_payload TEXT,
    service_hint TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient TEXT NOT NULL,
    body TEXT NOT NULL,
    service TEXT NOT NULL,
    status TEXT NOT NULL,
    provider_message_id TEXT,
    sent_at TEXT NOT NULL,
    error_detail TEXT
);

CREATE TABLE IF NOT EXISTS api_credentials (
    service TEXT PRIMARY KEY,
    credentials TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

fn ensure_scheduled_message_columns(conn: &Connection) -> Result<(), SchedulerError> {
    let mut stmt = conn.prepare("PRAGMA table_info(scheduled_messages)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }

    if !columns.contains("service_hint") {
        conn.execute(
            "ALTER TABLE scheduled_messages ADD COLUMN service_hint TEXT",
            [],
        )?;
    }
    if !columns.contains("recurrence_payload") {
        conn.execute(
            "ALTER TABLE scheduled_messages ADD COLUMN recurrence_payload TEXT",
            [],
        )?;
    }
    Ok(())
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, SchedulerError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Message, history and credential persistence backed by a single
/// SQLite file. A fresh connection is opened per call; the busy
/// timeout covers contention between the poll worker and callers.
///
/// Query methods return neutral sentinels (`false`, `None`, empty
/// collections) on storage failure and log the cause, so one bad row
/// or a locked database never takes down a poll cycle.
#[derive(Debug)]
pub struct SqliteMessageStore {
    path: PathBuf,
}

impl SqliteMessageStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, SchedulerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(MESSAGE_SCHEMA)?;
        ensure_scheduled_message_columns(&conn)?;
        Ok(conn)
    }

    /// Inserts a pending message and returns its assigned id.
    pub fn save_message(
        &self,
        recipient: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: &RecurrenceRule,
        service_hint: Option<&str>,
    ) -> Option<i64> {
        match self.try_save_message(recipient, body, scheduled_at, recurrence, service_hint) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("failed to save scheduled message: {}", err);
                None
            }
        }
    }

    fn try_save_message(
        &self,
        recipient: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: &RecurrenceRule,
        service_hint: Option<&str>,
    ) -> Result<i64, SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO scheduled_messages
                (recipient, body, scheduled_at, recurrence, recurrence_payload,
                 service_hint, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                recipient,
                body,
                format_datetime(scheduled_at),
                recurrence.label(),
                recurrence.payload_json()?,
                service_hint,
                MessageStatus::Pending.as_str(),
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn message(&self, id: i64) -> Option<ScheduledMessage> {
        match self.try_message(id) {
            Ok(message) => message,
            Err(err) => {
                warn!("failed to load message {}: {}", id, err);
                None
            }
        }
    }

    fn try_message(&self, id: i64) -> Result<Option<ScheduledMessage>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, recipient, body, scheduled_at, recurrence, recurrence_payload,
                        service_hint, status, created_at
                 FROM scheduled_messages WHERE id = ?1",
                params![id],
                message_row,
            )
            .optional()?;
        row.map(build_message).transpose()
    }

    /// Rewrites the editable fields of a pending message. Returns
    /// `false` once the message has been claimed or finished.
    pub fn update_message(
        &self,
        id: i64,
        recipient: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: &RecurrenceRule,
        service_hint: Option<&str>,
    ) -> bool {
        let result = (|| -> Result<bool, SchedulerError> {
            let conn = self.open()?;
            let updated = conn.execute(
                "UPDATE scheduled_messages
                 SET recipient = ?2, body = ?3, scheduled_at = ?4, recurrence = ?5,
                     recurrence_payload = ?6, service_hint = ?7
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id,
                    recipient,
                    body,
                    format_datetime(scheduled_at),
                    recurrence.label(),
                    recurrence.payload_json()?,
                    service_hint,
                ],
            )?;
            Ok(updated == 1)
        })();
        match result {
            Ok(updated) => updated,
            Err(err) => {
                warn!("failed to update message {}: {}", id, err);
                false
            }
        }
    }

    /// Cancels a pending message; already claimed or finished rows are
    /// left untouched and `false` is returned.
    pub fn cancel_message(&self, id: i64) -> bool {
        self.transition(id, "pending", MessageStatus::Cancelled)
    }

    /// Claims a due message for dispatch by flipping it from pending
    /// to processing, but only while the row still carries the
    /// scheduled time the due query saw. Exactly one caller wins; a
    /// concurrent cycle, a cancel, or an edit that moved the message
    /// all make the claim return `false`, and the caller must skip it.
    pub fn claim(&self, id: i64, scheduled_at: DateTime<Utc>) -> bool {
        let result = (|| -> Result<bool, SchedulerError> {
            let conn = self.open()?;
            let updated = conn.execute(
                "UPDATE scheduled_messages SET status = 'processing'
                 WHERE id = ?1 AND status = 'pending' AND scheduled_at = ?2",
                params![id, format_datetime(scheduled_at)],
            )?;
            Ok(updated == 1)
        })();
        match result {
            Ok(updated) => updated,
            Err(err) => {
                warn!("failed to claim message {}: {}", id, err);
                false
            }
        }
    }

    fn transition(&self, id: i64, from: &str, to: MessageStatus) -> bool {
        let result = (|| -> Result<bool, SchedulerError> {
            let conn = self.open()?;
            let updated = conn.execute(
                "UPDATE scheduled_messages SET status = ?3 WHERE id = ?1 AND status = ?2",
                params![id, from, to.as_str()],
            )?;
            Ok(updated == 1)
        })();
        match result {
            Ok(updated) => updated,
            Err(err) => {
                warn!(
                    "failed to move message {} from {} to {}: {}",
                    id,
                    from,
                    to.as_str(),
                    err
                );
                false
            }
        }
    }

    /// Marks a claimed message with its terminal status.
    pub fn finish(&self, id: i64, status: MessageStatus) -> bool {
        self.transition(id, "processing", status)
    }

    /// Returns a claimed recurring message to the pending queue at its
    /// next occurrence.
    pub fn rearm(&self, id: i64, next: DateTime<Utc>) -> bool {
        let result = (|| -> Result<bool, SchedulerError> {
            let conn = self.open()?;
            let updated = conn.execute(
                "UPDATE scheduled_messages
                 SET status = 'pending', scheduled_at = ?2
                 WHERE id = ?1 AND status = 'processing'",
                params![id, format_datetime(next)],
            )?;
            Ok(updated == 1)
        })();
        match result {
            Ok(updated) => updated,
            Err(err) => {
                warn!("failed to rearm message {}: {}", id, err);
                false
            }
        }
    }

    /// Pending messages whose scheduled time is at or before `as_of`,
    /// oldest first with ties broken by insertion order.
    pub fn due_messages(&self, as_of: DateTime<Utc>) -> Vec<ScheduledMessage> {
        match self.try_due_messages(as_of) {
            Ok(messages) => messages,
            Err(err) => {
                warn!("failed to query due messages: {}", err);
                Vec::new()
            }
        }
    }

    fn try_due_messages(
        &self,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, recipient, body, scheduled_at, recurrence, recurrence_payload,
                    service_hint, status, created_at
             FROM scheduled_messages
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at, id",
        )?;
        let rows = stmt.query_map(params![format_datetime(as_of)], message_row)?;
        collect_messages(rows)
    }

    /// All messages, optionally narrowed to one status, newest
    /// schedule first.
    pub fn list_messages(&self, status: Option<MessageStatus>) -> Vec<ScheduledMessage> {
        match self.try_list_messages(status) {
            Ok(messages) => messages,
            Err(err) => {
                warn!("failed to list messages: {}", err);
                Vec::new()
            }
        }
    }

    fn try_list_messages(
        &self,
        status: Option<MessageStatus>,
    ) -> Result<Vec<ScheduledMessage>, SchedulerError> {
        let conn = self.open()?;
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, recipient, body, scheduled_at, recurrence, recurrence_payload,
                            service_hint, status, created_at
                     FROM scheduled_messages
                     WHERE status = ?1
                     ORDER BY scheduled_at DESC, id DESC",
                )?;
                let rows = stmt.query_map(params![status.as_str()], message_row)?;
                collect_messages(rows)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, recipient, body, scheduled_at, recurrence, recurrence_payload,
                            service_hint, status, created_at
                     FROM scheduled_messages
                     ORDER BY scheduled_at DESC, id DESC",
                )?;
                let rows = stmt.query_map([], message_row)?;
                collect_messages(rows)
            }
        }
    }

    /// Appends one dispatch attempt to history. History is
    /// append-only; nothing in the engine updates or deletes rows.
    pub fn append_history(&self, entry: &HistoryEntry) -> Option<i64> {
        match self.try_append_history(entry) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("failed to append message history: {}", err);
                None
            }
        }
    }

    fn try_append_history(&self, entry: &HistoryEntry) -> Result<i64, SchedulerError> {
        let error_detail = entry
            .error_detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO message_history
                (recipient, body, service, status, provider_message_id, sent_at, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.recipient,
                entry.body,
                entry.service,
                entry.status.as_str(),
                entry.provider_message_id,
                format_datetime(entry.sent_at),
                error_detail,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent dispatch attempts, newest first.
    pub fn history(&self, limit: usize) -> Vec<HistoryRecord> {
        match self.try_history(limit) {
            Ok(records) => records,
            Err(err) => {
                warn!("failed to load message history: {}", err);
                Vec::new()
            }
        }
    }

    fn try_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, recipient, body, service, status, provider_message_id, sent_at, error_detail
             FROM message_history
             ORDER BY sent_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, recipient, body, service, status_raw, provider_message_id, sent_at_raw, detail_raw) =
                row?;
            let error_detail = detail_raw
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            records.push(HistoryRecord {
                id,
                recipient,
                body,
                service,
                status: HistoryStatus::parse(&status_raw)?,
                provider_message_id,
                sent_at: parse_datetime(&sent_at_raw)?,
                error_detail,
            });
        }
        Ok(records)
    }

    /// Upserts a service's credentials, preserving its active flag.
    pub fn save_credentials(&self, service: &str, credentials: &Credentials) -> bool {
        let result = (|| -> Result<(), SchedulerError> {
            let payload = serde_json::to_string(credentials)?;
            let conn = self.open()?;
            conn.execute(
                "INSERT INTO api_credentials (service, credentials, is_active, updated_at)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT(service) DO UPDATE SET
                     credentials = excluded.credentials,
                     updated_at = excluded.updated_at",
                params![service, payload, format_datetime(Utc::now())],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to save credentials for {}: {}", service, err);
                false
            }
        }
    }

    pub fn credentials(&self, service: &str) -> Option<Credentials> {
        let result = (|| -> Result<Option<Credentials>, SchedulerError> {
            let conn = self.open()?;
            let payload: Option<String> = conn
                .query_row(
                    "SELECT credentials FROM api_credentials WHERE service = ?1",
                    params![service],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .as_deref()
                .map(|raw| serde_json::from_str(raw).map_err(SchedulerError::from))
                .transpose()
        })();
        match result {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!("failed to load credentials for {}: {}", service, err);
                None
            }
        }
    }

    pub fn active_service(&self) -> Option<String> {
        let result = (|| -> Result<Option<String>, SchedulerError> {
            let conn = self.open()?;
            Ok(conn
                .query_row(
                    "SELECT service FROM api_credentials WHERE is_active = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })();
        match result {
            Ok(service) => service,
            Err(err) => {
                warn!("failed to load active service: {}", err);
                None
            }
        }
    }

    /// Makes `service` the single active row. The clear and set run in
    /// one transaction so a crash can never leave two active services.
    pub fn set_active_service(&self, service: &str) -> bool {
        let result = (|| -> Result<bool, SchedulerError> {
            let mut conn = self.open()?;
            let tx = conn.transaction()?;
            tx.execute("UPDATE api_credentials SET is_active = 0", [])?;
            let updated = tx.execute(
                "UPDATE api_credentials SET is_active = 1, updated_at = ?2 WHERE service = ?1",
                params![service, format_datetime(Utc::now())],
            )?;
            if updated == 1 {
                tx.commit()?;
                Ok(true)
            } else {
                // Unknown service; roll back so the previous active row survives.
                Ok(false)
            }
        })();
        match result {
            Ok(updated) => updated,
            Err(err) => {
                warn!("failed to set active service {}: {}", service, err);
                false
            }
        }
    }
}

type MessageRow = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build_message(raw: MessageRow) -> Result<ScheduledMessage, SchedulerError> {
    let (
        id,
        recipient,
        body,
        scheduled_at_raw,
        recurrence_raw,
        recurrence_payload,
        service_hint,
        status_raw,
        created_at_raw,
    ) = raw;
    Ok(ScheduledMessage {
        id,
        recipient,
        body,
        scheduled_at: parse_datetime(&scheduled_at_raw)?,
        recurrence: RecurrenceRule::from_columns(&recurrence_raw, recurrence_payload.as_deref())?,
        service_hint,
        status: MessageStatus::parse(&status_raw)?,
        created_at: parse_datetime(&created_at_raw)?,
    })
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<MessageRow>>,
) -> Result<Vec<ScheduledMessage>, SchedulerError> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(build_message(row?)?);
    }
    Ok(messages)
}
