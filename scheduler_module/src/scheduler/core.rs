use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::events::{EventDispatcher, SchedulerEvent};
use crate::manager::SmsServiceManager;

use super::recurrence::next_occurrence;
use super::store::SqliteMessageStore;
use super::types::{
    HistoryEntry, HistoryRecord, HistoryStatus, MessageStatus, RecurrenceRule, ScheduledMessage,
    SchedulerError,
};

/// Service name recorded in history when no backend was resolvable.
const UNRESOLVED_SERVICE: &str = "none";

/// Schedules outbound messages and dispatches the due ones.
///
/// Dispatch is claim-based: a due message is flipped to processing
/// before any send, so overlapping poll cycles or a second engine on
/// the same database deliver each occurrence at most once.
pub struct MessageScheduler {
    store: Arc<SqliteMessageStore>,
    manager: Arc<SmsServiceManager>,
    events: EventDispatcher,
}

impl MessageScheduler {
    pub fn new(store: Arc<SqliteMessageStore>, manager: Arc<SmsServiceManager>) -> Self {
        Self {
            store,
            manager,
            events: EventDispatcher::new(),
        }
    }

    /// Assembles the full engine from configuration: store at the
    /// configured path, stock providers, and any still-unconfigured
    /// backend seeded from environment credentials.
    pub fn from_config(config: &EngineConfig) -> Result<Arc<Self>, SchedulerError> {
        let store = Arc::new(SqliteMessageStore::new(config.database_path.clone())?);
        let manager = Arc::new(SmsServiceManager::new(Arc::clone(&store)));
        manager.configure_from_env();
        Ok(Arc::new(Self::new(store, manager)))
    }

    pub fn subscribe(&self) -> Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Queues a message for delivery at `scheduled_at` and returns its
    /// id. Validation failures are reported before anything is stored.
    pub fn schedule(
        &self,
        recipient: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: RecurrenceRule,
        service_hint: Option<&str>,
    ) -> Result<i64, SchedulerError> {
        validate(recipient, body, scheduled_at, &recurrence)?;
        match self
            .store
            .save_message(recipient, body, scheduled_at, &recurrence, service_hint)
        {
            Some(id) => {
                info!("scheduled message {} for {}", id, scheduled_at);
                Ok(id)
            }
            None => Err(SchedulerError::Storage(
                "failed to persist scheduled message".to_string(),
            )),
        }
    }

    /// Rewrites a pending message. Returns `false` when the fields are
    /// invalid or the message has already been claimed, finished or
    /// cancelled.
    pub fn update(
        &self,
        id: i64,
        recipient: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: RecurrenceRule,
        service_hint: Option<&str>,
    ) -> bool {
        if let Err(err) = validate(recipient, body, scheduled_at, &recurrence) {
            warn!("rejecting update for message {}: {}", id, err);
            return false;
        }
        self.store
            .update_message(id, recipient, body, scheduled_at, &recurrence, service_hint)
    }

    /// Cancels a pending message. Cancelling a message that is unknown
    /// or no longer pending returns `false` and changes nothing.
    pub fn cancel(&self, id: i64) -> bool {
        self.store.cancel_message(id)
    }

    pub fn message(&self, id: i64) -> Option<ScheduledMessage> {
        self.store.message(id)
    }

    pub fn list_scheduled(&self, status: Option<MessageStatus>) -> Vec<ScheduledMessage> {
        self.store.list_messages(status)
    }

    pub fn history(&self, limit: usize) -> Vec<HistoryRecord> {
        self.store.history(limit)
    }

    /// One poll cycle at the wall clock.
    pub fn poll_once(&self) {
        self.poll_at(Utc::now());
    }

    /// One poll cycle at an explicit instant: claim every due message
    /// and dispatch the ones this cycle won. A failure on one message
    /// never stops the rest of the batch.
    pub fn poll_at(&self, now: DateTime<Utc>) {
        for message in self.store.due_messages(now) {
            if !self.store.claim(message.id, message.scheduled_at) {
                // Lost the race to a concurrent cycle, or the message
                // was cancelled or rescheduled after the due query.
                continue;
            }
            // Dispatch from the post-claim row: an edit that kept the
            // message due may have rewritten recipient or body.
            let Some(current) = self.store.message(message.id) else {
                continue;
            };
            self.dispatch(&current, now);
        }
    }

    fn dispatch(&self, message: &ScheduledMessage, now: DateTime<Utc>) {
        let (service, result) = self.manager.send_routed(
            &message.recipient,
            &message.body,
            message.service_hint.as_deref(),
        );

        if result.success {
            self.store.append_history(&HistoryEntry {
                recipient: message.recipient.clone(),
                body: message.body.clone(),
                service: service.unwrap_or_else(|| UNRESOLVED_SERVICE.to_string()),
                status: HistoryStatus::Sent,
                provider_message_id: result.message_id.clone(),
                sent_at: now,
                error_detail: None,
            });

            match next_occurrence(message.scheduled_at, &message.recurrence) {
                Some(next) => {
                    self.store.rearm(message.id, next);
                    info!("message {} sent, next occurrence at {}", message.id, next);
                }
                None => {
                    self.store.finish(message.id, MessageStatus::Sent);
                    info!("message {} sent", message.id);
                }
            }

            self.events.emit(SchedulerEvent::MessageSent {
                message_id: message.id,
                recipient: message.recipient.clone(),
                provider_message_id: result.message_id,
            });
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown send failure".to_string());

            // `failed`: a provider rejected the send. `error`: the
            // attempt never reached a provider.
            let status = if service.is_some() {
                HistoryStatus::Failed
            } else {
                HistoryStatus::Error
            };

            let mut detail = result.details;
            detail.insert("error".to_string(), Value::String(error.clone()));
            self.store.append_history(&HistoryEntry {
                recipient: message.recipient.clone(),
                body: message.body.clone(),
                service: service.unwrap_or_else(|| UNRESOLVED_SERVICE.to_string()),
                status,
                provider_message_id: None,
                sent_at: now,
                error_detail: Some(Value::Object(detail)),
            });

            self.store.finish(message.id, MessageStatus::Failed);
            error!("message {} failed: {}", message.id, error);

            self.events.emit(SchedulerEvent::MessageFailed {
                message_id: message.id,
                recipient: message.recipient.clone(),
                error,
            });
        }
    }

    /// Spawns the background poll worker.
    pub fn start(self: &Arc<Self>, poll_interval: Duration) -> SchedulerControl {
        let scheduler = Arc::clone(self);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            info!("message scheduler started");
            scheduler.poll_once();
            loop {
                match stop_rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => scheduler.poll_once(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("message scheduler stopped");
        });
        SchedulerControl {
            stop_tx,
            handle: Some(handle),
        }
    }
}

/// Handle to a running poll worker.
pub struct SchedulerControl {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerControl {
    /// Signals the worker to stop and waits for the in-flight poll
    /// cycle to finish.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn validate(
    recipient: &str,
    body: &str,
    scheduled_at: DateTime<Utc>,
    recurrence: &RecurrenceRule,
) -> Result<(), SchedulerError> {
    if recipient.trim().is_empty() {
        return Err(SchedulerError::InvalidSchedule(
            "recipient must not be empty".to_string(),
        ));
    }
    if body.is_empty() {
        return Err(SchedulerError::InvalidSchedule(
            "body must not be empty".to_string(),
        ));
    }
    if scheduled_at < Utc::now() {
        return Err(SchedulerError::InvalidSchedule(
            "scheduled time is in the past".to_string(),
        ));
    }
    if let RecurrenceRule::Custom(interval) = recurrence {
        if interval.interval_days < 1 {
            return Err(SchedulerError::InvalidSchedule(
                "custom interval must be at least one day".to_string(),
            ));
        }
    }
    Ok(())
}
