//! Typed dispatch notifications.
//!
//! Subscribers hold the receiving end of an unbounded channel, so a
//! slow consumer never blocks the poll worker. Dropped receivers are
//! pruned on the next emit.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    MessageSent {
        message_id: i64,
        recipient: String,
        provider_message_id: Option<String>,
    },
    MessageFailed {
        message_id: i64,
        recipient: String,
        error: String,
    },
}

#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Sender<SchedulerEvent>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SchedulerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: SchedulerEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
