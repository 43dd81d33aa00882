//! Change notification fan-out.
//!
//! Every open SSE connection gets a depth-1 channel. `notify` does a
//! non-blocking send to each; a subscriber that has not drained its
//! previous signal simply keeps that one pending signal. Subscribers
//! never need more than "refresh now", so a full buffer is not a loss.
//!
//! The terminal UI is not an HTTP client, so the same fact is also pushed
//! into its message queue as [`AppMessage::StateChanged`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::ui::{AppMessage, UiSender};

/// One registered listener.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<()>,
}

pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_id: AtomicU64,
    notifications: AtomicU64,
    ui_sink: Option<UiSender>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EventBroadcaster {
    pub fn new(ui_sink: Option<UiSender>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notifications: AtomicU64::new(0),
            ui_sink,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(1);
        self.lock().insert(id, tx);
        debug!(subscriber = id, "event subscriber added");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(subscriber = id, "event subscriber removed");
        }
    }

    /// Signal every subscriber and the UI queue. Never blocks.
    pub fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.lock();
            subs.retain(|id, tx| match tx.try_send(()) {
                Ok(()) => true,
                // already has a pending refresh
                Err(TrySendError::Full(())) => {
                    trace!(subscriber = id, "refresh coalesced");
                    true
                }
                Err(TrySendError::Closed(())) => false,
            });
        }
        if let Some(ui) = &self.ui_sink {
            let _ = ui.send(AppMessage::StateChanged);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Total `notify` calls since construction.
    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<()>>> {
        // a panic while holding this lock cannot leave the map inconsistent
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
