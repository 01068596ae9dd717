//! Push-surface delivery to the presentation layer.
//!
//! Pushes are fire-and-forget: emitting never blocks the caller, and events
//! are dropped when no presentation client is listening. Repeated identical
//! error toasts are collapsed so a chatty child process cannot flood the UI.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::debug;

use crate::session::protocol::UiEvent;

/// Minimum time between two identical error messages
const DEBOUNCE_DURATION: Duration = Duration::from_secs(5);

/// Receiver of unsolicited events (alerts, statuses, error toasts)
pub trait EventSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

/// Tracks when each distinct error message was last delivered
#[derive(Default)]
pub struct NotificationDebouncer {
    last_notify: HashMap<(String, String), Instant>,
}

impl NotificationDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this message has not been delivered recently
    pub fn should_notify(&mut self, title: &str, detail: &str) -> bool {
        self.should_notify_at(title, detail, Instant::now())
    }

    fn should_notify_at(&mut self, title: &str, detail: &str, now: Instant) -> bool {
        self.last_notify
            .retain(|_, last| now.duration_since(*last) < DEBOUNCE_DURATION);

        let key = (title.to_string(), detail.to_string());
        if self.last_notify.contains_key(&key) {
            return false;
        }
        self.last_notify.insert(key, now);
        true
    }

    pub fn reset(&mut self) {
        self.last_notify.clear();
    }
}

/// Fans events out to every attached presentation client
pub struct BroadcastSink {
    tx: broadcast::Sender<UiEvent>,
    debouncer: StdMutex<NotificationDebouncer>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            debouncer: StdMutex::new(NotificationDebouncer::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: UiEvent) {
        if let UiEvent::ErrorMessage { title, detail } = &event {
            let fresh = match self.debouncer.lock() {
                Ok(mut debouncer) => debouncer.should_notify(title, detail),
                Err(_) => true,
            };
            if !fresh {
                debug!(title = %title, "Suppressing repeated error message");
                return;
            }
        }

        // Non-blocking send - dropped when no client is subscribed
        let _ = self.tx.send(event);
    }
}
