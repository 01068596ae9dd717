//! Resilient relay from the backend event stream to the presentation layer.
//!
//! The relay keeps one streaming request open against the backend's event
//! endpoint, decodes framed events, advances a resumption cursor and forwards
//! payloads as fact-check alerts unless suppressed. Any end of stream or
//! transport failure schedules a reconnect with exponential backoff; the
//! cursor is sent back on every reconnect so nothing is replayed or lost.
//!
//! Each connect bumps an epoch. Tasks belonging to an older epoch notice the
//! mismatch and do nothing, which makes `disconnect` final even for a request
//! that is still in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::backoff::{BackoffPolicy, BackoffState};
use crate::session::notify::EventSink;
use crate::session::protocol::UiEvent;
use crate::session::sse::{SseDecoder, SseFrame};

/// Upper bound on waiting for the stream's response headers
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("event stream request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("event stream returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("event stream read failed: {0}")]
    Body(#[source] reqwest::Error),
    #[error("event stream did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
}

struct RelayState {
    backoff: BackoffState,
    epoch: u64,
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct RelayInner {
    http: reqwest::Client,
    events_url: String,
    sink: Arc<dyn EventSink>,
    state: StdMutex<RelayState>,
    /// Last event id whose payload was processed
    cursor: AtomicU64,
    suppressed: AtomicBool,
    /// Response headers received and body streaming
    connected: AtomicBool,
}

/// Cheap to clone; all clones drive the same connection
#[derive(Clone)]
pub struct EventStreamRelay {
    inner: Arc<RelayInner>,
}

impl EventStreamRelay {
    pub fn new(
        events_url: impl Into<String>,
        policy: BackoffPolicy,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                http: reqwest::Client::new(),
                events_url: events_url.into(),
                sink,
                state: StdMutex::new(RelayState {
                    backoff: BackoffState::new(policy),
                    epoch: 0,
                    connection: None,
                    reconnect: None,
                }),
                cursor: AtomicU64::new(0),
                suppressed: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the stream from the current cursor.
    ///
    /// Resolves once the first attempt has either connected or scheduled a
    /// reconnect. Replaces any connection or pending reconnect.
    pub async fn connect(&self) {
        let epoch = {
            let mut state = self.lock_state();
            state.cancel_tasks();
            state.epoch += 1;
            state.epoch
        };
        self.open(epoch).await;
    }

    async fn open(&self, epoch: u64) {
        let cursor = self.cursor();
        debug!(cursor, epoch, url = %self.inner.events_url, "Opening event stream");

        match self.request(cursor).await {
            Ok(response) => {
                let mut state = self.lock_state();
                if state.epoch != epoch {
                    debug!(epoch, "Discarding connection from a cancelled attempt");
                    return;
                }
                state.backoff.reset();
                self.inner.connected.store(true, Ordering::SeqCst);
                info!(cursor, "Event stream connected");

                let relay = self.clone();
                state.connection = Some(tokio::spawn(async move {
                    relay.consume(response, epoch).await;
                }));
            }
            Err(e) => {
                warn!(error = %e, cursor, "Event stream connection failed");
                self.schedule_reconnect(epoch);
            }
        }
    }

    async fn request(&self, cursor: u64) -> Result<reqwest::Response, RelayError> {
        let send = self
            .inner
            .http
            .get(&self.inner.events_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("Last-Event-ID", cursor.to_string())
            .send();

        let response = tokio::time::timeout(CONNECT_TIMEOUT, send)
            .await
            .map_err(|_| RelayError::Timeout(CONNECT_TIMEOUT))?
            .map_err(RelayError::Request)?;

        if !response.status().is_success() {
            return Err(RelayError::Status(response.status()));
        }
        Ok(response)
    }

    async fn consume(self, response: reqwest::Response, epoch: u64) {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        let result = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    for frame in decoder.push(&chunk) {
                        self.dispatch(frame);
                    }
                }
                Some(Err(e)) => break Err(RelayError::Body(e)),
                None => break Ok(()),
            }
        };

        match result {
            Ok(()) => info!(cursor = self.cursor(), "Event stream ended"),
            Err(e) => warn!(error = %e, cursor = self.cursor(), "Event stream interrupted"),
        }
        self.schedule_reconnect(epoch);
    }

    /// Handle one decoded block
    fn dispatch(&self, frame: SseFrame) {
        if frame.is_heartbeat() {
            return;
        }
        let Some(data) = frame.data else {
            debug!(id = ?frame.id, "Event without data");
            return;
        };

        let payload = match serde_json::from_str::<Value>(&data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, id = ?frame.id, "Dropping malformed event payload");
                return;
            }
        };

        if let Some(id) = frame.id {
            let previous = self.inner.cursor.fetch_max(id, Ordering::SeqCst);
            if id < previous {
                debug!(id, cursor = previous, "Event id behind cursor");
            }
        }

        if self.is_suppressed() {
            debug!(id = ?frame.id, "Event suppressed while paused");
            return;
        }
        self.inner.sink.emit(UiEvent::FactCheckAlert { payload });
    }

    /// Arm a reconnect timer unless one is pending or `epoch` was cancelled
    fn schedule_reconnect(&self, epoch: u64) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            debug!(epoch, "Not reconnecting a cancelled stream");
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        if state.reconnect.is_some() {
            debug!("Reconnect already pending");
            return;
        }

        let delay = state.backoff.next_delay();
        warn!(
            delay_ms = delay.as_millis() as u64,
            cursor = self.cursor(),
            "Scheduling event stream reconnect"
        );

        let relay = self.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = relay.lock_state();
                if state.epoch != epoch {
                    return;
                }
                state.reconnect = None;
            }
            relay.open(epoch).await;
        }));
    }

    /// Cancel any pending reconnect, abort the live request and reset backoff
    pub fn disconnect(&self) {
        let mut state = self.lock_state();
        state.epoch += 1;
        state.cancel_tasks();
        state.backoff.reset();
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!(cursor = self.cursor(), "Event stream disconnected");
    }

    /// Streaming right now
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connected, or waiting to reconnect
    pub fn is_open(&self) -> bool {
        let state = self.lock_state();
        state.reconnect.is_some()
            || state
                .connection
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.inner.suppressed.store(suppressed, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.suppressed.load(Ordering::SeqCst)
    }

    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    /// Start the next session from the beginning of the backend's numbering
    pub fn reset_cursor(&self) {
        self.inner.cursor.store(0, Ordering::SeqCst);
    }

    pub fn current_backoff(&self) -> Duration {
        self.lock_state().backoff.current()
    }
}

impl RelayState {
    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}
