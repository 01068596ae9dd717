//! Session orchestration.
//!
//! [`SessionController`] sequences permissions, backend startup, health
//! checks, the event relay and the capture client into one logical session,
//! and owns the process-wide [`SessionState`]. At most one start or stop runs
//! at a time; a second one is rejected immediately rather than queued.
//!
//! Unrequested child exits arrive as [`ProcessExit`] notices on a channel fed
//! by both managers. A single supervisor task consumes them and performs the
//! cascade, so the managers never reach into each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::backend_client::BackendClient;
use crate::session::capture::{CaptureProcessManager, CaptureStart};
use crate::session::config::Config;
use crate::session::error::SessionError;
use crate::session::notify::EventSink;
use crate::session::permissions::{self, PermissionProbe};
use crate::session::protocol::{
    BackendStatus, ProcessRole, SessionSnapshot, SessionState, SessionStatus, SourceType, UiEvent,
};
use crate::session::relay::EventStreamRelay;
use crate::session::service::ServiceProcessManager;
use crate::session::supervisor::ProcessExit;

/// Held for the duration of a start or stop
struct OperationGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> OperationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SessionError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::OperationInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SessionController {
    service: ServiceProcessManager,
    capture: CaptureProcessManager,
    relay: EventStreamRelay,
    backend: BackendClient,
    permissions: Arc<dyn PermissionProbe>,
    sink: Arc<dyn EventSink>,
    state: StdMutex<SessionState>,
    in_flight: AtomicBool,
    /// Set by shutdown; no child is spawned for a session after this
    closing: AtomicBool,
    health_attempts: u32,
    health_interval: Duration,
}

impl SessionController {
    /// Build the controller and its components.
    ///
    /// The returned receiver carries unrequested child exits; hand it to
    /// [`SessionController::spawn_supervisor`].
    pub fn new(
        config: &Config,
        sink: Arc<dyn EventSink>,
        permissions: Arc<dyn PermissionProbe>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let timings = &config.timings;

        let controller = Arc::new(Self {
            service: ServiceProcessManager::new(
                config.service.clone(),
                timings,
                exit_tx.clone(),
                Arc::clone(&sink),
            ),
            capture: CaptureProcessManager::new(
                config.capture.clone(),
                timings,
                exit_tx,
                Arc::clone(&sink),
            ),
            relay: EventStreamRelay::new(config.events_url(), timings.reconnect, Arc::clone(&sink)),
            backend: BackendClient::new(config.base_url(), timings.http_timeout),
            permissions,
            sink,
            state: StdMutex::new(SessionState::Idle),
            in_flight: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            health_attempts: timings.health_attempts,
            health_interval: timings.health_interval,
        });

        (controller, exit_rx)
    }

    /// Build the controller and start its crash supervisor
    pub fn launch(
        config: &Config,
        sink: Arc<dyn EventSink>,
        permissions: Arc<dyn PermissionProbe>,
    ) -> Arc<Self> {
        let (controller, exits) = Self::new(config, sink, permissions);
        controller.spawn_supervisor(exits);
        controller
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.lock_state();
        debug!(from = %*state, to = %next, "Session state");
        *state = next;
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    fn emit_status(&self, status: SessionStatus) {
        self.sink.emit(UiEvent::SessionStatus { status });
    }

    /// Start a session for `source_type` / `target`.
    ///
    /// An unrecognized source type is rejected before anything changes. Any
    /// failure after that rolls back the relay and capture client; the
    /// backend is left running for the next attempt.
    pub async fn start(&self, source_type: &str, target: &str) -> Result<(), SessionError> {
        let _guard = OperationGuard::acquire(&self.in_flight)?;
        self.ensure_open()?;
        let source: SourceType = source_type.parse()?;

        info!(source = %source, "Starting session");
        // Cleared once here so a pause issued while starting sticks
        self.relay.set_suppressed(false);
        self.set_state(SessionState::Starting);
        self.emit_status(SessionStatus::Starting);

        let outcome = match self.run_start(source, target).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "Session start failed, rolling back");
                self.rollback_start().await;
                self.sink.emit(UiEvent::error(err.user_message()));
                return Err(err);
            }
        };

        self.finish_start(outcome).await
    }

    async fn run_start(&self, source: SourceType, target: &str) -> Result<CaptureStart, SessionError> {
        permissions::verify(self.permissions.as_ref(), source)?;

        self.ensure_open()?;
        self.service.start().await?;

        // Best-effort: an unhealthy backend may still come up while capture negotiates
        self.backend
            .wait_until_healthy(self.health_attempts, self.health_interval)
            .await;

        if !self.relay.is_suppressed() && !self.relay.is_open() {
            self.relay.connect().await;
        }

        self.ensure_open()?;
        self.capture.start(source, target).await
    }

    async fn rollback_start(&self) {
        self.relay.disconnect();
        self.capture.stop().await;
        self.set_state(SessionState::Idle);
        self.emit_status(SessionStatus::Stopped);
    }

    /// Settle the state once every step has returned
    async fn finish_start(&self, outcome: CaptureStart) -> Result<(), SessionError> {
        if self.is_closing() {
            info!("Shutdown began while the session was starting");
            self.rollback_start().await;
            return Err(SessionError::ShuttingDown);
        }

        if !self.service.is_running() {
            warn!("Backend died while the session was starting");
            self.rollback_start().await;
            let err = SessionError::ProcessCrash {
                role: ProcessRole::Service,
                code: None,
            };
            self.sink.emit(UiEvent::error(err.user_message()));
            return Err(err);
        }

        let settled = {
            let mut state = self.lock_state();
            if self.capture.is_running() {
                // A pause issued mid-start is honoured
                *state = if self.relay.is_suppressed() {
                    SessionState::Paused
                } else {
                    SessionState::Active
                };
                Some(*state)
            } else {
                *state = SessionState::Idle;
                None
            }
        };

        match settled {
            Some(SessionState::Paused) => {
                info!("Session started paused");
                self.emit_status(SessionStatus::Paused);
            }
            Some(_) => {
                // A resume issued mid-start lands after the connect step was skipped
                if !self.relay.is_open() {
                    self.relay.connect().await;
                }
                info!(cursor = self.relay.cursor(), "Session active");
                self.emit_status(SessionStatus::Active);
            }
            None => {
                // Capture resolved without staying alive; the start still succeeds
                info!(?outcome, "Capture client is not running, session ended");
                self.relay.disconnect();
                self.relay.reset_cursor();
                self.emit_status(SessionStatus::Stopped);
                if let CaptureStart::ExitedEarly { code } = outcome {
                    if code != Some(0) {
                        let crash = SessionError::ProcessCrash {
                            role: ProcessRole::Capture,
                            code,
                        };
                        self.sink.emit(UiEvent::error(crash.user_message()));
                    }
                }
            }
        }
        Ok(())
    }

    /// End the session: relay first, then the capture client.
    ///
    /// The backend keeps running so the next start skips its cold start.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let _guard = OperationGuard::acquire(&self.in_flight)?;

        info!("Stopping session");
        self.relay.set_suppressed(false);
        self.set_state(SessionState::Stopping);
        self.relay.disconnect();
        // The backend numbers events from 1 again for the next capture session
        self.relay.reset_cursor();
        self.capture.stop().await;
        self.set_state(SessionState::Idle);
        self.emit_status(SessionStatus::Stopped);
        Ok(())
    }

    /// Stop forwarding alerts and drop the stream; processes keep running
    pub fn pause(&self) {
        self.relay.set_suppressed(true);
        self.relay.disconnect();

        let paused = {
            let mut state = self.lock_state();
            if *state == SessionState::Active {
                *state = SessionState::Paused;
                true
            } else {
                false
            }
        };
        if paused {
            info!(cursor = self.relay.cursor(), "Session paused");
            self.emit_status(SessionStatus::Paused);
        }
    }

    /// Resume forwarding and reconnect from the last delivered event
    pub async fn resume(&self) {
        self.relay.set_suppressed(false);

        let (live, was_paused) = {
            let mut state = self.lock_state();
            match *state {
                SessionState::Paused => {
                    *state = SessionState::Active;
                    (true, true)
                }
                SessionState::Active => (true, false),
                _ => (false, false),
            }
        };

        if live && !self.relay.is_open() {
            info!(cursor = self.relay.cursor(), "Resuming event stream");
            self.relay.connect().await;
        }
        if was_paused {
            self.emit_status(SessionStatus::Active);
        }
    }

    /// Refuse new sessions; a start in progress stops before its next spawn
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closing() {
            Err(SessionError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Snapshot for `getSessionState`; never mutates
    pub fn query_state(&self) -> SessionSnapshot {
        SessionSnapshot {
            backend_running: self.service.is_running(),
            client_running: self.capture.is_running(),
            sse_connected: self.relay.is_connected(),
            is_paused: self.relay.is_suppressed(),
        }
    }

    pub fn service(&self) -> &ServiceProcessManager {
        &self.service
    }

    pub fn capture(&self) -> &CaptureProcessManager {
        &self.capture
    }

    pub fn relay(&self) -> &EventStreamRelay {
        &self.relay
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn permissions(&self) -> &dyn PermissionProbe {
        self.permissions.as_ref()
    }

    /// Consume exit notices until every manager is gone
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        mut exits: mpsc::UnboundedReceiver<ProcessExit>,
    ) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_exit(exit).await;
            }
            debug!("Crash supervisor finished");
        })
    }

    async fn handle_exit(&self, exit: ProcessExit) {
        let crashed = exit.code != Some(0);

        match exit.role {
            ProcessRole::Service => {
                warn!(code = ?exit.code, "Backend exited, tearing down capture and stream");
                self.relay.disconnect();
                self.capture.stop().await;
                self.sink.emit(UiEvent::BackendStatus {
                    status: if crashed {
                        BackendStatus::Crashed
                    } else {
                        BackendStatus::Stopped
                    },
                });
            }
            ProcessRole::Capture => {
                if !matches!(self.state(), SessionState::Active | SessionState::Paused) {
                    debug!(code = ?exit.code, "Capture exit outside a live session");
                    return;
                }
                warn!(code = ?exit.code, "Capture client exited, ending session");
                self.relay.disconnect();
            }
        }

        let ended = {
            let mut state = self.lock_state();
            if matches!(*state, SessionState::Active | SessionState::Paused) {
                *state = SessionState::Idle;
                true
            } else {
                false
            }
        };

        if ended {
            self.relay.set_suppressed(false);
            self.relay.reset_cursor();
            self.emit_status(SessionStatus::Stopped);
            if crashed {
                let crash = SessionError::ProcessCrash {
                    role: exit.role,
                    code: exit.code,
                };
                self.sink.emit(UiEvent::error(crash.user_message()));
            }
        }
    }
}
