//! Lifecycle of the long-running verification backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::session::config::{ProcessCommand, Timings};
use crate::session::error::SessionError;
use crate::session::notify::EventSink;
use crate::session::protocol::{BackendStatus, ProcessRole, UiEvent};
use crate::session::runtime::{watch_output, LineWait, OutputStream, ProcessRuntime, StopSignal};
use crate::session::supervisor::{ProcessExit, ProcessSlot};

/// Printed on stdout once the backend serves requests
pub const READY_MARKER: &str = "[READY]";

const ROLE: ProcessRole = ProcessRole::Service;

pub struct ServiceProcessManager {
    command: ProcessCommand,
    slot: ProcessSlot,
    startup_timeout: Duration,
    grace: Duration,
    sink: Arc<dyn EventSink>,
    /// Serializes concurrent starts so the second caller sees the first child
    starting: Mutex<()>,
}

impl ServiceProcessManager {
    pub fn new(
        command: ProcessCommand,
        timings: &Timings,
        exit_tx: mpsc::UnboundedSender<ProcessExit>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            command,
            slot: ProcessSlot::new(ROLE, exit_tx),
            startup_timeout: timings.service_startup,
            grace: timings.service_grace,
            sink,
            starting: Mutex::new(()),
        }
    }

    /// Spawn the backend and wait for its readiness marker.
    ///
    /// A no-op when the backend is already running.
    pub async fn start(&self) -> Result<(), SessionError> {
        let _starting = self.starting.lock().await;

        if self.slot.is_running() {
            debug!("Backend already running");
            return Ok(());
        }

        let program =
            self.command
                .resolve_program()
                .ok_or_else(|| SessionError::ExecutableMissing {
                    role: ROLE,
                    path: self.command.program.clone(),
                })?;
        let command = ProcessCommand {
            program,
            ..self.command.clone()
        };

        let (runtime, mut output) = ProcessRuntime::spawn(ROLE, &command)
            .map_err(|source| SessionError::Spawn { role: ROLE, source })?;
        let mut exit = runtime.exit_watcher();
        let pid = runtime.pid();
        let generation = self.slot.install(runtime);

        info!(pid = ?pid, "Backend spawned, waiting for readiness");
        self.sink.emit(UiEvent::BackendStatus {
            status: BackendStatus::Starting,
        });

        let ready = tokio::time::timeout(
            self.startup_timeout,
            watch_output(&mut output, &mut exit, |line| {
                (line.stream == OutputStream::Stdout && line.text.contains(READY_MARKER))
                    .then_some(())
            }),
        )
        .await;

        match ready {
            Ok(LineWait::Matched(())) => {
                info!(pid = ?pid, "Backend ready");
                self.sink.emit(UiEvent::BackendStatus {
                    status: BackendStatus::Running,
                });
                Ok(())
            }
            Ok(LineWait::Exited(code)) => {
                warn!(?code, "Backend exited before becoming ready");
                Err(SessionError::ProcessCrash { role: ROLE, code })
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.startup_timeout.as_secs(),
                    "Backend readiness timed out"
                );
                // Only tear down the child this call spawned
                if self.slot.generation() == Some(generation) {
                    self.stop().await;
                }
                Err(SessionError::StartupTimeout {
                    role: ROLE,
                    timeout: self.startup_timeout,
                })
            }
        }
    }

    /// SIGTERM, then kill after the grace window. Idempotent.
    pub async fn stop(&self) {
        if let Some(code) = self.slot.stop(StopSignal::Terminate, self.grace).await {
            info!(?code, "Backend stopped");
            self.sink.emit(UiEvent::BackendStatus {
                status: BackendStatus::Stopped,
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }
}
