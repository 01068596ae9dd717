//! Lifecycle of the short-lived capture client.
//!
//! The client normally prompts for a source menu choice and a target. Both
//! answers are scripted on stdin, after which stdin is closed. Readiness and
//! failures are read back from its output.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::session::config::{ProcessCommand, Timings};
use crate::session::error::SessionError;
use crate::session::notify::EventSink;
use crate::session::protocol::{ProcessRole, SourceType, UiEvent, UserMessage};
use crate::session::runtime::{
    watch_output, ExitState, LineWait, OutputLine, OutputStream, ProcessRuntime, StopSignal,
};
use crate::session::supervisor::{ProcessExit, ProcessSlot};

/// Printed on stdout once audio is being recorded
pub const RECORDING_MARKER: &str = "[CAPTURE] Recording";

static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[ERROR\]\s*(.*)$").expect("valid error tag pattern"));
static PERMISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission").expect("valid permission pattern"));

const ROLE: ProcessRole = ProcessRole::Capture;

/// How a successful `start` was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStart {
    /// Recording marker seen
    Recording,
    /// Client exited before recording; start still resolves
    ExitedEarly { code: Option<i32> },
    /// No terminal event within the startup window; presumed still negotiating
    Unconfirmed,
}

pub struct CaptureProcessManager {
    command: ProcessCommand,
    slot: ProcessSlot,
    startup_timeout: Duration,
    grace: Duration,
    sink: Arc<dyn EventSink>,
}

impl CaptureProcessManager {
    pub fn new(
        command: ProcessCommand,
        timings: &Timings,
        exit_tx: mpsc::UnboundedSender<ProcessExit>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            command,
            slot: ProcessSlot::new(ROLE, exit_tx),
            startup_timeout: timings.capture_startup,
            grace: timings.capture_grace,
            sink,
        }
    }

    /// Spawn the client for `source` and wait until it records, exits or times out.
    ///
    /// Only setup failures (missing runtime, spawn error) are errors; every
    /// other outcome resolves with a [`CaptureStart`].
    pub async fn start(
        &self,
        source: SourceType,
        target: &str,
    ) -> Result<CaptureStart, SessionError> {
        // One client at a time
        self.stop().await;

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

        let (mut runtime, output) = ProcessRuntime::spawn(ROLE, &command)
            .map_err(|source| SessionError::Spawn { role: ROLE, source })?;

        let script = vec![
            source.selection_code().to_string(),
            sanitize_target(target),
        ];
        if let Err(e) = runtime.write_script(&script).await {
            // The client may already be gone; its exit is reported below
            warn!(error = %e, "Failed to script capture input");
        }

        let exit = runtime.exit_watcher();
        let pid = runtime.pid();
        self.slot.install(runtime);
        info!(pid = ?pid, source = %source, "Capture client spawned");

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(monitor_output(output, exit, Arc::clone(&self.sink), ready_tx));

        let outcome = match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(LineWait::Matched(()))) => CaptureStart::Recording,
            Ok(Ok(LineWait::Exited(code))) => CaptureStart::ExitedEarly { code },
            Ok(Err(_)) => CaptureStart::Unconfirmed,
            Err(_) => CaptureStart::Unconfirmed,
        };

        match outcome {
            CaptureStart::Recording => info!(pid = ?pid, "Capture recording"),
            CaptureStart::ExitedEarly { code } => {
                warn!(?code, "Capture client exited before recording")
            }
            CaptureStart::Unconfirmed => warn!(
                timeout_secs = self.startup_timeout.as_secs(),
                "Capture start unconfirmed, assuming it is still negotiating"
            ),
        }
        Ok(outcome)
    }

    /// SIGINT, SIGTERM after the grace window, then kill. Never fails.
    pub async fn stop(&self) {
        if let Some(code) = self.slot.stop(StopSignal::Interrupt, self.grace).await {
            info!(?code, "Capture client stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }
}

/// Forward tagged error lines for the lifetime of the client and report the
/// first terminal event (recording or exit) through `ready_tx`
async fn monitor_output(
    mut output: broadcast::Receiver<OutputLine>,
    mut exit: watch::Receiver<ExitState>,
    sink: Arc<dyn EventSink>,
    ready_tx: oneshot::Sender<LineWait<()>>,
) {
    let mut ready_tx = Some(ready_tx);

    let finished: LineWait<()> = watch_output(&mut output, &mut exit, |line| {
        if let Some(message) = error_message(&line.text) {
            sink.emit(UiEvent::error(message));
        }
        if line.stream == OutputStream::Stdout && line.text.contains(RECORDING_MARKER) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(LineWait::Matched(()));
            }
        }
        None
    })
    .await;

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(finished);
    }
    debug!("Capture output monitor finished");
}

/// Strip line terminators so the target cannot inject extra stdin answers
pub fn sanitize_target(target: &str) -> String {
    target
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Turn an `[ERROR]`-tagged output line into a user-facing message
pub fn error_message(line: &str) -> Option<UserMessage> {
    let captures = ERROR_LINE_RE.captures(line)?;
    let text = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    let text = if text.is_empty() {
        "The capture client reported an error."
    } else {
        text
    };

    if PERMISSION_RE.is_match(text) {
        Some(UserMessage::new(
            "Capture Error",
            format!(
                "{} Grant Screen Recording and Microphone access in System Settings > Privacy & Security, then restart the session.",
                text
            ),
        ))
    } else {
        Some(UserMessage::new("Capture Error", text))
    }
}
