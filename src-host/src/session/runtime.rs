// Child process runtime for supervised workers
//
// Wraps tokio::process to provide async methods for child lifecycle:
// - Spawning with piped standard I/O
// - Streaming output lines to subscribers
// - Feeding a scripted stdin sequence
// - Signal-based and forced termination
// - Observing exit

use crate::session::config::ProcessCommand;
use crate::session::protocol::ProcessRole;
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

/// Output lines buffered per subscriber before it starts lagging
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long to keep collecting trailing output after the child exits
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Lifecycle of the child as seen by the wait task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// `code` is None when the child was killed by a signal
    Exited { code: Option<i32> },
}

/// Polite termination requests, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

/// Outcome of scanning output for a line of interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineWait<T> {
    Matched(T),
    Exited(Option<i32>),
}

/// Handle for a spawned child process
pub struct ProcessRuntime {
    role: ProcessRole,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output_tx: broadcast::Sender<OutputLine>,
    exit_rx: watch::Receiver<ExitState>,
    /// Dropping or firing this kills the child
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessRuntime {
    /// Spawn the command with piped standard I/O.
    ///
    /// Returns the runtime plus an output subscription created before any
    /// output is read, so no early line can be missed.
    pub fn spawn(
        role: ProcessRole,
        command: &ProcessCommand,
    ) -> std::io::Result<(Self, broadcast::Receiver<OutputLine>)> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            Self::spawn_reader_task(role, stdout, OutputStream::Stdout, output_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_reader_task(role, stderr, OutputStream::Stderr, output_tx.clone());
        }
        let stdin = child.stdin.take();

        Self::spawn_wait_task(role, child, kill_rx, exit_tx);

        debug!(role = %role, pid = ?pid, program = %command.program.display(), "Spawned child");

        Ok((
            Self {
                role,
                pid,
                stdin,
                output_tx,
                exit_rx,
                kill_tx: Some(kill_tx),
            },
            output_rx,
        ))
    }

    /// Spawn a task forwarding each output line to subscribers
    ///
    /// Lines are sent even when nobody listens so the pipe never fills up.
    fn spawn_reader_task<R>(
        role: ProcessRole,
        reader: R,
        stream: OutputStream,
        output_tx: broadcast::Sender<OutputLine>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        debug!(role = %role, ?stream, "{}", text);
                        let _ = output_tx.send(OutputLine { stream, text });
                    }
                    Err(e) => {
                        warn!(role = %role, ?stream, error = %e, "Child output read error");
                        break;
                    }
                }
            }
        });
    }

    /// Spawn the task that owns the child and publishes its exit
    fn spawn_wait_task(
        role: ProcessRole,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<ExitState>,
    ) {
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    // Kill requested or the handle was dropped
                    if let Err(e) = child.start_kill() {
                        debug!(role = %role, error = %e, "Kill after exit");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(role = %role, error = %e, "Error waiting for child");
                    None
                }
            };
            debug!(role = %role, ?code, "Child exited");
            let _ = exit_tx.send(ExitState::Exited { code });
        });
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        matches!(*self.exit_rx.borrow(), ExitState::Running)
    }

    pub fn exit_state(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output_tx.subscribe()
    }

    pub fn exit_watcher(&self) -> watch::Receiver<ExitState> {
        self.exit_rx.clone()
    }

    /// Write each line followed by a newline, then close stdin
    pub async fn write_script(&mut self, lines: &[String]) -> Result<()> {
        let mut stdin = self.stdin.take().context("Child stdin already closed")?;
        for line in lines {
            stdin
                .write_all(line.as_bytes())
                .await
                .context("Failed to write to child stdin")?;
            stdin
                .write_all(b"\n")
                .await
                .context("Failed to write to child stdin")?;
        }
        stdin.flush().await.context("Failed to flush child stdin")?;
        Ok(())
    }

    /// Ask the child to stop
    #[cfg(unix)]
    pub fn signal(&mut self, signal: StopSignal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if !self.is_alive() {
            return Ok(());
        }

        let signo = match signal {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
        };
        let result = unsafe { libc::kill(pid as i32, signo) };
        if result == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        // Already gone
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err).with_context(|| format!("Failed to signal {} (pid {})", self.role, pid))
    }

    #[cfg(not(unix))]
    pub fn signal(&mut self, _signal: StopSignal) -> Result<()> {
        self.kill();
        Ok(())
    }

    /// Forcefully kill the child
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait up to `limit` for the child to exit; returns its exit code if it did
    pub async fn wait_for_exit(&self, limit: Duration) -> Option<Option<i32>> {
        let mut exit_rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(
            limit,
            exit_rx.wait_for(|state| matches!(state, ExitState::Exited { .. })),
        )
        .await;

        match waited {
            Ok(Ok(state)) => match *state {
                ExitState::Exited { code } => Some(code),
                ExitState::Running => None,
            },
            // Wait task is gone, so is the child
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        }
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Scan child output until `inspect` matches a line or the child exits.
///
/// Output that arrives shortly after exit is still inspected, so a marker
/// printed right before a quick exit is not lost.
pub async fn watch_output<T, F>(
    output: &mut broadcast::Receiver<OutputLine>,
    exit: &mut watch::Receiver<ExitState>,
    mut inspect: F,
) -> LineWait<T>
where
    F: FnMut(&OutputLine) -> Option<T>,
{
    loop {
        let state = *exit.borrow_and_update();
        if let ExitState::Exited { code } = state {
            return drain_after_exit(output, code, &mut inspect).await;
        }

        tokio::select! {
            biased;
            line = output.recv() => match line {
                Ok(line) => {
                    if let Some(found) = inspect(&line) {
                        return LineWait::Matched(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let code = match exit.wait_for(|s| matches!(s, ExitState::Exited { .. })).await {
                        Ok(state) => match *state {
                            ExitState::Exited { code } => code,
                            ExitState::Running => None,
                        },
                        Err(_) => None,
                    };
                    return LineWait::Exited(code);
                }
            },
            changed = exit.changed() => {
                if changed.is_err() {
                    return LineWait::Exited(None);
                }
            }
        }
    }
}

async fn drain_after_exit<T, F>(
    output: &mut broadcast::Receiver<OutputLine>,
    code: Option<i32>,
    inspect: &mut F,
) -> LineWait<T>
where
    F: FnMut(&OutputLine) -> Option<T>,
{
    loop {
        match tokio::time::timeout(EXIT_DRAIN_WINDOW, output.recv()).await {
            Ok(Ok(line)) => {
                if let Some(found) = inspect(&line) {
                    return LineWait::Matched(found);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                return LineWait::Exited(code);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_spawn_echo() {
        let (runtime, mut output) =
            ProcessRuntime::spawn(ProcessRole::Service, &sh("echo hello; exit 3")).unwrap();
        let mut exit = runtime.exit_watcher();

        let seen = watch_output(&mut output, &mut exit, |line| {
            (line.text == "hello").then_some(())
        })
        .await;
        assert_eq!(seen, LineWait::Matched(()));

        assert_eq!(
            runtime.wait_for_exit(Duration::from_secs(5)).await,
            Some(Some(3))
        );
        assert!(!runtime.is_alive());
    }

    #[tokio::test]
    async fn test_watch_output_reports_exit_without_match() {
        let (runtime, mut output) =
            ProcessRuntime::spawn(ProcessRole::Capture, &sh("echo nope; exit 1")).unwrap();
        let mut exit = runtime.exit_watcher();

        let result: LineWait<()> = watch_output(&mut output, &mut exit, |_| None).await;
        assert_eq!(result, LineWait::Exited(Some(1)));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let (runtime, mut output) =
            ProcessRuntime::spawn(ProcessRole::Capture, &sh("echo '[ERROR] bad' 1>&2")).unwrap();
        let mut exit = runtime.exit_watcher();

        let result = watch_output(&mut output, &mut exit, |line| {
            (line.stream == OutputStream::Stderr).then(|| line.text.clone())
        })
        .await;
        assert_eq!(result, LineWait::Matched("[ERROR] bad".to_string()));
    }

    #[tokio::test]
    async fn test_write_script_feeds_stdin() {
        let (mut runtime, mut output) = ProcessRuntime::spawn(
            ProcessRole::Capture,
            &sh("read a; read b; echo \"got $a|$b\""),
        )
        .unwrap();
        let mut exit = runtime.exit_watcher();

        runtime
            .write_script(&["1".to_string(), "https://youtu.be/x".to_string()])
            .await
            .unwrap();

        let result = watch_output(&mut output, &mut exit, |line| {
            line.text.strip_prefix("got ").map(str::to_string)
        })
        .await;
        assert_eq!(result, LineWait::Matched("1|https://youtu.be/x".to_string()));
    }

    #[tokio::test]
    async fn test_interrupt_signal_stops_child() {
        let (mut runtime, _output) =
            ProcessRuntime::spawn(ProcessRole::Capture, &sh("sleep 30")).unwrap();
        assert!(runtime.is_alive());

        runtime.signal(StopSignal::Interrupt).unwrap();
        let code = runtime.wait_for_exit(Duration::from_secs(5)).await;
        // Killed by signal: no exit code
        assert_eq!(code, Some(None));
    }

    #[tokio::test]
    async fn test_kill_forces_exit() {
        let (mut runtime, _output) = ProcessRuntime::spawn(
            ProcessRole::Service,
            &sh("trap '' TERM INT; sleep 30"),
        )
        .unwrap();

        runtime.signal(StopSignal::Terminate).unwrap();
        assert_eq!(runtime.wait_for_exit(Duration::from_millis(300)).await, None);

        runtime.kill();
        assert_eq!(
            runtime.wait_for_exit(Duration::from_secs(5)).await,
            Some(None)
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let result = ProcessRuntime::spawn(
            ProcessRole::Service,
            &ProcessCommand::new("/definitely/not/here"),
        );
        assert!(result.is_err());
    }
}
