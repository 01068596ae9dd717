// Presentation bridge over the host's Unix socket
// Requests and responses are newline-delimited JSON matched by id; push events are interleaved as HostNotification frames

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::session::commands::ControlSurface;
use crate::session::notify::BroadcastSink;
use crate::session::protocol::{
    serialize_message, ControlRequest, ControlResponse, HostNotification, RequestFrame,
    ResponseFrame, UiEvent, MAX_REQUEST_FRAME_SIZE,
};

/// Frames queued per client before the writer applies backpressure
const OUTBOUND_CAPACITY: usize = 64;

/// Exclusive advisory lock proving this is the only host
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to secure lock file: {}", path.display()))?;
        }

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                bail!("Another host instance holds {}", path.display())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to lock {}", path.display()))
            }
        }
    }

    pub fn release(self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, path = %self.path.display(), "Failed to release instance lock");
        }
    }
}

/// Bind the control socket with owner-only permissions
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        // The instance lock is held, so any socket left here is stale
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket: {}", path.display()))?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set socket permissions: {}", path.display()))?;
    }

    Ok(listener)
}

/// Accept presentation clients forever; a `quit` request is reported on `quit_tx`
pub async fn serve(
    listener: UnixListener,
    surface: Arc<ControlSurface>,
    events: Arc<BroadcastSink>,
    quit_tx: mpsc::Sender<()>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("Presentation client connected");
                let surface = Arc::clone(&surface);
                let pushes = events.subscribe();
                let quit_tx = quit_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(surface, pushes, stream, quit_tx).await {
                        warn!(error = ?e, "Client error");
                    }
                    debug!("Presentation client disconnected");
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept error");
            }
        }
    }
}

/// Queued for the connection's single writer
enum Outbound {
    Frame(Vec<u8>),
    /// Acknowledged once every earlier frame has been written
    Flush(oneshot::Sender<()>),
}

async fn handle_client(
    surface: Arc<ControlSurface>,
    pushes: broadcast::Receiver<UiEvent>,
    stream: UnixStream,
    quit_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    // Single writer so responses and pushes never interleave mid-frame
    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Outbound::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    let push_task = tokio::spawn(forward_pushes(pushes, out_tx.clone()));

    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let result = loop {
        line.clear();
        let limit = MAX_REQUEST_FRAME_SIZE as u64 + 1;
        match (&mut reader).take(limit).read_line(&mut line).await {
            Ok(0) => break Ok(false),
            Ok(_) => {}
            Err(e) => break Err(e).context("Failed to read request"),
        }

        if line.len() > MAX_REQUEST_FRAME_SIZE {
            let response = ControlResponse::Error {
                message: format!(
                    "Request frame too large: over {} bytes",
                    MAX_REQUEST_FRAME_SIZE
                ),
            };
            let _ = out_tx.send(Outbound::Frame(encode(None, response)?)).await;
            // The rest of the frame cannot be resynchronised
            break Ok(false);
        }

        let (id, parsed) = parse_request(&line);
        match parsed {
            Ok(ControlRequest::Quit) => {
                let response = surface.handle(ControlRequest::Quit).await;
                let _ = out_tx.send(Outbound::Frame(encode(id, response)?)).await;
                // The reply must be on the wire before teardown starts
                let (ack_tx, ack_rx) = oneshot::channel();
                if out_tx.send(Outbound::Flush(ack_tx)).await.is_ok() {
                    let _ = ack_rx.await;
                }
                break Ok(true);
            }
            Ok(request) => {
                // Each request runs on its own so a slow start never blocks
                // a query, a pause or a competing start on this connection
                let surface = Arc::clone(&surface);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = surface.handle(request).await;
                    match encode(id, response) {
                        Ok(bytes) => {
                            let _ = out_tx.send(Outbound::Frame(bytes)).await;
                        }
                        Err(e) => warn!(error = %e, "Failed to encode response"),
                    }
                });
            }
            Err(message) => {
                let response = ControlResponse::Error { message };
                if out_tx.send(Outbound::Frame(encode(id, response)?)).await.is_err() {
                    break Ok(false);
                }
            }
        }
    };

    if matches!(result, Ok(true)) {
        info!("Quit requested by presentation client");
        let _ = quit_tx.send(()).await;
    }

    push_task.abort();
    let _ = push_task.await;
    drop(out_tx);
    // Requests still running keep the writer alive until they answer
    let _ = writer_task.await;
    result.map(|_| ())
}

/// Decode one request line, keeping its id even when the body is invalid
fn parse_request(line: &str) -> (Option<u64>, Result<ControlRequest, String>) {
    let value: Value = match serde_json::from_str(line.trim_end()) {
        Ok(value) => value,
        Err(e) => return (None, Err(format!("Failed to parse request: {}", e))),
    };
    let id = value.get("id").and_then(Value::as_u64);

    match serde_json::from_value::<RequestFrame>(value) {
        Ok(frame) => (id, Ok(frame.request)),
        Err(e) => (id, Err(format!("Failed to parse request: {}", e))),
    }
}

fn encode(id: Option<u64>, response: ControlResponse) -> Result<Vec<u8>> {
    Ok(serialize_message(&ResponseFrame { id, response })?)
}

async fn forward_pushes(mut pushes: broadcast::Receiver<UiEvent>, out_tx: mpsc::Sender<Outbound>) {
    loop {
        match pushes.recv().await {
            Ok(event) => match serialize_message(&HostNotification::now(event)) {
                Ok(bytes) => {
                    if out_tx.send(Outbound::Frame(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode push event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Client is too slow, skip missed events
                warn!(skipped, "Presentation client lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_instance_lock_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("host.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(second.is_err());

        first.release();
        let third = InstanceLock::acquire(&path).unwrap();
        third.release();
    }

    #[test]
    fn test_parse_request_keeps_id_of_invalid_body() {
        let (id, parsed) = parse_request("{\"id\":4,\"type\":\"get_session_state\"}\n");
        assert_eq!(id, Some(4));
        assert!(matches!(parsed, Ok(ControlRequest::GetSessionState)));

        let (id, parsed) = parse_request("{\"id\":5,\"type\":\"launch\"}\n");
        assert_eq!(id, Some(5));
        assert!(parsed.is_err());

        let (id, parsed) = parse_request("not json\n");
        assert_eq!(id, None);
        assert!(parsed.unwrap_err().starts_with("Failed to parse request"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("host.sock");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind_socket(&path).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
