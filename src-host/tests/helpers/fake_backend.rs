//! In-process stand-in for the backend's HTTP API.
//!
//! Serves `/health`, `/stats` and `/events`. Each `/events` connection takes
//! the next scripted body; without one it only sends heartbeats. The
//! `Last-Event-ID` of every event request is recorded.

use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

struct EventScript {
    body: String,
    close: bool,
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<EventScript>>,
    last_event_ids: Mutex<Vec<u64>>,
    unhealthy: AtomicBool,
}

pub struct FakeBackend {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend addr");
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = serve(socket, shared).await;
                });
            }
        });

        Self { addr, shared, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queue the body for the next `/events` connection
    pub fn push_stream(&self, body: &str, close: bool) {
        self.shared
            .scripts
            .lock()
            .unwrap()
            .push_back(EventScript {
                body: body.to_string(),
                close,
            });
    }

    /// Cursor sent by each event stream request, in order
    pub fn last_event_ids(&self) -> Vec<u64> {
        self.shared.last_event_ids.lock().unwrap().clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.unhealthy.store(!healthy, Ordering::SeqCst);
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&head).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let last_event_id = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("last-event-id") {
            value.trim().parse::<u64>().ok()
        } else {
            None
        }
    });

    match path.as_str() {
        "/health" if !shared.unhealthy.load(Ordering::SeqCst) => {
            respond_json(&mut socket, "200 OK", &json!({"status": "healthy"}).to_string()).await
        }
        "/health" => respond_json(&mut socket, "503 Service Unavailable", "{}").await,
        "/stats" => {
            respond_json(
                &mut socket,
                "200 OK",
                &json!({"claims_checked": 3, "alerts": 1}).to_string(),
            )
            .await
        }
        "/events" => {
            shared
                .last_event_ids
                .lock()
                .unwrap()
                .push(last_event_id.unwrap_or(0));
            let script = shared.scripts.lock().unwrap().pop_front();

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
                )
                .await?;

            if let Some(script) = &script {
                socket.write_all(script.body.as_bytes()).await?;
                socket.flush().await?;
                if script.close {
                    return socket.shutdown().await;
                }
            }

            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                socket.write_all(b": heartbeat\n\n").await?;
            }
        }
        _ => respond_json(&mut socket, "404 Not Found", "{}").await,
    }
}

async fn respond_json(socket: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}
