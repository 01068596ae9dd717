use fact_checker_host_lib::session::protocol::{
    deserialize_message, serialize_message, ControlRequest, ControlResponse, HostNotification,
    RequestFrame, ResponseFrame,
};
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(20);
const INITIAL_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 500;

#[derive(Debug)]
pub enum HostError {
    SpawnFailed(std::io::Error),
    ReadyTimeout(PathBuf),
    Exited(Option<i32>),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::SpawnFailed(err) => write!(f, "Failed to spawn host: {}", err),
            HostError::ReadyTimeout(path) => {
                write!(f, "Host socket never appeared at {}", path.display())
            }
            HostError::Exited(code) => write!(f, "Host exited early with {:?}", code),
        }
    }
}

impl std::error::Error for HostError {}

/// Where the host keeps its runtime files and finds its backend scripts
pub struct HostDirs<'a> {
    pub runtime_dir: &'a Path,
    pub backend_dir: &'a Path,
    pub port: u16,
}

/// RAII wrapper that ensures the host process is cleaned up.
pub struct HostGuard {
    child: Child,
    runtime_dir: PathBuf,
}

impl HostGuard {
    /// Start the compiled host binary.
    ///
    /// The runtime is `/bin/sh`, so `backend.py` and `client.py` in
    /// `backend_dir` are plain shell scripts.
    pub fn start(dirs: HostDirs<'_>) -> Result<Self, HostError> {
        let child = spawn_host(&dirs)?;
        let guard = Self {
            child,
            runtime_dir: dirs.runtime_dir.to_path_buf(),
        };
        guard.wait_for_ready()?;
        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("host.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("host.pid")
    }

    fn wait_for_ready(&self) -> Result<(), HostError> {
        let socket = self.socket_path();
        if wait_until(READY_TIMEOUT, || UnixStream::connect(&socket).is_ok()) {
            Ok(())
        } else {
            Err(HostError::ReadyTimeout(socket))
        }
    }

    pub fn connect(&self) -> HostClient {
        HostClient::connect(&self.socket_path())
    }

    /// Wait for the host to exit on its own; returns its exit code
    pub fn wait_for_exit(&mut self) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < EXIT_TIMEOUT {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status.code();
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("host did not exit within {:?}", EXIT_TIMEOUT);
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        // SIGTERM lets the host stop its own children first
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        if !wait_until(EXIT_TIMEOUT, || matches!(self.child.try_wait(), Ok(Some(_)))) {
            eprintln!("Host pid {} ignored SIGTERM, killing", self.child.id());
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Spawn the host without waiting for it, for tests expecting it to fail
pub fn spawn_host(dirs: &HostDirs<'_>) -> Result<Child, HostError> {
    Command::new(env!("CARGO_BIN_EXE_fact-checker-host"))
        .env("FACT_CHECKER_HOME", dirs.runtime_dir)
        .env("FACT_CHECKER_BACKEND_DIR", dirs.backend_dir)
        .env("FACT_CHECKER_PYTHON", "/bin/sh")
        .env("PORT", dirs.port.to_string())
        .env_remove("FACT_CHECKER_DEBUG_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(HostError::SpawnFailed)
}

/// Poll `condition` with exponential backoff until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);

    loop {
        if condition() {
            return true;
        }
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }
}

pub fn process_is_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Blocking NDJSON client for the control socket
pub struct HostClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
    /// Responses that arrived while waiting for a different id
    unclaimed: HashMap<u64, ControlResponse>,
    /// Push frames seen while waiting for responses
    pub notifications: Vec<HostNotification>,
}

impl HostClient {
    pub fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).expect("connect to host socket");
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .expect("set read timeout");
        let writer = stream.try_clone().expect("clone socket");
        Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 0,
            unclaimed: HashMap::new(),
            notifications: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).expect("write request");
        self.writer.flush().expect("flush request");
    }

    /// Encode a request with a fresh id without sending it
    pub fn frame(&mut self, request: &ControlRequest) -> (u64, Vec<u8>) {
        self.next_id += 1;
        let frame = RequestFrame {
            id: Some(self.next_id),
            request: request.clone(),
        };
        (self.next_id, serialize_message(&frame).expect("encode request"))
    }

    pub fn request(&mut self, request: &ControlRequest) -> ControlResponse {
        let (id, bytes) = self.frame(request);
        self.send_raw(&bytes);
        self.wait_for(id)
    }

    /// Response to request `id`, holding on to any others that arrive first
    pub fn wait_for(&mut self, id: u64) -> ControlResponse {
        loop {
            if let Some(response) = self.unclaimed.remove(&id) {
                return response;
            }
            let frame = self.read_frame();
            match frame.id {
                Some(other) => {
                    self.unclaimed.insert(other, frame.response);
                }
                None => panic!("unexpected response without id: {:?}", frame.response),
            }
        }
    }

    /// Next response frame of any id, collecting interleaved push frames
    pub fn read_response(&mut self) -> ControlResponse {
        self.read_frame().response
    }

    /// Next response frame with its id, collecting interleaved push frames
    pub fn read_frame(&mut self) -> ResponseFrame {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).expect("read frame");
            assert!(n > 0, "host closed the connection");

            if let Ok(frame) = deserialize_message::<ResponseFrame>(line.as_bytes()) {
                return frame;
            }
            let push = deserialize_message::<HostNotification>(line.as_bytes())
                .unwrap_or_else(|e| panic!("unexpected frame {:?}: {}", line, e));
            self.notifications.push(push);
        }
    }

    /// True once the host has closed this connection
    pub fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.reader.read_line(&mut line), Ok(0))
    }
}
