// Environment configuration helpers for the session host
// Handles runtime paths (socket, PID, lock), child process commands and timings

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::session::backoff::BackoffPolicy;
use crate::session::supervisor::{KILL_WAIT, TERMINATE_WINDOW};

/// Port the backend listens on when PORT is unset or invalid
pub const DEFAULT_PORT: u16 = 5002;

const SERVICE_SCRIPT: &str = "backend.py";
const CAPTURE_SCRIPT: &str = "client.py";

/// A child process invocation: program, arguments, working dir and extra env
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Locate the program on disk, searching PATH for bare names
    pub fn resolve_program(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            return self.program.is_file().then(|| self.program.clone());
        }

        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

/// Time bounds for every asynchronous wait in the host
#[derive(Debug, Clone)]
pub struct Timings {
    /// How long the backend may take to print its readiness marker
    pub service_startup: Duration,
    /// Grace window between SIGTERM and SIGKILL for the backend
    pub service_grace: Duration,
    /// Capture start resolves optimistically after this long
    pub capture_startup: Duration,
    /// Grace window between SIGINT and SIGTERM for the capture client
    pub capture_grace: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    /// Per-request timeout for health/stats calls
    pub http_timeout: Duration,
    pub reconnect: BackoffPolicy,
    /// Upper bound on the whole shutdown sequence
    pub shutdown: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            service_startup: Duration::from_secs(60),
            service_grace: Duration::from_secs(5),
            capture_startup: Duration::from_secs(120),
            capture_grace: Duration::from_secs(10),
            health_attempts: 10,
            health_interval: Duration::from_millis(1000),
            http_timeout: Duration::from_secs(3),
            reconnect: BackoffPolicy::default(),
            shutdown: Duration::from_secs(30),
        }
    }
}

impl Timings {
    /// Longest a capture stop followed by a backend stop can take
    pub fn worst_case_teardown(&self) -> Duration {
        // Capture: SIGINT grace, SIGTERM window, kill. Backend: SIGTERM grace, kill.
        self.capture_grace + TERMINATE_WINDOW + KILL_WAIT + self.service_grace + KILL_WAIT
    }
}

/// Configuration for host paths, child commands and settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime files (socket, PID, lock)
    pub runtime_dir: PathBuf,
    /// Path to the control socket the presentation layer connects to
    pub socket_path: PathBuf,
    /// Path to the host PID file
    pub pid_file: PathBuf,
    /// Advisory lock held for the lifetime of the host
    pub lock_file: PathBuf,
    /// Directory containing backend.py and client.py
    pub backend_dir: PathBuf,
    /// Port the backend serves health, stats and events on
    pub port: u16,
    pub service: ProcessCommand,
    pub capture: ProcessCommand,
    pub timings: Timings,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // FACT_CHECKER_HOME overrides the runtime dir
        let runtime_dir = lookup("FACT_CHECKER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_runtime_dir(&lookup));

        let backend_dir = lookup("FACT_CHECKER_BACKEND_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_backend_dir);

        let python = lookup("FACT_CHECKER_PYTHON")
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_python(&backend_dir));

        let port = Self::parse_port(lookup("PORT"));

        let script_command = |script: &str| {
            ProcessCommand::new(python.clone())
                .arg("-u")
                .arg(script)
                .current_dir(backend_dir.clone())
                .env("PYTHONUNBUFFERED", "1")
                .env("PORT", port.to_string())
        };
        let service = script_command(SERVICE_SCRIPT);
        let capture = script_command(CAPTURE_SCRIPT);

        Self {
            socket_path: runtime_dir.join("host.sock"),
            pid_file: runtime_dir.join("host.pid"),
            lock_file: runtime_dir.join("host.lock"),
            runtime_dir,
            service,
            capture,
            backend_dir,
            port,
            timings: Timings::default(),
        }
    }

    /// Re-root socket, PID and lock under another directory
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.socket_path = dir.join("host.sock");
        self.pid_file = dir.join("host.pid");
        self.lock_file = dir.join("host.lock");
        self.runtime_dir = dir;
        self
    }

    fn parse_port(raw: Option<String>) -> u16 {
        match raw {
            None => DEFAULT_PORT,
            Some(value) => match value.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(value = %value, fallback = DEFAULT_PORT, "Invalid PORT value");
                    DEFAULT_PORT
                }
            },
        }
    }

    /// Get the default runtime directory (socket + pid + lock)
    fn default_runtime_dir<F>(lookup: &F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set
            if let Some(runtime_dir) = lookup("XDG_RUNTIME_DIR") {
                return PathBuf::from(runtime_dir).join("fact-checker");
            }
        }

        #[cfg(not(target_os = "linux"))]
        let _ = lookup;

        dirs::home_dir()
            .map(|h| h.join(".fact-checker"))
            .unwrap_or_else(|| std::env::temp_dir().join("fact-checker"))
    }

    /// Backend scripts ship next to the executable; fall back to ./backend
    fn default_backend_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("backend")))
            .filter(|dir| dir.join(SERVICE_SCRIPT).is_file())
            .unwrap_or_else(|| PathBuf::from("backend"))
    }

    fn default_python(backend_dir: &Path) -> PathBuf {
        #[cfg(windows)]
        {
            backend_dir.join("venv").join("Scripts").join("python.exe")
        }

        #[cfg(not(windows))]
        {
            backend_dir.join("venv").join("bin").join("python")
        }
    }

    /// Base URL of the backend's HTTP API
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn events_url(&self) -> String {
        format!("{}/events", self.base_url())
    }

    /// Ensure the runtime directory exists with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// Write the host PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the host PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }
}
