// Session orchestration core (shared between the host binary and integration tests)
pub mod session;

// Async polling helpers and test doubles
pub mod test_utils;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::session::commands::ControlSurface;
use crate::session::config::Config;
use crate::session::controller::SessionController;
use crate::session::notify::BroadcastSink;
use crate::session::permissions::SystemPermissions;
use crate::session::shutdown::{self, ShutdownCoordinator};

/// Push events buffered per presentation client
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Install the global subscriber; `FACT_CHECKER_DEBUG_LOG` forces debug output
pub fn init_logging() {
    let debug_enabled = env::var("FACT_CHECKER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // Already installed when called twice
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the host until a quit request or termination signal, then tear down
#[cfg(unix)]
pub async fn run(config: Config) -> Result<()> {
    use crate::session::host::{self, InstanceLock};
    use tokio::sync::mpsc;

    config
        .ensure_dirs()
        .context("Failed to create runtime directory")?;

    let lock = InstanceLock::acquire(&config.lock_file)?;
    config.write_pid().context("Failed to write PID file")?;

    let sink = Arc::new(BroadcastSink::new(PUSH_CHANNEL_CAPACITY));
    let controller =
        SessionController::launch(&config, sink.clone(), Arc::new(SystemPermissions));
    let surface = Arc::new(ControlSurface::new(controller));

    let listener = host::bind_socket(&config.socket_path)?;

    let coordinator = ShutdownCoordinator::new(Arc::clone(&surface), config.timings.shutdown);
    {
        let config = config.clone();
        coordinator.on_release(move || {
            config.remove_socket().ok();
            config.remove_pid().ok();
            lock.release();
        });
    }

    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    let server = tokio::spawn(host::serve(listener, Arc::clone(&surface), sink, quit_tx));

    info!(
        socket = %config.socket_path.display(),
        port = config.port,
        backend_dir = %config.backend_dir.display(),
        "Host listening"
    );

    tokio::select! {
        _ = quit_rx.recv() => {}
        _ = shutdown::wait_for_signal() => {}
    }

    coordinator.shutdown().await;
    server.abort();
    Ok(())
}

#[cfg(not(unix))]
pub async fn run(_config: Config) -> Result<()> {
    anyhow::bail!("The fact checker host needs Unix domain sockets")
}
