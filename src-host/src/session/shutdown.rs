//! Process-wide teardown.
//!
//! Order: deregister the control surface, fence any session still
//! starting, disconnect the event relay, stop the capture client, stop the
//! backend, then run release hooks (pid file, socket, instance lock). The sequence runs once no matter how many times
//! it is triggered, and is bounded so the host can always exit.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::session::commands::ControlSurface;

type ReleaseHook = Box<dyn FnOnce() + Send>;

pub struct ShutdownCoordinator {
    surface: Arc<ControlSurface>,
    timeout: Duration,
    done: OnceCell<()>,
    release: StdMutex<Vec<ReleaseHook>>,
}

impl ShutdownCoordinator {
    pub fn new(surface: Arc<ControlSurface>, timeout: Duration) -> Self {
        Self {
            surface,
            timeout,
            done: OnceCell::new(),
            release: StdMutex::new(Vec::new()),
        }
    }

    /// Register a cleanup step run after every child is gone
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.release.lock() {
            hooks.push(Box::new(hook));
        }
    }

    /// Run the teardown once; later and concurrent callers wait for it
    pub async fn shutdown(&self) {
        self.done.get_or_init(|| self.run()).await;
    }

    pub fn is_complete(&self) -> bool {
        self.done.initialized()
    }

    async fn run(&self) {
        info!("Shutting down");
        self.surface.deregister();

        let controller = Arc::clone(self.surface.controller());
        controller.close();
        let teardown = async {
            controller.relay().disconnect();
            controller.capture().stop().await;
            controller.service().stop().await;
        };

        // Children still held when the bound expires are killed as their handles drop
        if tokio::time::timeout(self.timeout, teardown).await.is_err() {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                "Shutdown timed out, killing remaining children"
            );
        }

        let hooks = match self.release.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for hook in hooks {
            hook();
        }

        info!("Shutdown complete");
    }
}

/// Resolve on SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::config::{Config, ProcessCommand};
    use crate::session::controller::SessionController;
    use crate::session::protocol::{ControlRequest, ControlResponse};
    use crate::test_utils::{RecordingSink, StaticPermissions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> (Arc<ShutdownCoordinator>, Arc<ControlSurface>) {
        let mut config = Config::from_lookup(|_| None);
        config.port = 1;
        config.service = ProcessCommand::new("sh")
            .arg("-c")
            .arg("echo '[READY]'; sleep 30");
        config.timings.service_grace = Duration::from_millis(500);

        let controller = SessionController::launch(
            &config,
            Arc::new(RecordingSink::default()),
            Arc::new(StaticPermissions::granted()),
        );
        let surface = Arc::new(ControlSurface::new(controller));
        (
            Arc::new(ShutdownCoordinator::new(
                Arc::clone(&surface),
                Duration::from_secs(10),
            )),
            surface,
        )
    }

    #[tokio::test]
    async fn test_shutdown_stops_backend_and_runs_hooks_once() {
        let (coordinator, surface) = coordinator();
        surface.controller().service().start().await.unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        coordinator.on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.shutdown().await })
        };
        coordinator.shutdown().await;
        first.await.unwrap();

        assert!(coordinator.is_complete());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!surface.controller().query_state().backend_running);
        assert!(matches!(
            surface.handle(ControlRequest::Ping).await,
            ControlResponse::Outcome { success: false, .. }
        ));
    }
}
