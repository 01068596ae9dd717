//! Single-occupant slot holding the live child for one role.
//!
//! The slot is the only owner of a [`ProcessRuntime`]. A watcher task per
//! installed child clears the slot when the child dies on its own and sends a
//! [`ProcessExit`] notice; a child removed through [`ProcessSlot::take`] or
//! [`ProcessSlot::stop`] exits silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::protocol::ProcessRole;
use crate::session::runtime::{ExitState, ProcessRuntime, StopSignal};

/// Window given to SIGTERM after an ignored SIGINT
pub const TERMINATE_WINDOW: Duration = Duration::from_secs(2);
/// How long to wait for the reaper after a hard kill
pub const KILL_WAIT: Duration = Duration::from_secs(2);

/// A supervised child exited without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub role: ProcessRole,
    pub code: Option<i32>,
}

struct Supervised {
    generation: u64,
    runtime: ProcessRuntime,
}

pub struct ProcessSlot {
    role: ProcessRole,
    current: Arc<StdMutex<Option<Supervised>>>,
    generations: AtomicU64,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessSlot {
    pub fn new(role: ProcessRole, exit_tx: mpsc::UnboundedSender<ProcessExit>) -> Self {
        Self {
            role,
            current: Arc::new(StdMutex::new(None)),
            generations: AtomicU64::new(0),
            exit_tx,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    fn lock(&self) -> MutexGuard<'_, Option<Supervised>> {
        lock_slot(&self.current)
    }

    /// Place a freshly spawned child in the slot and start watching it
    ///
    /// Returns the generation identifying this occupant.
    pub fn install(&self, runtime: ProcessRuntime) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut exit = runtime.exit_watcher();
        let pid = runtime.pid();

        let previous = self.lock().replace(Supervised {
            generation,
            runtime,
        });
        if previous.is_some() {
            // Dropping the old runtime kills it
            warn!(role = %self.role, "Replacing a live child; killing the old one");
        }
        drop(previous);

        let current = Arc::clone(&self.current);
        let exit_tx = self.exit_tx.clone();
        let role = self.role;

        tokio::spawn(async move {
            let code = match exit
                .wait_for(|state| matches!(state, ExitState::Exited { .. }))
                .await
            {
                Ok(state) => match *state {
                    ExitState::Exited { code } => code,
                    ExitState::Running => None,
                },
                Err(_) => None,
            };

            let stale = {
                let mut guard = lock_slot(&current);
                match guard.as_ref() {
                    Some(supervised) if supervised.generation == generation => guard.take(),
                    _ => None,
                }
            };

            if stale.is_some() {
                info!(role = %role, pid = ?pid, ?code, "Child exited unexpectedly");
                let _ = exit_tx.send(ProcessExit { role, code });
            } else {
                debug!(role = %role, pid = ?pid, ?code, "Child exited after stop");
            }
        });

        debug!(role = %self.role, generation, pid = ?pid, "Installed child");
        generation
    }

    /// Whether a child is present and still alive
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|supervised| supervised.runtime.is_alive())
            .unwrap_or(false)
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    /// Current occupant's generation, if any
    pub fn generation(&self) -> Option<u64> {
        self.lock().as_ref().map(|supervised| supervised.generation)
    }

    /// Remove the child without signalling it
    pub fn take(&self) -> Option<ProcessRuntime> {
        self.lock().take().map(|supervised| supervised.runtime)
    }

    /// Stop the current child.
    ///
    /// The slot is cleared before any signal is sent, so a second call is a
    /// no-op. Escalates `first` -> SIGTERM (when `first` was SIGINT) -> kill.
    /// Returns the exit code once the child is gone, or `None` when the slot
    /// was empty.
    pub async fn stop(&self, first: StopSignal, grace: Duration) -> Option<Option<i32>> {
        let mut runtime = self.take()?;
        let role = self.role;

        if !runtime.is_alive() {
            return runtime.wait_for_exit(Duration::ZERO).await;
        }

        info!(role = %role, pid = ?runtime.pid(), signal = ?first, "Stopping child");
        if let Err(e) = runtime.signal(first) {
            warn!(role = %role, error = %e, "Failed to signal child");
        }
        if let Some(code) = runtime.wait_for_exit(grace).await {
            return Some(code);
        }

        if first == StopSignal::Interrupt {
            warn!(role = %role, grace_ms = grace.as_millis() as u64, "Child ignored interrupt, sending terminate");
            if let Err(e) = runtime.signal(StopSignal::Terminate) {
                warn!(role = %role, error = %e, "Failed to signal child");
            }
            if let Some(code) = runtime.wait_for_exit(TERMINATE_WINDOW).await {
                return Some(code);
            }
        }

        warn!(role = %role, pid = ?runtime.pid(), "Child did not exit in time, killing");
        runtime.kill();
        Some(runtime.wait_for_exit(KILL_WAIT).await.flatten())
    }
}

fn lock_slot(slot: &StdMutex<Option<Supervised>>) -> MutexGuard<'_, Option<Supervised>> {
    // A poisoned slot still holds a valid Option
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::config::ProcessCommand;
    use std::time::Instant;

    fn spawn_sh(script: &str) -> ProcessRuntime {
        let command = ProcessCommand::new("sh").arg("-c").arg(script);
        ProcessRuntime::spawn(ProcessRole::Capture, &command).unwrap().0
    }

    #[tokio::test]
    async fn test_unexpected_exit_clears_slot_and_notifies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = ProcessSlot::new(ProcessRole::Service, tx);

        slot.install(spawn_sh("exit 7"));

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            ProcessExit {
                role: ProcessRole::Service,
                code: Some(7)
            }
        );
        assert!(!slot.is_occupied());
    }

    #[tokio::test]
    async fn test_requested_stop_is_silent_and_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = ProcessSlot::new(ProcessRole::Capture, tx);

        slot.install(spawn_sh("sleep 30"));
        assert!(slot.is_running());

        let code = slot
            .stop(StopSignal::Interrupt, Duration::from_secs(5))
            .await;
        assert_eq!(code, Some(None));
        assert!(!slot.is_occupied());

        // Second stop has nothing to do
        assert_eq!(
            slot.stop(StopSignal::Interrupt, Duration::from_secs(5))
                .await,
            None
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let slot = ProcessSlot::new(ProcessRole::Service, tx);

        slot.install(spawn_sh("trap '' TERM INT; sleep 30"));
        let started = Instant::now();
        let code = slot
            .stop(StopSignal::Terminate, Duration::from_millis(200))
            .await;

        assert_eq!(code, Some(None));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_generation_advances_per_install() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let slot = ProcessSlot::new(ProcessRole::Capture, tx);

        let first = slot.install(spawn_sh("sleep 30"));
        slot.stop(StopSignal::Terminate, Duration::from_secs(2)).await;
        let second = slot.install(spawn_sh("sleep 30"));

        assert!(second > first);
        assert_eq!(slot.generation(), Some(second));
        slot.stop(StopSignal::Terminate, Duration::from_secs(2)).await;
    }
}
