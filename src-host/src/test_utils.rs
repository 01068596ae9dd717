//! Test support shared by unit and integration tests: a polling assertion
//! plus in-memory doubles for the push surface and the permission probe.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::session::notify::EventSink;
use crate::session::permissions::PermissionProbe;
use crate::session::protocol::{
    BackendStatus, MediaAccess, PermissionKind, PermissionReport, SessionStatus, UiEvent,
};

/// Poll `condition` every `interval` until it holds, panicking after `timeout`.
///
/// Used instead of fixed sleeps when waiting on child processes, the
/// event stream or the crash supervisor.
///
/// ```rust,ignore
/// assert_eventually_bool(
///     "first alert to arrive",
///     Duration::from_secs(2),
///     Duration::from_millis(50),
///     || async { !sink.alerts().is_empty() },
/// )
/// .await;
/// ```
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let mut polls = 0u32;

    while !condition().await {
        polls += 1;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timed out after {:?} ({} polls) waiting for {}",
                elapsed, polls, desc
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// Push sink that keeps every event in memory, without debouncing
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::FactCheckAlert { payload } => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn session_statuses(&self) -> Vec<SessionStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::SessionStatus { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn backend_statuses(&self) -> Vec<BackendStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::BackendStatus { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn error_titles(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::ErrorMessage { title, .. } => Some(title),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UiEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Permission probe answering from fixed statuses
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions {
    report: PermissionReport,
}

impl StaticPermissions {
    pub fn new(microphone: MediaAccess, screen: MediaAccess) -> Self {
        Self {
            report: PermissionReport { microphone, screen },
        }
    }

    pub fn granted() -> Self {
        Self::new(MediaAccess::Granted, MediaAccess::Granted)
    }
}

impl PermissionProbe for StaticPermissions {
    fn check(&self) -> PermissionReport {
        self.report
    }

    fn request_microphone(&self) -> anyhow::Result<bool> {
        Ok(self.report.microphone.permits_capture())
    }

    fn open_settings(&self, _kind: PermissionKind) -> anyhow::Result<()> {
        Ok(())
    }
}
