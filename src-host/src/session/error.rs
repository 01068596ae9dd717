//! Error taxonomy for session operations.
//!
//! Every variant maps to a [`UserMessage`] so the presentation layer only ever
//! sees a short title and a readable detail, never a raw error value.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::protocol::{PermissionKind, ProcessRole, UserMessage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{role} executable not found: {}", .path.display())]
    ExecutableMissing { role: ProcessRole, path: PathBuf },

    #[error("{role} did not become ready within {}s", .timeout.as_secs())]
    StartupTimeout { role: ProcessRole, timeout: Duration },

    #[error("unknown source type: {0:?}")]
    UnknownSourceType(String),

    #[error("{0} permission not granted")]
    PermissionDenied(PermissionKind),

    #[error("{role} exited unexpectedly ({})", exit_label(.code))]
    ProcessCrash { role: ProcessRole, code: Option<i32> },

    #[error("another start or stop is already in progress")]
    OperationInProgress,

    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: ProcessRole,
        #[source]
        source: std::io::Error,
    },

    #[error("host is shutting down")]
    ShuttingDown,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl SessionError {
    /// Title and detail suitable for an error toast
    pub fn user_message(&self) -> UserMessage {
        match self {
            SessionError::ExecutableMissing { path, .. } => UserMessage::new(
                "Setup Required",
                format!(
                    "The fact checker runtime was not found at {}. Run the setup script, then try again.",
                    path.display()
                ),
            ),
            SessionError::StartupTimeout { role, timeout } => UserMessage::new(
                match role {
                    ProcessRole::Service => "Backend Not Responding",
                    ProcessRole::Capture => "Capture Not Responding",
                },
                format!(
                    "The {} did not start within {} seconds. Please try again.",
                    role,
                    timeout.as_secs()
                ),
            ),
            SessionError::UnknownSourceType(kind) => UserMessage::new(
                "Unsupported Source",
                format!(
                    "\"{}\" is not a supported source. Choose YouTube, Google Meet, a local file or a live stream.",
                    kind
                ),
            ),
            SessionError::PermissionDenied(kind) => UserMessage::new(
                format!("{} Permission Required", kind),
                format!(
                    "{} access is needed to fact-check audio. Allow it in System Settings > Privacy & Security, then try again.",
                    kind
                ),
            ),
            SessionError::ProcessCrash { role, code } => UserMessage::new(
                match role {
                    ProcessRole::Service => "Backend Stopped",
                    ProcessRole::Capture => "Capture Stopped",
                },
                format!(
                    "The {} exited unexpectedly ({}). Start a new session to continue.",
                    role,
                    exit_label(code)
                ),
            ),
            SessionError::OperationInProgress => UserMessage::new(
                "Please Wait",
                "A session is already starting or stopping.",
            ),
            SessionError::Spawn { role, source } => UserMessage::new(
                "Failed to Start",
                format!("Could not launch the {}: {}", role, source),
            ),
            SessionError::ShuttingDown => {
                UserMessage::new("Shutting Down", "Fact Checker is closing.")
            }
        }
    }
}
