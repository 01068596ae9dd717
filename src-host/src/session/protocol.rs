// Session protocol - shared structs for the control surface and push surface
// Uses framed JSON messages over the host's Unix socket

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::error::SessionError;

/// Maximum size of a single control request frame (1MB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 1024 * 1024;

/// Media source the capture process records from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// YouTube video or YouTube Live
    Youtube,
    /// Google Meet call
    Meet,
    /// Local video file
    Local,
    /// Any live stream URL
    Stream,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Youtube,
        SourceType::Meet,
        SourceType::Local,
        SourceType::Stream,
    ];

    /// Menu selection the capture process expects on its first stdin line
    pub fn selection_code(&self) -> &'static str {
        match self {
            SourceType::Youtube => "1",
            SourceType::Meet => "2",
            SourceType::Local => "3",
            SourceType::Stream => "4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Youtube => "youtube",
            SourceType::Meet => "meet",
            SourceType::Local => "local",
            SourceType::Stream => "stream",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        SourceType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SessionError::UnknownSourceType(s.to_string()))
    }
}

/// Which supervised child a notice or error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// Long-running verification backend
    Service,
    /// Short-lived capture client
    Capture,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Service => write!(f, "backend"),
            ProcessRole::Capture => write!(f, "capture client"),
        }
    }
}

/// Process-wide session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Paused,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Point-in-time view returned by `getSessionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub backend_running: bool,
    pub client_running: bool,
    pub sse_connected: bool,
    pub is_paused: bool,
}

/// OS permission the capture pipeline depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Microphone,
    Screen,
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionKind::Microphone => write!(f, "Microphone"),
            PermissionKind::Screen => write!(f, "Screen Recording"),
        }
    }
}

/// Authorization status reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaAccess {
    Granted,
    Denied,
    Restricted,
    NotDetermined,
    /// Platform cannot tell; treated as allowed
    Unknown,
}

impl MediaAccess {
    /// Whether a session may proceed with this status
    pub fn permits_capture(&self) -> bool {
        matches!(self, MediaAccess::Granted | MediaAccess::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReport {
    pub microphone: MediaAccess,
    pub screen: MediaAccess,
}

/// Short title plus human-readable detail shown by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub title: String,
    pub detail: String,
}

impl UserMessage {
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

/// Coarse session status pushed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Paused,
    Stopped,
}

/// Backend lifecycle status pushed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

// ============================================================================
// Host -> presentation push events (fire-and-forget)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    /// Verified claim payload relayed from the backend event stream
    FactCheckAlert { payload: Value },
    SessionStatus { status: SessionStatus },
    BackendStatus { status: BackendStatus },
    ErrorMessage { title: String, detail: String },
}

impl UiEvent {
    pub fn error(message: UserMessage) -> Self {
        UiEvent::ErrorMessage {
            title: message.title,
            detail: message.detail,
        }
    }
}

/// Push event as written to socket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostNotification {
    pub notification: UiEvent,
    pub emitted_at: DateTime<Utc>,
}

impl HostNotification {
    pub fn now(notification: UiEvent) -> Self {
        Self {
            notification,
            emitted_at: Utc::now(),
        }
    }
}

// ============================================================================
// Presentation -> host control requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    CheckPermissions,
    RequestMicPermission,
    OpenSystemSettings {
        kind: PermissionKind,
    },
    StartSession {
        /// Raw source kind; validated by the host
        source_type: String,
        target: String,
    },
    StopSession,
    PauseSession,
    ResumeSession,
    GetStats,
    CheckHealth,
    GetSessionState,
    Ping,
    /// Tear down everything and exit the host
    Quit,
}

// ============================================================================
// Host -> presentation responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Permissions {
        microphone: MediaAccess,
        screen: MediaAccess,
    },
    MicPermission {
        granted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Outcome {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<UserMessage>,
    },
    Stats {
        stats: Option<Value>,
    },
    Health {
        health: Option<Value>,
    },
    SessionState {
        state: SessionSnapshot,
    },
    Pong,
    ShuttingDown,
    Error {
        message: String,
    },
}

impl ControlResponse {
    pub fn success() -> Self {
        ControlResponse::Outcome {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: UserMessage) -> Self {
        ControlResponse::Outcome {
            success: false,
            error: Some(error),
        }
    }
}

// ============================================================================
// Socket envelopes
// ============================================================================

/// A request as written on the socket; `id` is echoed on its response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ControlRequest,
}

/// A response as written on the socket
///
/// Requests are answered as they complete, so responses on one connection
/// may arrive out of order; clients pair them up by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub response: ControlResponse,
}

// ============================================================================
// Helpers for message framing
// ============================================================================

pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
