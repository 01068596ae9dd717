// OS media permissions the capture pipeline depends on
// macOS screen access is probed through CoreGraphics; other platforms have no gate

use anyhow::Result;
use tracing::debug;

use crate::session::error::SessionError;
use crate::session::protocol::{MediaAccess, PermissionKind, PermissionReport, SourceType};

/// Boundary to the platform permission APIs
pub trait PermissionProbe: Send + Sync {
    fn check(&self) -> PermissionReport;

    /// Ask for microphone access; returns whether it is usable afterwards
    fn request_microphone(&self) -> Result<bool>;

    /// Open the privacy pane for `kind`
    fn open_settings(&self, kind: PermissionKind) -> Result<()>;
}

/// Permissions a source needs before the capture client may start
pub fn required_for(source: SourceType) -> &'static [PermissionKind] {
    match source {
        // Call audio includes the local microphone
        SourceType::Meet => &[PermissionKind::Microphone, PermissionKind::Screen],
        // System audio tap
        SourceType::Youtube | SourceType::Stream => &[PermissionKind::Screen],
        SourceType::Local => &[],
    }
}

/// Fail closed on any required permission that is neither granted nor unknown
pub fn verify(probe: &dyn PermissionProbe, source: SourceType) -> Result<(), SessionError> {
    let report = probe.check();
    for kind in required_for(source) {
        let access = match kind {
            PermissionKind::Microphone => report.microphone,
            PermissionKind::Screen => report.screen,
        };
        if !access.permits_capture() {
            debug!(kind = %kind, ?access, "Required permission missing");
            return Err(SessionError::PermissionDenied(*kind));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPermissions;

#[cfg(target_os = "macos")]
mod macos {
    #[link(name = "CoreGraphics", kind = "framework")]
    extern "C" {
        pub fn CGPreflightScreenCaptureAccess() -> bool;
    }

    pub const MICROPHONE_PANE: &str =
        "x-apple.systempreferences:com.apple.preference.security?Privacy_Microphone";
    pub const SCREEN_PANE: &str =
        "x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenCapture";
}

#[cfg(target_os = "macos")]
impl PermissionProbe for SystemPermissions {
    fn check(&self) -> PermissionReport {
        let screen = if unsafe { macos::CGPreflightScreenCaptureAccess() } {
            MediaAccess::Granted
        } else {
            MediaAccess::Denied
        };
        PermissionReport {
            // Microphone status needs AVFoundation; the capture client prompts on first use
            microphone: MediaAccess::Unknown,
            screen,
        }
    }

    fn request_microphone(&self) -> Result<bool> {
        Ok(self.check().microphone.permits_capture())
    }

    fn open_settings(&self, kind: PermissionKind) -> Result<()> {
        use anyhow::Context;

        let pane = match kind {
            PermissionKind::Microphone => macos::MICROPHONE_PANE,
            PermissionKind::Screen => macos::SCREEN_PANE,
        };
        std::process::Command::new("open")
            .arg(pane)
            .spawn()
            .with_context(|| format!("Failed to open {} settings", kind))?;
        Ok(())
    }
}

#[cfg(not(target_os = "macos"))]
impl PermissionProbe for SystemPermissions {
    fn check(&self) -> PermissionReport {
        PermissionReport {
            microphone: MediaAccess::Granted,
            screen: MediaAccess::Granted,
        }
    }

    fn request_microphone(&self) -> Result<bool> {
        Ok(true)
    }

    fn open_settings(&self, kind: PermissionKind) -> Result<()> {
        debug!(kind = %kind, "No privacy settings pane on this platform");
        Ok(())
    }
}
