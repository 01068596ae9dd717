// Control-surface dispatcher
// Maps presentation requests onto controller operations and never lets a raw error escape

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::session::controller::SessionController;
use crate::session::error::SessionError;
use crate::session::protocol::{ControlRequest, ControlResponse, UserMessage};

pub struct ControlSurface {
    controller: Arc<SessionController>,
    /// Set once shutdown begins; no new operations are accepted after that
    deregistered: AtomicBool,
}

impl ControlSurface {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self {
            controller,
            deregistered: AtomicBool::new(false),
        }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn deregister(&self) {
        self.deregistered.store(true, Ordering::SeqCst);
    }

    pub fn is_deregistered(&self) -> bool {
        self.deregistered.load(Ordering::SeqCst)
    }

    /// Handle one request. `Quit` is answered here but acted on by the host.
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        if self.is_deregistered() {
            debug!(?request, "Rejecting request during shutdown");
            return match request {
                ControlRequest::Quit => ControlResponse::ShuttingDown,
                _ => ControlResponse::failure(SessionError::ShuttingDown.user_message()),
            };
        }

        let controller = &self.controller;
        match request {
            ControlRequest::Ping => ControlResponse::Pong,

            ControlRequest::CheckPermissions => {
                let report = controller.permissions().check();
                ControlResponse::Permissions {
                    microphone: report.microphone,
                    screen: report.screen,
                }
            }

            ControlRequest::RequestMicPermission => {
                match controller.permissions().request_microphone() {
                    Ok(granted) => ControlResponse::MicPermission {
                        granted,
                        error: None,
                    },
                    Err(e) => {
                        warn!(error = ?e, "Microphone permission request failed");
                        ControlResponse::MicPermission {
                            granted: false,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }

            ControlRequest::OpenSystemSettings { kind } => {
                match controller.permissions().open_settings(kind) {
                    Ok(()) => ControlResponse::success(),
                    Err(e) => {
                        warn!(error = ?e, kind = %kind, "Failed to open system settings");
                        ControlResponse::failure(UserMessage::new(
                            "Could Not Open Settings",
                            format!(
                                "Open System Settings > Privacy & Security > {} manually.",
                                kind
                            ),
                        ))
                    }
                }
            }

            ControlRequest::StartSession {
                source_type,
                target,
            } => outcome(controller.start(&source_type, &target).await),

            ControlRequest::StopSession => outcome(controller.stop().await),

            ControlRequest::PauseSession => {
                controller.pause();
                ControlResponse::success()
            }

            ControlRequest::ResumeSession => {
                controller.resume().await;
                ControlResponse::success()
            }

            ControlRequest::GetStats => ControlResponse::Stats {
                stats: controller.backend().stats().await,
            },

            ControlRequest::CheckHealth => ControlResponse::Health {
                health: controller.backend().health().await,
            },

            ControlRequest::GetSessionState => ControlResponse::SessionState {
                state: controller.query_state(),
            },

            ControlRequest::Quit => ControlResponse::ShuttingDown,
        }
    }
}

fn outcome(result: Result<(), SessionError>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::success(),
        Err(err) => ControlResponse::failure(err.user_message()),
    }
}
