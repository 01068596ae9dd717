// Session orchestration for the fact checker host
// Supervises the backend and capture client and relays backend events to the presentation layer

pub mod backend_client;
pub mod backoff;
pub mod capture;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod notify;
pub mod permissions;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod sse;
pub mod supervisor;

// Presentation bridge (Unix socket)
#[cfg(unix)]
pub mod host;
