// Shared helpers for integration tests; each test crate uses a subset
#![allow(dead_code)]

pub mod fake_backend;
pub mod host_guard;
pub mod scripts;
