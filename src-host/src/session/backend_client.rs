//! HTTP calls to the backend's health and stats endpoints.
//!
//! Both calls are best-effort: any transport error, non-success status or
//! unparsable body yields `None`.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Option<Value> {
        self.get_json("/health").await
    }

    pub async fn stats(&self) -> Option<Value> {
        self.get_json("/stats").await
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Backend request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Backend returned error status");
            return None;
        }

        match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!(url = %url, error = %e, "Backend returned invalid JSON");
                None
            }
        }
    }

    /// Poll `/health` until it answers or `attempts` run out
    pub async fn wait_until_healthy(&self, attempts: u32, interval: Duration) -> bool {
        for attempt in 1..=attempts {
            if self.health().await.is_some() {
                debug!(attempt, "Backend healthy");
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(attempts, "Backend health checks exhausted, continuing anyway");
        false
    }
}
