//! Fire-and-forget webhook delivery to tenant endpoints.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use wagate_core::error::GatewayError;

#[derive(Clone)]
pub struct WebhookDispatcher {
    http: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout_secs: u64) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("webhook client init failed: {e}")))?;
        Ok(Self { http })
    }

    /// POST the payload once. Non-2xx counts as failure.
    pub async fn deliver(&self, url: &str, payload: &Value) -> Result<(), GatewayError> {
        let resp = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::Protocol(format!("webhook {url} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Protocol(format!(
                "webhook {url} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Deliver in the background. Failures are logged, never retried.
    pub fn dispatch(&self, url: String, payload: Value) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.deliver(&url, &payload).await {
                Ok(()) => debug!("webhook delivered to {url}"),
                Err(e) => warn!("{e}"),
            }
        });
    }
}
