use async_trait::async_trait;
use dflowcore::{Forwarder, InboundMessage, StoreError};
use tracing::{debug, warn};

/// Forwards messages to the owning machine's `/api/forward` endpoint.
pub struct HttpForwarder {
    client: reqwest::Client,
    scheme: String,
}

impl HttpForwarder {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            scheme: "http".to_string(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            scheme: "http".to_string(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn url(&self, machine: &str) -> String {
        format!("{}://{}/api/forward", self.scheme, machine)
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, machine: &str, message: &InboundMessage) -> Result<bool, StoreError> {
        let url = self.url(machine);
        debug!("POST {} for {}", url, message.trace_id());

        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("{} refused {}: {}", machine, message.trace_id(), status);
            return Ok(false);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to parse response: {}", e)))?;
        Ok(body.get("accepted").and_then(|v| v.as_bool()).unwrap_or(true))
    }
}
