//! Client for the controller's registration API

use llmops_common::{LlmOpsError, Result};
use llmops_proto::{HeartbeatRecord, HeartbeatResponse, RegisterWorkerRequest};
use std::time::Duration;
use tracing::debug;

/// Per-call timeout for controller requests
pub const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControllerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CONTROLLER_TIMEOUT)
            .build()
            .map_err(|e| LlmOpsError::config(format!("Failed to build controller client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register (or re-register) this worker
    pub async fn register(&self, request: &RegisterWorkerRequest) -> Result<()> {
        let url = format!("{}/register_worker", self.base_url);
        debug!("Registering {} at {}", request.worker_name, url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmOpsError::Connection(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(LlmOpsError::controller(format!(
                "register_worker returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Send one heartbeat; the response says whether the controller still
    /// knows this worker
    pub async fn heartbeat(&self, record: &HeartbeatRecord) -> Result<HeartbeatResponse> {
        let url = format!("{}/receive_heart_beat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| LlmOpsError::Connection(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(LlmOpsError::controller(format!(
                "receive_heart_beat returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
