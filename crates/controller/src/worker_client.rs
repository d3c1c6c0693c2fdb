//! Client for calls from the controller to workers

use llmops_common::{LlmOpsError, Result};
use llmops_proto::WorkerStatus;
use std::time::Duration;

/// Timeout for status polls
pub const WORKER_API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
}

impl WorkerClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WORKER_API_TIMEOUT)
            .build()
            .map_err(|e| LlmOpsError::config(format!("Failed to build worker client: {}", e)))?;
        Ok(Self { client })
    }

    /// Poll `/worker_status` on the worker at `worker_name`
    pub async fn status(&self, worker_name: &str) -> Result<WorkerStatus> {
        let url = format!("{}/worker_status", worker_name.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| LlmOpsError::Connection(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(LlmOpsError::Connection(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
