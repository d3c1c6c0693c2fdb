//! Engine backend driving an OpenAI-compatible completion server
//!
//! Generation is delegated to a server such as vLLM's OpenAI entrypoint
//! running next to the worker. Each submission opens one streaming
//! `/v1/completions` call; aborting a request drops that connection, which
//! the server treats as a cancellation.

use super::{
    read_context_length, EngineMetadata, EngineOutput, EngineStream, HfTokenCodec,
    InferenceEngine, TokenCodec,
};
use crate::sampling::SamplingConfig;
use async_trait::async_trait;
use futures::StreamExt;
use llmops_common::config::{EngineConfig, WorkerConfig};
use llmops_common::{LlmOpsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct RemoteEngine {
    client: reqwest::Client,
    completions_url: String,
    metadata: EngineMetadata,
    codec: Arc<dyn TokenCodec>,
    in_flight: InFlight,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stop: Vec<&'a str>,
    stop_token_ids: Vec<u32>,
    n: u32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

impl RemoteEngine {
    /// Build from configuration, loading the tokenizer from disk
    pub fn from_config(worker: &WorkerConfig, engine: &EngineConfig) -> Result<Self> {
        let model_dir = Path::new(&worker.model_path);
        let tokenizer_path = engine
            .tokenizer_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&worker.model_path).join("tokenizer.json"));
        let codec = HfTokenCodec::from_file(&tokenizer_path, engine.eos_token.as_deref())?;

        let metadata = EngineMetadata {
            model_name: engine.model.clone().unwrap_or_else(|| worker.model_path.clone()),
            context_length: engine
                .context_length
                .unwrap_or_else(|| read_context_length(model_dir)),
        };

        Self::new(
            &engine.endpoint,
            metadata,
            Arc::new(codec),
            Duration::from_secs(engine.connect_timeout_secs),
        )
    }

    pub fn new(
        endpoint: &str,
        metadata: EngineMetadata,
        codec: Arc<dyn TokenCodec>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| LlmOpsError::config(format!("Failed to build engine client: {}", e)))?;

        info!(
            "Remote engine at {} serving {} (context length {})",
            endpoint, metadata.model_name, metadata.context_length
        );

        Ok(Self {
            client,
            completions_url: format!("{}/v1/completions", endpoint.trim_end_matches('/')),
            metadata,
            codec,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Requests the engine is still producing
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Removes a request from the in-flight map however the stream ends
struct InFlightGuard {
    in_flight: InFlight,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.request_id);
    }
}

#[async_trait]
impl InferenceEngine for RemoteEngine {
    fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    fn codec(&self) -> &dyn TokenCodec {
        self.codec.as_ref()
    }

    async fn submit(
        &self,
        request_id: &str,
        prompt: &str,
        config: &SamplingConfig,
    ) -> Result<EngineStream> {
        let token = CancellationToken::new();
        self.in_flight
            .lock()
            .insert(request_id.to_string(), token.clone());
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            request_id: request_id.to_string(),
        };

        let body = CompletionRequest {
            model: &self.metadata.model_name,
            prompt,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_new_tokens,
            stop: config.stop.iter().map(String::as_str).collect(),
            stop_token_ids: config.stop_token_ids.iter().copied().collect(),
            n: 1,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        debug!(request_id = %request_id, "Submitting to {}", self.completions_url);

        let response = self
            .client
            .post(&self.completions_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmOpsError::engine(format!("Engine unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmOpsError::engine(format!(
                "Engine returned {}: {}",
                status, detail
            )));
        }

        let cancelled = token.clone();
        let mut bytes = Box::pin(
            response
                .bytes_stream()
                .take_until(async move { cancelled.cancelled().await }),
        );

        let stream = async_stream::try_stream! {
            let _guard = guard;
            let mut lines = SseLineBuffer::default();
            let mut text = String::new();
            // Held back one chunk so a trailing usage-only chunk can be
            // attached without emitting a duplicate output
            let mut pending: Option<EngineOutput> = None;

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| LlmOpsError::engine(format!("Engine stream interrupted: {}", e)))?;

                for event in lines.push(&chunk) {
                    let data = match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Data(data) => data,
                    };
                    let parsed: CompletionChunk = serde_json::from_str(&data)
                        .map_err(|e| LlmOpsError::engine(format!("Malformed engine chunk: {}", e)))?;

                    if let Some(usage) = parsed.usage {
                        if let Some(last) = pending.as_mut() {
                            last.prompt_tokens = Some(usage.prompt_tokens);
                            last.completion_tokens = Some(usage.completion_tokens);
                        }
                    }

                    let delta: String = parsed.choices.iter().map(|c| c.text.as_str()).collect();
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    if let Some(ready) = pending.replace(EngineOutput {
                        text: text.clone(),
                        prompt_tokens: None,
                        completion_tokens: None,
                    }) {
                        yield ready;
                    }
                }
            }

            if let Some(last) = pending {
                yield last;
            }
        };

        Ok(Box::pin(stream))
    }

    fn abort(&self, request_id: &str) {
        if let Some(token) = self.in_flight.lock().get(request_id) {
            debug!(request_id = %request_id, "Aborting engine request");
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent-event byte stream into `data:` payloads
#[derive(Debug, Default)]
struct SseLineBuffer {
    partial: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim_start();
                if payload == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !payload.is_empty() {
                    events.push(SseEvent::Data(payload.to_string()));
                }
            }
        }
        events
    }
}
