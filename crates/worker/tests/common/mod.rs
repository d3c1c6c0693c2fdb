//! Shared test support: a deterministic engine that records what the worker
//! asks of it.

#![allow(dead_code)]

use async_trait::async_trait;
use llmops_common::config::WorkerConfig;
use llmops_common::{LlmOpsError, Result};
use llmops_proto::GenerateParams;
use llmops_worker::engine::{EngineMetadata, EngineOutput, EngineStream, InferenceEngine, TokenCodec};
use llmops_worker::{ModelWorker, SamplingConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Prompts containing this marker fail after their first output
pub const FAIL_MARKER: &str = "[fail]";

/// Whitespace tokenizer with `</s>` as token 2
pub struct WordCodec;

impl TokenCodec for WordCodec {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(text.split_whitespace().count())
    }

    fn decode_token(&self, token_id: u32) -> Result<String> {
        match token_id {
            2 => Ok("</s>".to_string()),
            other => Err(LlmOpsError::validation(format!("unknown token id {}", other))),
        }
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(2)
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: String,
    pub prompt: String,
    pub at: Instant,
}

#[derive(Default)]
struct Record {
    submissions: Mutex<Vec<Submission>>,
    aborts: Mutex<Vec<String>>,
    ended: Mutex<Vec<(String, Instant)>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Engine producing a fixed list of tokens, one per `step`
pub struct ScriptedEngine {
    metadata: EngineMetadata,
    codec: WordCodec,
    tokens: Vec<String>,
    step: Duration,
    /// `submit` never resolves
    hang_on_submit: bool,
    record: Arc<Record>,
}

impl ScriptedEngine {
    pub fn new(tokens: &[&str], step: Duration) -> Self {
        Self {
            metadata: EngineMetadata {
                model_name: "scripted".to_string(),
                context_length: 4096,
            },
            codec: WordCodec,
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            step,
            hang_on_submit: false,
            record: Arc::new(Record::default()),
        }
    }

    /// Engine that accepts submissions but never answers them
    pub fn unresponsive() -> Self {
        Self {
            hang_on_submit: true,
            ..Self::five_tokens()
        }
    }

    /// Five tokens, short pause between each
    pub fn five_tokens() -> Self {
        Self::new(&["The", " quick", " brown", " fox", " jumps"], Duration::from_millis(5))
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.record.submissions.lock().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.record.aborts.lock().clone()
    }

    /// When each request's output stream stopped, by request id
    pub fn ended(&self) -> Vec<(String, Instant)> {
        self.record.ended.lock().clone()
    }

    /// Highest number of output streams alive at once
    pub fn peak_running(&self) -> usize {
        self.record.peak_running.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.record.running.load(Ordering::SeqCst)
    }
}

/// Marks a submission's output stream as gone
struct RunningGuard {
    request_id: String,
    record: Arc<Record>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.record.running.fetch_sub(1, Ordering::SeqCst);
        self.record
            .ended
            .lock()
            .push((self.request_id.clone(), Instant::now()));
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    fn codec(&self) -> &dyn TokenCodec {
        &self.codec
    }

    async fn submit(
        &self,
        request_id: &str,
        prompt: &str,
        config: &SamplingConfig,
    ) -> Result<EngineStream> {
        self.record.submissions.lock().push(Submission {
            request_id: request_id.to_string(),
            prompt: prompt.to_string(),
            at: Instant::now(),
        });
        if self.hang_on_submit {
            futures::future::pending::<()>().await;
        }
        let running = self.record.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.record.peak_running.fetch_max(running, Ordering::SeqCst);

        let guard = RunningGuard {
            request_id: request_id.to_string(),
            record: self.record.clone(),
        };
        let tokens: Vec<String> = self
            .tokens
            .iter()
            .take(config.max_new_tokens as usize)
            .cloned()
            .collect();
        let fail = prompt.contains(FAIL_MARKER);
        let step = self.step;
        let prompt_tokens = prompt.split_whitespace().count();

        let stream = async_stream::try_stream! {
            let _guard = guard;
            let mut text = String::new();
            for (i, token) in tokens.iter().enumerate() {
                tokio::time::sleep(step).await;
                if fail && i == 1 {
                    Err::<(), _>(LlmOpsError::engine("scripted failure"))?;
                }
                text.push_str(token);
                yield EngineOutput {
                    text: text.clone(),
                    prompt_tokens: Some(prompt_tokens),
                    completion_tokens: Some(i + 1),
                };
            }
        };
        Ok(Box::pin(stream))
    }

    fn abort(&self, request_id: &str) {
        self.record.aborts.lock().push(request_id.to_string());
    }
}

pub fn worker_config(capacity: usize) -> WorkerConfig {
    WorkerConfig {
        worker_id: Some("test0001".to_string()),
        model_path: "models/vicuna-7b".to_string(),
        limit_worker_concurrency: capacity,
        no_register: true,
        ..Default::default()
    }
}

pub fn worker_with(engine: Arc<ScriptedEngine>, capacity: usize) -> Arc<ModelWorker> {
    Arc::new(ModelWorker::new(&worker_config(capacity), engine).unwrap())
}

/// Deterministic raw-prompt request without echo
pub fn greedy(prompt: &str) -> GenerateParams {
    GenerateParams {
        prompt: Some(prompt.to_string()),
        temperature: Some(0.0),
        echo: Some(false),
        ..Default::default()
    }
}
