//! Inference engine interface
//!
//! The worker treats the engine as an external collaborator: it submits a
//! prompt under a request id, consumes a lazy in-order sequence of cumulative
//! outputs, and may abort the request id at any time.

pub mod remote;
pub mod tokenizer;

pub use remote::RemoteEngine;
pub use tokenizer::HfTokenCodec;

use crate::sampling::SamplingConfig;
use async_trait::async_trait;
use futures::stream::BoxStream;
use llmops_common::Result;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Context window used when the model config names none
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

/// One partial output; `text` is cumulative, not a delta
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub text: String,
    pub prompt_tokens: Option<usize>,
    pub completion_tokens: Option<usize>,
}

/// Outputs of one submission, in generation order
pub type EngineStream = BoxStream<'static, Result<EngineOutput>>;

/// Static facts about the loaded model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMetadata {
    pub model_name: String,
    pub context_length: usize,
}

/// Tokenizer operations the worker needs
pub trait TokenCodec: Send + Sync {
    /// Number of tokens in `text`, special tokens included
    fn count_tokens(&self, text: &str) -> Result<usize>;

    /// String form of one token id
    fn decode_token(&self, token_id: u32) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn metadata(&self) -> &EngineMetadata;

    fn codec(&self) -> &dyn TokenCodec;

    /// Start generating; each submission is single-use
    async fn submit(
        &self,
        request_id: &str,
        prompt: &str,
        config: &SamplingConfig,
    ) -> Result<EngineStream>;

    /// Abandon a request id
    ///
    /// Must not block, and must be a no-op for unknown or finished ids.
    fn abort(&self, request_id: &str);
}

const SEQUENCE_LENGTH_KEYS: &[&str] = &[
    "max_sequence_length",
    "seq_length",
    "max_position_embeddings",
    "max_seq_len",
    "model_max_length",
];

/// Context window from a HuggingFace `config.json` value
pub fn context_length_from_config(config: &Value) -> usize {
    let rope_factor = config
        .get("rope_scaling")
        .and_then(|r| r.get("factor"))
        .and_then(Value::as_f64)
        .unwrap_or(1.0);

    SEQUENCE_LENGTH_KEYS
        .iter()
        .find_map(|key| config.get(*key).and_then(Value::as_u64))
        .map(|len| (rope_factor * len as f64) as usize)
        .unwrap_or(DEFAULT_CONTEXT_LENGTH)
}

/// Read the context window from `<model_dir>/config.json`
pub fn read_context_length(model_dir: &Path) -> usize {
    let path = model_dir.join("config.json");
    let parsed = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

    match parsed {
        Some(config) => context_length_from_config(&config),
        None => {
            debug!(
                "No readable {}, using default context length {}",
                path.display(),
                DEFAULT_CONTEXT_LENGTH
            );
            DEFAULT_CONTEXT_LENGTH
        }
    }
}
