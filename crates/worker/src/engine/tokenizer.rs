//! HuggingFace tokenizer backed [`TokenCodec`]

use super::TokenCodec;
use llmops_common::{LlmOpsError, Result};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{info, warn};

/// Spellings tried, in order, when no EOS token is configured
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|eot_id|>", "<|im_end|>", "<eos>"];

pub struct HfTokenCodec {
    tokenizer: Tokenizer,
    eos_token_id: Option<u32>,
}

impl HfTokenCodec {
    /// Load `tokenizer.json`
    pub fn from_file(path: &Path, eos_token: Option<&str>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            LlmOpsError::config(format!("Failed to load tokenizer {}: {}", path.display(), e))
        })?;
        info!("Loaded tokenizer from {}", path.display());
        Ok(Self::new(tokenizer, eos_token))
    }

    pub fn new(tokenizer: Tokenizer, eos_token: Option<&str>) -> Self {
        let eos_token_id = match eos_token {
            Some(token) => {
                let id = tokenizer.token_to_id(token);
                if id.is_none() {
                    warn!("Configured EOS token {:?} is not in the vocabulary", token);
                }
                id
            }
            None => EOS_CANDIDATES
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        };
        Self {
            tokenizer,
            eos_token_id,
        }
    }
}

impl TokenCodec for HfTokenCodec {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| LlmOpsError::validation(format!("Failed to tokenize input: {}", e)))?;
        Ok(encoding.get_ids().len())
    }

    fn decode_token(&self, token_id: u32) -> Result<String> {
        if self.tokenizer.id_to_token(token_id).is_none() {
            return Err(LlmOpsError::validation(format!(
                "Unknown stop token id {}",
                token_id
            )));
        }
        self.tokenizer
            .decode(&[token_id], false)
            .map_err(|e| LlmOpsError::validation(format!("Failed to decode token {}: {}", token_id, e)))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}
