//! Sampling configuration normalization
//!
//! Wire parameters arrive loosely typed and mostly optional. They are turned
//! into a validated [`SamplingConfig`] once, before admission, and treated as
//! read-only afterwards.

use crate::engine::TokenCodec;
use llmops_common::config::MAX_REQUEST_TIMEOUT_SECS;
use llmops_common::{LlmOpsError, Result};
use llmops_proto::{GenerateParams, StopSpec};
use std::collections::BTreeSet;
use std::time::Duration;

/// Smallest top-p handed to the engine, and the temperature below which
/// sampling is treated as greedy
pub const SAMPLING_EPSILON: f32 = 1e-5;

pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_TOP_P: f32 = 1.0;
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 256;

/// Engine-ready sampling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,

    /// Always in `[SAMPLING_EPSILON, 1.0]`
    pub top_p: f32,

    pub max_new_tokens: u32,

    /// Stop strings, including decoded stop tokens and EOS
    pub stop: BTreeSet<String>,

    /// Stop token ids as supplied, plus EOS when known
    pub stop_token_ids: BTreeSet<u32>,

    /// Prefix every output with the prompt
    pub echo: bool,

    /// Cancel the request once this much time has elapsed after admission
    pub deadline: Option<Duration>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            stop: BTreeSet::new(),
            stop_token_ids: BTreeSet::new(),
            echo: true,
            deadline: None,
        }
    }
}

impl SamplingConfig {
    /// Validate and clamp wire parameters
    ///
    /// `default_deadline` applies when the request carries no timeout.
    pub fn normalize(
        params: &GenerateParams,
        codec: &dyn TokenCodec,
        default_deadline: Option<Duration>,
    ) -> Result<Self> {
        let temperature = params.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(LlmOpsError::out_of_range(format!(
                "temperature must be a non-negative number, got {}",
                temperature
            )));
        }

        let top_p = params.top_p.unwrap_or(DEFAULT_TOP_P);
        if !top_p.is_finite() || top_p > 1.0 {
            return Err(LlmOpsError::out_of_range(format!(
                "top_p must be in (0, 1], got {}",
                top_p
            )));
        }
        let top_p = normalize_top_p(temperature, top_p);

        let max_new_tokens = params.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        if max_new_tokens == 0 {
            return Err(LlmOpsError::out_of_range("max_new_tokens must be at least 1"));
        }

        let mut stop = normalize_stop(params.stop.as_ref());
        let mut stop_token_ids: BTreeSet<u32> = params
            .stop_token_ids
            .iter()
            .flatten()
            .copied()
            .collect();
        if let Some(eos) = codec.eos_token_id() {
            stop_token_ids.insert(eos);
        }
        for &token_id in &stop_token_ids {
            let text = codec.decode_token(token_id)?;
            if !text.is_empty() {
                stop.insert(text);
            }
        }

        let deadline = match params.timeout_secs {
            Some(secs) if secs == 0 || secs > MAX_REQUEST_TIMEOUT_SECS => {
                return Err(LlmOpsError::out_of_range(format!(
                    "timeout_secs must be in 1..={}, got {}",
                    MAX_REQUEST_TIMEOUT_SECS, secs
                )));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default_deadline,
        };

        Ok(Self {
            temperature,
            top_p,
            max_new_tokens,
            stop,
            stop_token_ids,
            echo: params.echo.unwrap_or(true),
            deadline,
        })
    }
}

/// Floor top-p at epsilon; near-zero temperature makes nucleus sampling moot
pub fn normalize_top_p(temperature: f32, top_p: f32) -> f32 {
    if temperature <= SAMPLING_EPSILON {
        1.0
    } else {
        top_p.max(SAMPLING_EPSILON)
    }
}

/// Collapse absent, single and list stop specs into one set
pub fn normalize_stop(stop: Option<&StopSpec>) -> BTreeSet<String> {
    match stop {
        None => BTreeSet::new(),
        Some(StopSpec::One(s)) => std::iter::once(s.clone()).filter(|s| !s.is_empty()).collect(),
        Some(StopSpec::Many(list)) => list.iter().filter(|s| !s.is_empty()).cloned().collect(),
    }
}
