//! Configuration structures for LLM Ops
//!
//! This module defines the configuration for workers and the controller.
//! Values are layered: built-in defaults, then an optional YAML file, then
//! environment variables (`LLMOPS_<SECTION>__<KEY>`, e.g.
//! `LLMOPS_WORKER__LIMIT_WORKER_CONCURRENCY=16`). Binaries apply command-line
//! flags on top.

use crate::error::{LlmOpsError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest deadline a request may ask for (one day)
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for LLM Ops components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOpsConfig {
    /// Worker-specific configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Inference engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Controller-specific configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Server binding host
    #[serde(default = "default_worker_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_worker_port")]
    pub port: u16,

    /// Unique worker identifier (generated when absent)
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Address the controller hands out to clients
    #[serde(default = "default_worker_address")]
    pub worker_address: String,

    /// Controller base URL
    #[serde(default = "default_controller_address")]
    pub controller_address: String,

    /// Model weights path or hub id
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Display names; derived from the model path when empty
    #[serde(default)]
    pub model_names: Vec<String>,

    /// Maximum number of requests holding an admission slot
    #[serde(default = "default_limit_worker_concurrency")]
    pub limit_worker_concurrency: usize,

    /// Skip registration and heartbeats
    #[serde(default)]
    pub no_register: bool,

    /// Conversation template name override
    #[serde(default)]
    pub conv_template: Option<String>,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Interval between registration attempts in seconds
    #[serde(default = "default_register_retry")]
    pub register_retry_secs: u64,

    /// Deadline applied when a request does not carry its own
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible completion server
    #[serde(default = "default_engine_endpoint")]
    pub endpoint: String,

    /// Model name sent to the engine (defaults to the model path)
    #[serde(default)]
    pub model: Option<String>,

    /// Path to `tokenizer.json` (defaults to `<model_path>/tokenizer.json`)
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,

    /// Context window override; read from `<model_path>/config.json` otherwise
    #[serde(default)]
    pub context_length: Option<usize>,

    /// End-of-sequence token spelling override
    #[serde(default)]
    pub eos_token: Option<String>,

    /// Connect timeout for engine calls in seconds
    #[serde(default = "default_engine_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Controller-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Server binding host
    #[serde(default = "default_controller_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_controller_port")]
    pub port: u16,

    /// Workers silent for longer than this are removed
    #[serde(default = "default_heart_beat_expiration")]
    pub heart_beat_expiration_secs: u64,

    /// Worker selection policy
    #[serde(default)]
    pub dispatch_method: DispatchMethod,
}

/// Worker selection policy used by the controller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMethod {
    /// Lowest queue length relative to speed
    #[default]
    ShortestQueue,

    /// Random choice weighted by speed
    Lottery,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose Prometheus metrics on `/metrics`
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_worker_host() -> String {
    "localhost".to_string()
}

fn default_worker_port() -> u16 {
    21002
}

fn default_worker_address() -> String {
    "http://localhost:21002".to_string()
}

fn default_controller_address() -> String {
    "http://localhost:21001".to_string()
}

fn default_model_path() -> String {
    "lmsys/vicuna-7b-v1.3".to_string()
}

fn default_limit_worker_concurrency() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    45
}

fn default_register_retry() -> u64 {
    5
}

fn default_engine_endpoint() -> String {
    "http://localhost:8000".to_string()
}

fn default_engine_connect_timeout() -> u64 {
    10
}

fn default_controller_host() -> String {
    "localhost".to_string()
}

fn default_controller_port() -> u16 {
    21001
}

fn default_heart_beat_expiration() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: default_worker_host(),
            port: default_worker_port(),
            worker_id: None,
            worker_address: default_worker_address(),
            controller_address: default_controller_address(),
            model_path: default_model_path(),
            model_names: Vec::new(),
            limit_worker_concurrency: default_limit_worker_concurrency(),
            no_register: false,
            conv_template: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            register_retry_secs: default_register_retry(),
            request_timeout_secs: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_engine_endpoint(),
            model: None,
            tokenizer_path: None,
            context_length: None,
            eos_token: None,
            connect_timeout_secs: default_engine_connect_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_controller_host(),
            port: default_controller_port(),
            heart_beat_expiration_secs: default_heart_beat_expiration(),
            dispatch_method: DispatchMethod::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl LlmOpsConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(LlmOpsError::Config(format!(
                    "Config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("LLMOPS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("worker.model_names"),
        );

        let config: LlmOpsConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.limit_worker_concurrency == 0 {
            return Err(LlmOpsError::config("limit_worker_concurrency must be at least 1"));
        }
        if self.worker.heartbeat_interval_secs == 0 {
            return Err(LlmOpsError::config("heartbeat_interval_secs must be positive"));
        }
        if self.worker.register_retry_secs == 0 {
            return Err(LlmOpsError::config("register_retry_secs must be positive"));
        }
        if self.worker.model_path.trim().is_empty() {
            return Err(LlmOpsError::config("model_path must not be empty"));
        }
        if let Some(secs) = self.worker.request_timeout_secs {
            if secs == 0 || secs > MAX_REQUEST_TIMEOUT_SECS {
                return Err(LlmOpsError::config(format!(
                    "request_timeout_secs must be in 1..={}",
                    MAX_REQUEST_TIMEOUT_SECS
                )));
            }
        }
        if self.controller.heart_beat_expiration_secs == 0 {
            return Err(LlmOpsError::config("heart_beat_expiration_secs must be positive"));
        }
        Ok(())
    }
}

impl WorkerConfig {
    /// Display names, falling back to the last path segment of the model
    pub fn resolved_model_names(&self) -> Vec<String> {
        if !self.model_names.is_empty() {
            return self.model_names.clone();
        }
        let trimmed = self.model_path.trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
        vec![name.to_string()]
    }

    /// Heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Registration retry interval as Duration
    pub fn register_retry(&self) -> Duration {
        Duration::from_secs(self.register_retry_secs)
    }

    /// Default request deadline as Duration
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl ControllerConfig {
    /// Heartbeat expiration as Duration
    pub fn heart_beat_expiration(&self) -> Duration {
        Duration::from_secs(self.heart_beat_expiration_secs)
    }
}
