//! Model worker facade
//!
//! Composes prompt building, sampling normalization, admission and the
//! request lifecycle behind the operations the transport exposes.

use crate::admission::{AdmissionController, SlotStats};
use crate::engine::InferenceEngine;
use crate::lifecycle::{AbortReason, ActiveRequests, GenerationRequest};
use crate::prompt::PromptBuilder;
use crate::sampling::SamplingConfig;
use llmops_common::config::WorkerConfig;
use llmops_common::{LlmOpsError, Result, METRICS};
use llmops_proto::{
    ConvTemplateInfo, GenerateParams, HeartbeatRecord, ModelDetails, StreamUnit, WorkerStatus,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Relative speed reported to the controller
const WORKER_SPEED: u32 = 1;

/// How this worker is known to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub worker_address: String,
    pub model_names: Vec<String>,
}

pub struct ModelWorker {
    identity: WorkerIdentity,
    engine: Arc<dyn InferenceEngine>,
    prompts: PromptBuilder,
    admission: AdmissionController,
    active: Arc<ActiveRequests>,
    default_deadline: Option<Duration>,
}

impl ModelWorker {
    pub fn new(config: &WorkerConfig, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());

        let identity = WorkerIdentity {
            worker_id,
            worker_address: config.worker_address.clone(),
            model_names: config.resolved_model_names(),
        };
        let prompts = PromptBuilder::new(config.conv_template.as_deref(), &config.model_path)?;
        let admission = AdmissionController::new(config.limit_worker_concurrency)?;

        info!(
            "Loading the model {:?} on worker {}, worker type: remote engine, capacity {}",
            identity.model_names, identity.worker_id, config.limit_worker_concurrency
        );

        Ok(Self {
            identity,
            engine,
            prompts,
            admission,
            active: Arc::new(ActiveRequests::new()),
            default_deadline: config.request_timeout(),
        })
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Validate a request and wait for a slot
    ///
    /// Validation failures are returned before any slot is taken.
    pub async fn admit(&self, params: &GenerateParams) -> Result<GenerationRequest> {
        let (prompt, config) = match self.prepare(params) {
            Ok(prepared) => prepared,
            Err(e) => {
                METRICS.worker.requests_rejected.inc();
                debug!("Rejected request: {}", e);
                return Err(e);
            }
        };

        let permit = self.admission.acquire().await?;
        Ok(GenerationRequest::admit(
            self.engine.clone(),
            prompt,
            config,
            permit,
            self.active.clone(),
        ))
    }

    /// Admit a request whose outputs the caller will consume unit by unit
    pub async fn generate_stream(&self, params: &GenerateParams) -> Result<GenerationRequest> {
        self.admit(params).await
    }

    /// Run a request to completion and return the final unit
    pub async fn generate(&self, params: &GenerateParams) -> Result<StreamUnit> {
        self.admit(params).await?.run_to_completion().await
    }

    pub fn count_token(&self, text: &str) -> Result<usize> {
        self.engine.codec().count_tokens(text)
    }

    pub fn status(&self) -> WorkerStatus {
        let stats = self.admission.stats();
        WorkerStatus {
            model_names: self.identity.model_names.clone(),
            speed: WORKER_SPEED,
            queue_length: stats.load + stats.waiting,
            capacity: stats.capacity,
            current_load: stats.load,
        }
    }

    pub fn slot_stats(&self) -> SlotStats {
        self.admission.stats()
    }

    pub fn model_details(&self) -> ModelDetails {
        ModelDetails {
            context_length: self.engine.metadata().context_length,
        }
    }

    pub fn conv_template(&self) -> ConvTemplateInfo {
        self.prompts.default_template().info()
    }

    /// Cancel an in-flight request on behalf of its client
    pub fn abort(&self, request_id: &str) -> bool {
        let aborted = self.active.cancel(request_id, AbortReason::Client);
        if aborted {
            info!(request_id = %request_id, "Abort requested");
        }
        aborted
    }

    /// Reject new work and abort everything in flight
    pub fn shutdown(&self) {
        self.admission.close();
        let aborted = self.active.cancel_all(AbortReason::Shutdown);
        if aborted > 0 {
            warn!("Aborted {} in-flight requests on shutdown", aborted);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.admission.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Snapshot for the next heartbeat; never waits on admission
    pub fn heartbeat_record(&self) -> HeartbeatRecord {
        let stats = self.admission.stats();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        HeartbeatRecord {
            worker_name: self.identity.worker_address.clone(),
            worker_id: self.identity.worker_id.clone(),
            timestamp_ms,
            current_load: stats.load,
            capacity: stats.capacity,
            queue_length: stats.load + stats.waiting,
        }
    }

    fn prepare(&self, params: &GenerateParams) -> Result<(String, SamplingConfig)> {
        let prompt = self.prompts.build(params)?;
        let codec = self.engine.codec();
        let config = SamplingConfig::normalize(params, codec, self.default_deadline)?;

        let context_length = self.engine.metadata().context_length;
        let prompt_tokens = codec.count_tokens(&prompt)?;
        if prompt_tokens + config.max_new_tokens as usize > context_length {
            return Err(LlmOpsError::ContextOverflow(format!(
                "This model's maximum context length is {} tokens. However, you requested {} \
                 tokens ({} in the messages, {} in the completion). Please reduce the length \
                 of the messages or completion.",
                context_length,
                prompt_tokens + config.max_new_tokens as usize,
                prompt_tokens,
                config.max_new_tokens
            )));
        }

        Ok((prompt, config))
    }
}
