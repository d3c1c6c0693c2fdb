//! LLM Ops Worker
//!
//! Serves one inference engine behind a bounded admission gate. Requests are
//! streamed or run to completion, cancelled when their client goes away, and
//! the worker reports its load to a controller on a fixed interval.

pub mod admission;
pub mod engine;
pub mod heartbeat;
pub mod http;
pub mod lifecycle;
pub mod prompt;
pub mod sampling;
pub mod worker;

pub use admission::{AdmissionController, AdmissionPermit, SlotStats};
pub use engine::{EngineMetadata, EngineOutput, EngineStream, InferenceEngine, TokenCodec};
pub use heartbeat::HeartbeatTask;
pub use lifecycle::{AbortReason, ActiveRequests, CancelHandle, GenerationRequest, RequestState};
pub use prompt::{ConversationTemplate, PromptBuilder};
pub use sampling::SamplingConfig;
pub use worker::{ModelWorker, WorkerIdentity};
