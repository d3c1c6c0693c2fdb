//! LLM Ops wire protocol
//!
//! Serde types exchanged between workers, the controller and clients.
//! Streaming responses are framed with [`framing`].

pub mod framing;

use serde::{Deserialize, Serialize};

pub use framing::{decode_frames, encode_frame, FrameDecoder, FramingError, FRAME_DELIMITER};

/// Request identifier, assigned by the worker at admission time
pub type RequestId = String;

/// Numeric error codes carried in `error_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ValidationError = 40001,
    ParamOutOfRange = 40302,
    ContextOverflow = 40303,
    /// The client cancelled its own request
    ClientCancelled = 49900,
    InternalError = 50001,
    AbortedByServer = 50002,
    Timeout = 50003,
    Shutdown = 50004,
    ControllerNoWorker = 50005,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

// Generation types

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
    /// Any other role is accepted and skipped when building the prompt
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn human(text: impl Into<String>) -> Self {
        Self { role: Role::Human, text: text.into() }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self { role: Role::Ai, text: text.into() }
    }
}

/// Stop strings: absent, a single string, or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

/// Body of `worker_generate` and `worker_generate_stream`
///
/// Every sampling field is optional; defaults are applied by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Model identifier used to pick a conversation template
    #[serde(default)]
    pub model_identifier: String,

    /// Replaces the template's default system message when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Pre-rendered prompt; bypasses the conversation template when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_token_ids: Option<Vec<u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,

    /// Deadline for the whole generation, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Token accounting; fields the engine does not report are omitted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<usize>,
}

/// One self-describing generation unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUnit {
    pub text: String,
    pub error_code: i32,
    #[serde(default)]
    pub usage: Usage,
}

impl StreamUnit {
    pub fn ok(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            error_code: ErrorCode::Ok.as_i32(),
            usage,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            error_code: code.as_i32(),
            usage: Usage::default(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokenRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTokenResponse {
    pub count: usize,
    pub error_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    /// False when no in-flight request had this id
    pub aborted: bool,
}

// Worker introspection

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub model_names: Vec<String>,
    pub speed: u32,
    /// Requests holding a slot plus requests waiting for one
    pub queue_length: usize,
    pub capacity: usize,
    pub current_load: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    pub context_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvTemplateInfo {
    pub name: String,
    pub system_template: String,
    pub roles: (String, String),
    pub sep: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sep2: Option<String>,
}

// Controller types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Address the controller should hand out for this worker
    pub worker_name: String,
    pub check_heart_beat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_status: Option<WorkerStatus>,
}

/// Periodic liveness and load report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub worker_name: String,
    pub worker_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub current_load: usize,
    pub capacity: usize,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// False when the controller no longer knows the worker
    pub exist: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAddressRequest {
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerAddressResponse {
    /// Base URL of the chosen worker; a model nobody serves is answered
    /// with a `ControllerNoWorker` error instead
    pub address: String,
}
