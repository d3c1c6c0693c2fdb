//! LLM Ops common library
//!
//! This crate contains shared code used by the worker and the controller.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::LlmOpsConfig;
pub use error::{LlmOpsError, Result};
pub use metrics::{MetricsRegistry, METRICS};
