//! LLM Ops Controller
//!
//! Keeps the registry of live workers and hands out worker addresses per
//! model.

pub mod registry;
pub mod server;
pub mod worker_client;

pub use registry::{Registry, WorkerInfo};
pub use worker_client::WorkerClient;
