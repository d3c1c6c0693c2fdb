//! HTTP transport for the worker

pub mod controller_client;
pub mod server;

pub use controller_client::ControllerClient;
pub use server::{build_router, serve, REQUEST_ID_HEADER};
