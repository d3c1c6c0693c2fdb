//! LLM Ops Worker - Main Entry Point
//!
//! Loads configuration, connects to the inference engine, starts the HTTP
//! server and the heartbeat task, and shuts everything down on Ctrl-C.

use anyhow::Context;
use clap::Parser;
use llmops_common::LlmOpsConfig;
use llmops_worker::engine::RemoteEngine;
use llmops_worker::http::{self, ControllerClient};
use llmops_worker::{HeartbeatTask, ModelWorker};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line overrides, applied on top of file and environment config
#[derive(Parser, Debug)]
#[command(name = "llmops-worker", version, about = "LLM Ops model worker")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "LLMOPS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    worker_address: Option<String>,

    #[arg(long)]
    controller_address: Option<String>,

    #[arg(long)]
    model_path: Option<String>,

    /// Comma separated display names
    #[arg(long, value_delimiter = ',')]
    model_names: Option<Vec<String>>,

    #[arg(long)]
    limit_worker_concurrency: Option<usize>,

    #[arg(long)]
    no_register: bool,

    /// Conversation template name
    #[arg(long)]
    conv_template: Option<String>,

    /// Base URL of the OpenAI-compatible engine server
    #[arg(long)]
    engine_endpoint: Option<String>,
}

impl Args {
    fn apply(self, config: &mut LlmOpsConfig) {
        let worker = &mut config.worker;
        if let Some(host) = self.host {
            worker.host = host;
        }
        if let Some(port) = self.port {
            worker.port = port;
        }
        if let Some(address) = self.worker_address {
            worker.worker_address = address;
        }
        if let Some(address) = self.controller_address {
            worker.controller_address = address;
        }
        if let Some(path) = self.model_path {
            worker.model_path = path;
        }
        if let Some(names) = self.model_names {
            worker.model_names = names;
        }
        if let Some(limit) = self.limit_worker_concurrency {
            worker.limit_worker_concurrency = limit;
        }
        if self.no_register {
            worker.no_register = true;
        }
        if let Some(template) = self.conv_template {
            worker.conv_template = Some(template);
        }
        if let Some(endpoint) = self.engine_endpoint {
            config.engine.endpoint = endpoint;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LlmOpsConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "llmops_worker={},tower_http=info,axum=info",
                    config.observability.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LLM Ops Worker");
    info!(
        "Worker configuration loaded: bind={}:{}, model={}, capacity={}",
        config.worker.host,
        config.worker.port,
        config.worker.model_path,
        config.worker.limit_worker_concurrency
    );

    let engine = RemoteEngine::from_config(&config.worker, &config.engine)
        .context("failed to initialise inference engine")?;
    let worker = Arc::new(ModelWorker::new(&config.worker, Arc::new(engine))?);

    let addr: SocketAddr = (config.worker.host.as_str(), config.worker.port)
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("cannot resolve {}", config.worker.host))?;

    let shutdown = CancellationToken::new();

    let heartbeat_handle = if config.worker.no_register {
        info!("Registration disabled, not contacting controller");
        None
    } else {
        let client = ControllerClient::new(&config.worker.controller_address)?;
        let task = HeartbeatTask::new(
            worker.clone(),
            client,
            config.worker.heartbeat_interval(),
            config.worker.register_retry(),
        );
        Some(task.spawn(shutdown.child_token()))
    };

    let mut server_handle = tokio::spawn(http::serve(
        worker.clone(),
        addr,
        config.observability.enable_metrics,
        shutdown.child_token(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            shutdown.cancel();
            result??;
            anyhow::bail!("HTTP server exited unexpectedly");
        }
    }

    worker.shutdown();
    shutdown.cancel();

    if let Some(handle) = heartbeat_handle {
        if let Err(e) = handle.await {
            error!("Heartbeat task panicked: {}", e);
        }
    }
    server_handle.await??;

    info!("LLM Ops Worker shutdown complete");
    Ok(())
}
