//! LLM Ops Controller - Main Entry Point
//!
//! Starts the registry HTTP server and the heartbeat expiry task.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use llmops_common::config::DispatchMethod;
use llmops_common::LlmOpsConfig;
use llmops_controller::{server, Registry};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DispatchArg {
    ShortestQueue,
    Lottery,
}

impl From<DispatchArg> for DispatchMethod {
    fn from(arg: DispatchArg) -> Self {
        match arg {
            DispatchArg::ShortestQueue => DispatchMethod::ShortestQueue,
            DispatchArg::Lottery => DispatchMethod::Lottery,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "llmops-controller", version, about = "LLM Ops worker controller")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "LLMOPS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    dispatch_method: Option<DispatchArg>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LlmOpsConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.controller.host = host;
    }
    if let Some(port) = args.port {
        config.controller.port = port;
    }
    if let Some(method) = args.dispatch_method {
        config.controller.dispatch_method = method.into();
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "llmops_controller={},tower_http=info,axum=info",
                    config.observability.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LLM Ops Controller");
    info!(
        "Controller configuration loaded: bind={}:{}, dispatch={:?}, expiration={}s",
        config.controller.host,
        config.controller.port,
        config.controller.dispatch_method,
        config.controller.heart_beat_expiration_secs
    );

    let registry = Arc::new(Registry::new(&config.controller)?);
    let expiry_handle = registry.clone().start_expiry_task();

    let addr: SocketAddr = (config.controller.host.as_str(), config.controller.port)
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("cannot resolve {}", config.controller.host))?;

    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server::serve(
        registry,
        addr,
        config.observability.enable_metrics,
        shutdown.clone(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            expiry_handle.abort();
            result??;
            anyhow::bail!("HTTP server exited unexpectedly");
        }
    }

    shutdown.cancel();
    expiry_handle.abort();
    server_handle.await??;

    info!("LLM Ops Controller shutdown complete");
    Ok(())
}
