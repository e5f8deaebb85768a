use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tproxy_core::{Core, ReqwestUpstreamClient, UpstreamClientConfig};
use tracing::{info, warn};

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("tproxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve()?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let bind = config.bind_addr();
    info!(
        event = "config_loaded",
        bind = %bind,
        upstream = %config.upstream_base_url(),
        enabled = config.enabled,
        thinking_max_concurrency = config.thinking.max_concurrency,
        standard_max_concurrency = config.standard.max_concurrency,
        transcode = %config.transcode,
        diagnostics = config.diagnostics
    );

    let client = ReqwestUpstreamClient::new(UpstreamClientConfig::default())
        .context("building upstream client")?;
    let core = Core::new(config, Arc::new(client));
    let app = core.router();

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(core))
        .await
        .context("serving")?;
    info!(event = "stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tproxy=info,tproxy_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C after interrupting retry backoff and governor waits,
/// so in-flight handlers finish promptly.
async fn shutdown_signal(core: Core) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "signal_unavailable", error = %err);
        std::future::pending::<()>().await;
    }
    info!(event = "shutdown_requested");
    core.shutdown();
}
