//! A distributed traffic simulator's coordinator and worker.

mod app;
mod config;
mod coordinator;
mod error;
#[cfg(test)]
mod fixtures;
mod graph;
mod models;
mod planner;
mod transport;
mod worker;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        role = ?cfg.role,
        coordinator = %cfg.coordinator_addr(),
        worker_count = cfg.worker_count,
        worker_name = ?cfg.worker_name,
        network_path = %cfg.network_path,
        "starting traffic grid",
    );
    let res = App::new(cfg).await?.spawn().await.context("error joining app handle").and_then(|res| res);

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}
