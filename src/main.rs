// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Binary entry point for the adaptive load-shedding engine.

use std::sync::Arc;

use loadshed_config::EngineConfig;
use loadshed_controller::Engine;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env();
    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "invalid configuration, refusing to start");
            std::process::exit(1);
        }
    };

    run(engine).await;
}

async fn run(engine: Arc<Engine>) {
    engine.start();
    info!("engine running; press ctrl-c to shut down");

    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }

    info!("shutdown signal received");
    if let Err(err) = engine.shutdown().await {
        error!(error = %err, "engine shutdown did not complete cleanly");
    }
}
