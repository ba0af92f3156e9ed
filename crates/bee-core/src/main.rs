// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! bee-agent - serves the bee gRPC service on a managed host.

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use bee_core::agent::{AgentConfig, AgentService};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bee_core=info".parse()?),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting bee-agent");

    let config = AgentConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let listener = TcpListener::bind(config.addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    AgentService::new(config.root).serve(listener, shutdown).await?;

    info!("bee-agent stopped");
    Ok(())
}
