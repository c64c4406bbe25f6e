// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepflow Core - standalone engine process
//!
//! Connects the durable store and the event bus, then runs the engine until
//! Ctrl-C. Instances are created and queued by producers sharing the same
//! store and bus.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use stepflow_core::actions::ActionRegistry;
use stepflow_core::config::Config;
use stepflow_core::engine::Engine;
use stepflow_core::events::{EventBus, LocalEventBus, RedisEventBus};
use stepflow_core::persistence;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stepflow_core=info".parse()?),
        )
        .init();

    info!("Starting Stepflow Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_concurrent = config.engine.max_concurrent_workflows,
        queue_capacity = config.engine.queue_capacity,
        step_timeout_secs = config.engine.step_timeout.as_secs(),
        redis = config.redis_url.is_some(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store = persistence::connect(&config.database_url).await?;
    store.health_check().await?;
    info!("Database ready, migrations applied");

    let bus: Arc<dyn EventBus> = match &config.redis_url {
        Some(url) => {
            info!(channel = %config.event_channel, "Using Redis event bus");
            Arc::new(RedisEventBus::connect(url, config.event_channel.clone()).await?)
        }
        None => {
            info!("Using in-process event bus");
            Arc::new(LocalEventBus::default())
        }
    };

    let actions = ActionRegistry::with_builtins();
    info!(actions = ?actions.names(), "Actions registered");

    let engine = Engine::builder()
        .persistence(store)
        .event_bus(bus)
        .actions(actions)
        .config(config.engine)
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
