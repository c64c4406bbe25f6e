// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance scheduler and its background tasks.
//!
//! ```text
//!  producer ──queue(id)──► [bounded queue] ──► dispatch ──► worker (orchestrator::drive)
//!                               ▲                               │
//!        sweeper (pending,      │                               ├─► StepExecutor
//!        step timeouts) ────────┤                               │
//!                               │                               ▼
//!        listener ◄── EventBus ◄┴──────────── step_completed events
//! ```

mod listener;
mod orchestrator;
pub mod runtime;
mod scheduler;
mod sweeper;

pub use runtime::{Engine, EngineBuilder, EngineRuntimeConfig};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::executor::StepExecutor;
use crate::persistence::Persistence;
use scheduler::Scheduler;

/// Everything a worker, the sweeper and the listener share.
pub(crate) struct EngineContext {
    pub store: Arc<dyn Persistence>,
    pub bus: Arc<dyn EventBus>,
    pub executor: StepExecutor,
    pub scheduler: Arc<Scheduler>,
    pub config: EngineConfig,
    pub shutdown: CancellationToken,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;
    use crate::actions::ActionRegistry;
    use crate::events::LocalEventBus;
    use crate::persistence::SqlitePersistence;

    /// Context over an in-memory store with no dispatch loop running.
    pub(crate) async fn context(config: EngineConfig) -> Arc<EngineContext> {
        let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::default());
        let shutdown = CancellationToken::new();
        let executor = StepExecutor::new(
            store.clone(),
            bus.clone(),
            Arc::new(ActionRegistry::with_builtins()),
            config.step_timeout,
            shutdown.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            config.queue_capacity,
            config.max_concurrent_workflows,
            shutdown.clone(),
        ));
        Arc::new(EngineContext {
            store,
            bus,
            executor,
            scheduler,
            config,
            shutdown,
        })
    }

    pub(crate) fn fast_config() -> EngineConfig {
        EngineConfig {
            step_yield: Duration::from_millis(1),
            ..EngineConfig::default()
        }
    }
}
