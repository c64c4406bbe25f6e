// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepflow_core::engine::Engine;
//! use stepflow_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqlitePersistence::from_path("stepflow.db").await?);
//!
//!     let engine = Engine::builder()
//!         .persistence(store)
//!         .max_concurrent_workflows(20)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     engine.queue("instance-id")?;
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::scheduler::Scheduler;
use super::sweeper::{Sweeper, requeue_stalled};
use super::{EngineContext, listener, orchestrator};
use crate::actions::ActionRegistry;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{EventBus, LocalEventBus};
use crate::executor::StepExecutor;
use crate::models::Template;
use crate::persistence::Persistence;

/// Builder for creating an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    event_bus: Option<Arc<dyn EventBus>>,
    actions: Option<ActionRegistry>,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("event_bus", &self.event_bus.as_ref().map(|_| "..."))
            .field("actions", &self.actions)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the event bus.
    ///
    /// Default: an in-process [`LocalEventBus`].
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Set the action registry.
    ///
    /// Default: [`ActionRegistry::with_builtins`].
    pub fn actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Replace every engine setting at once.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Worker pool size.
    ///
    /// Default: `100`
    pub fn max_concurrent_workflows(mut self, max: usize) -> Self {
        self.config.max_concurrent_workflows = max;
        self
    }

    /// Bounded queue capacity.
    ///
    /// Default: `100`
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sweep interval.
    ///
    /// Default: 10 seconds
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.config.check_interval = interval;
        self
    }

    /// Step timeout.
    ///
    /// Default: 300 seconds
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_timeout = timeout;
        self
    }

    /// Cap applied to every step retry policy.
    ///
    /// Default: `3`
    pub fn step_retry_limit(mut self, limit: u32) -> Self {
        self.config.step_retry_limit = limit;
        self
    }

    /// Pause between steps of one instance.
    ///
    /// Default: 100 milliseconds
    pub fn step_yield(mut self, pause: Duration) -> Self {
        self.config.step_yield = pause;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        if self.config.max_concurrent_workflows == 0 {
            anyhow::bail!("max_concurrent_workflows must be at least 1");
        }
        if self.config.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }

        Ok(EngineRuntimeConfig {
            persistence,
            event_bus: self
                .event_bus
                .unwrap_or_else(|| Arc::new(LocalEventBus::default())),
            actions: self.actions.unwrap_or_else(ActionRegistry::with_builtins),
            config: self.config,
        })
    }
}

/// Configuration for an [`Engine`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    event_bus: Arc<dyn EventBus>,
    actions: ActionRegistry,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("event_bus", &"...")
            .field("actions", &self.actions)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the engine: subscribe to the bus, spawn the dispatch loop, the
    /// sweeper and the listener, and re-queue instances left `running`.
    pub async fn start(self) -> Result<Engine> {
        let shutdown = CancellationToken::new();
        let config = self.config;

        let scheduler = Arc::new(Scheduler::new(
            config.queue_capacity,
            config.max_concurrent_workflows,
            shutdown.clone(),
        ));
        let executor = StepExecutor::new(
            self.persistence.clone(),
            self.event_bus.clone(),
            Arc::new(self.actions),
            config.step_timeout,
            shutdown.clone(),
        );
        let ctx = Arc::new(EngineContext {
            store: self.persistence,
            bus: self.event_bus,
            executor,
            scheduler: scheduler.clone(),
            config,
            shutdown: shutdown.clone(),
        });

        let subscription = ctx.bus.subscribe().await?;
        let tracker = TaskTracker::new();

        let worker_ctx = ctx.clone();
        let dispatch_handle = tokio::spawn(scheduler.clone().dispatch(tracker.clone(), move |id| {
            let ctx = worker_ctx.clone();
            async move { orchestrator::run_worker(&ctx, &id).await }
        }));
        let sweeper_handle = tokio::spawn(Sweeper::new(ctx.clone()).run());
        let listener_handle = tokio::spawn(listener::run(ctx.clone(), subscription));

        let engine = Engine {
            ctx,
            tracker,
            handles: vec![dispatch_handle, sweeper_handle, listener_handle],
        };

        let recovered = engine.recover().await?;
        info!(
            max_concurrent = engine.ctx.config.max_concurrent_workflows,
            queue_capacity = engine.ctx.config.queue_capacity,
            recovered,
            "Engine started"
        );

        Ok(engine)
    }
}

/// A running engine.
///
/// The engine manages:
/// - the dispatch loop and its worker pool
/// - the periodic sweep for pending instances and timed-out steps
/// - the event listener
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Engine {
    ctx: Arc<EngineContext>,
    tracker: TaskTracker,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.ctx.config)
            .field("running", &self.ctx.scheduler.running_count())
            .finish()
    }
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Enqueue an instance without blocking.
    ///
    /// Fails with [`CoreError::QueueFull`] when the queue is at capacity and
    /// with [`CoreError::ShuttingDown`] after shutdown began. Queueing an
    /// instance that is already running is not an error.
    pub fn queue(&self, instance_id: &str) -> Result<(), CoreError> {
        self.ctx.scheduler.queue(instance_id)
    }

    /// Check a template before instances are created from it.
    ///
    /// Reports graph problems as [`CoreError::InvalidSchema`] and bad action
    /// configuration as [`CoreError::InvalidStepConfig`].
    pub fn check_template(&self, template: &Template) -> Result<(), CoreError> {
        template
            .schema
            .validate()
            .map_err(|reason| CoreError::InvalidSchema {
                template_id: template.id.clone(),
                reason,
            })?;
        self.ctx.executor.actions().check_schema(&template.schema)
    }

    /// Whether a worker currently owns `instance_id`.
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.ctx.scheduler.is_running(instance_id)
    }

    /// Get a reference to the durable store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.ctx.store
    }

    /// Get a reference to the event bus.
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.ctx.bus
    }

    /// Engine settings in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Gracefully shut down the engine.
    ///
    /// Stops dispatching, lets in-flight workers reach their next
    /// cancellation point, then closes the event bus.
    pub async fn shutdown(self) -> Result<()> {
        info!("Engine shutting down...");
        self.ctx.shutdown.cancel();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Engine task panicked: {}", e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        self.ctx.bus.close().await?;
        info!("Engine shutdown complete");
        Ok(())
    }

    /// Re-queue instances a previous process left `running`. Whatever does
    /// not fit in the queue is picked up by the sweep.
    async fn recover(&self) -> Result<usize, CoreError> {
        let limit = self.ctx.config.queue_capacity as i64;
        requeue_stalled(&self.ctx, limit).await
    }
}
