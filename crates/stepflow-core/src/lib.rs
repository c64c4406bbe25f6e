// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepflow Core - Workflow Orchestration Engine
//!
//! This crate executes workflow instances: directed graphs of typed steps
//! defined by a template. It schedules instances on a bounded worker pool,
//! runs their steps, and persists every step and instance transition so an
//! instance can be resumed after a crash without re-running finished steps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Producers                                     │
//! │        (API layer, trigger handlers: create instances, call queue)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ Engine::queue(id)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Engine                                       │
//! │   bounded queue ─► dispatch ─► workers (one per instance)                │
//! │   sweeper (pending, stalled, step timeouts)  listener (bus wake-ups)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              ▲
//!           │ StepExecutor                                 │ step_completed,
//!           ▼                                              │ workflow_triggered
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │   Actions             │                    │        Event Bus            │
//! │ http, email, log,     │                    │  (in-process or Redis)      │
//! │ update_variables      │                    └─────────────────────────────┘
//! └───────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │  SQLite / PostgreSQL  │
//! │  (Durable Storage)    │
//! └───────────────────────┘
//! ```
//!
//! # Step Types
//!
//! | Type | Behavior |
//! |------|----------|
//! | `action` | Runs a registered action (`http_request`, `send_email`, `log_message`, `update_variables`) |
//! | `condition` | AND of `(field, operator, value)` predicates; picks `next[0]` or `next[1]` |
//! | `parallel` | Runs inline action tasks concurrently; succeeds only if all succeed |
//! | `wait` | Sleeps for `duration` seconds, or suspends until a named event arrives |
//! | `subflow` | Starts a child instance and suspends until it finishes |
//!
//! # Instance Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ PENDING │
//!                     └────┬────┘
//!                          │ picked up by a worker
//!                          ▼
//!     pause ┌─────────┐ cancel
//!    ┌──────│ RUNNING │──────────┐
//!    │      └────┬────┘          │
//!    ▼        ▲  │               ▼
//! ┌────────┐  │  │          ┌───────────┐
//! │ PAUSED │──┘  │          │ CANCELLED │
//! └────────┘     │          └───────────┘
//!   resume   ┌───┴────────┐
//!         complete       fail
//!            │            │
//!            ▼            ▼
//!      ┌───────────┐ ┌────────┐
//!      │ COMPLETED │ │ FAILED │
//!      └───────────┘ └────────┘
//! ```
//!
//! Pause, resume and cancel are producer operations
//! ([`persistence::Persistence::update_instance_status`] followed by
//! [`engine::Engine::queue`]). Workers observe them before each step.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `STEPFLOW_DATABASE_URL` | (required) | `postgres://...` or `sqlite:...` |
//! | `STEPFLOW_REDIS_URL` | (unset) | Redis event bus; in-process bus when unset |
//! | `STEPFLOW_EVENT_CHANNEL` | `workflow:events` | Pub/sub channel |
//! | `STEPFLOW_MAX_CONCURRENT_WORKFLOWS` | `100` | Worker pool size |
//! | `STEPFLOW_QUEUE_CAPACITY` | `100` | Bounded queue capacity |
//! | `STEPFLOW_CHECK_INTERVAL_SECS` | `10` | Sweep interval |
//! | `STEPFLOW_STEP_TIMEOUT_SECS` | `300` | Step timeout |
//! | `STEPFLOW_STEP_RETRY_LIMIT` | `3` | Cap on any step retry policy |
//! | `STEPFLOW_PENDING_BATCH_SIZE` | `10` | Pending instances re-queued per sweep |
//! | `STEPFLOW_STEP_YIELD_MS` | `100` | Pause between two steps |
//!
//! # Modules
//!
//! - [`engine`]: scheduler, orchestration loop, sweeper, event listener
//! - [`executor`]: per-step-type execution and step record bookkeeping
//! - [`actions`]: action contract, registry and built-in actions
//! - [`persistence`]: durable store contract with SQLite and PostgreSQL backends
//! - [`events`]: event bus contract with in-process and Redis backends
//! - [`models`]: templates, instances, step records, triggers
//! - [`config`], [`error`]: process configuration and error taxonomy

#![deny(missing_docs)]

/// Typed actions invoked by `action` and `parallel` steps.
pub mod actions;

/// Configuration loading from environment variables.
pub mod config;

/// Instance scheduler, orchestration loop and background tasks.
pub mod engine;

/// Error types with machine-readable codes.
pub mod error;

/// Event bus contract and backends.
pub mod events;

/// Step executor and per-type semantics.
pub mod executor;

/// Templates, instances, step records and triggers.
pub mod models;

/// Durable store contract and database backends.
pub mod persistence;

pub use engine::{Engine, EngineBuilder};
pub use error::{CoreError, Result};
