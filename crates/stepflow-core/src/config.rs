// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default pub/sub channel for workflow events.
pub const DEFAULT_EVENT_CHANNEL: &str = "workflow:events";

/// Stepflow process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Redis URL for the event bus; the in-process bus is used when unset
    pub redis_url: Option<String>,
    /// Pub/sub channel name
    pub event_channel: String,
    /// Scheduler and worker settings
    pub engine: EngineConfig,
}

/// Settings for the instance scheduler and its background tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of instances advanced concurrently.
    pub max_concurrent_workflows: usize,
    /// Capacity of the bounded instance queue.
    pub queue_capacity: usize,
    /// How often the sweep runs (pending pick-up, step timeouts).
    pub check_interval: Duration,
    /// How long a step may stay `running` before the sweep times it out.
    pub step_timeout: Duration,
    /// Upper bound applied to any step retry policy.
    pub step_retry_limit: u32,
    /// Pending instances re-queued per sweep.
    pub pending_batch_size: i64,
    /// Pause between two steps of the same instance.
    pub step_yield: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            queue_capacity: 100,
            check_interval: Duration::from_secs(10),
            step_timeout: Duration::from_secs(300),
            step_retry_limit: 3,
            pending_batch_size: 10,
            step_yield: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STEPFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STEPFLOW_REDIS_URL`: Redis event bus (default: in-process bus)
    /// - `STEPFLOW_EVENT_CHANNEL`: pub/sub channel (default: workflow:events)
    /// - `STEPFLOW_MAX_CONCURRENT_WORKFLOWS`: worker pool size (default: 100)
    /// - `STEPFLOW_QUEUE_CAPACITY`: queue capacity (default: 100)
    /// - `STEPFLOW_CHECK_INTERVAL_SECS`: sweep interval (default: 10)
    /// - `STEPFLOW_STEP_TIMEOUT_SECS`: step timeout (default: 300)
    /// - `STEPFLOW_STEP_RETRY_LIMIT`: retry cap (default: 3)
    /// - `STEPFLOW_PENDING_BATCH_SIZE`: pending pick-up batch (default: 10)
    /// - `STEPFLOW_STEP_YIELD_MS`: inter-step yield (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEPFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STEPFLOW_DATABASE_URL"))?;

        let redis_url = std::env::var("STEPFLOW_REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let event_channel = std::env::var("STEPFLOW_EVENT_CHANNEL")
            .unwrap_or_else(|_| DEFAULT_EVENT_CHANNEL.to_string());

        let defaults = EngineConfig::default();

        let max_concurrent_workflows = positive_from_env(
            "STEPFLOW_MAX_CONCURRENT_WORKFLOWS",
            defaults.max_concurrent_workflows as u64,
        )? as usize;
        let queue_capacity =
            positive_from_env("STEPFLOW_QUEUE_CAPACITY", defaults.queue_capacity as u64)? as usize;
        let check_interval = positive_from_env(
            "STEPFLOW_CHECK_INTERVAL_SECS",
            defaults.check_interval.as_secs(),
        )?;
        let step_timeout =
            positive_from_env("STEPFLOW_STEP_TIMEOUT_SECS", defaults.step_timeout.as_secs())?;

        let step_retry_limit: u32 = std::env::var("STEPFLOW_STEP_RETRY_LIMIT")
            .unwrap_or_else(|_| defaults.step_retry_limit.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STEPFLOW_STEP_RETRY_LIMIT", "must be a non-negative integer")
            })?;

        let pending_batch_size = positive_from_env(
            "STEPFLOW_PENDING_BATCH_SIZE",
            defaults.pending_batch_size as u64,
        )? as i64;

        let step_yield_ms: u64 = std::env::var("STEPFLOW_STEP_YIELD_MS")
            .unwrap_or_else(|_| defaults.step_yield.as_millis().to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STEPFLOW_STEP_YIELD_MS", "must be a non-negative integer")
            })?;

        Ok(Self {
            database_url,
            redis_url,
            event_channel,
            engine: EngineConfig {
                max_concurrent_workflows,
                queue_capacity,
                check_interval: Duration::from_secs(check_interval),
                step_timeout: Duration::from_secs(step_timeout),
                step_retry_limit,
                pending_batch_size,
                step_yield: Duration::from_millis(step_yield_ms),
            },
        })
    }
}

fn positive_from_env(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
