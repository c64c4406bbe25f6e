//! Durable store interfaces and backends for stepflow-core.
//!
//! Every mutation is a single SQL statement. Transitions that can race (the
//! worker finishing a step while the sweeper times it out, two wake-ups for
//! the same waiting step) are guarded by a `WHERE status = ...` clause and
//! report the outcome as `bool`: `false` means another actor won and the
//! caller must treat the call as a no-op.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    Instance, InstanceStatus, JsonMap, StepError, StepRecord, StepStatus, Template, Trigger,
};

/// Final state written to a suspended step when its wake-up key fires.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResolution {
    /// `completed` or `failed`.
    pub status: StepStatus,
    /// Output merged into the record.
    pub output: JsonMap,
    /// Error payload for failed resolutions.
    pub error: Option<StepError>,
}

impl StepResolution {
    /// A successful resolution carrying `output`.
    pub fn completed(output: JsonMap) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            error: None,
        }
    }

    /// A failed resolution.
    pub fn failed(output: JsonMap, error: StepError) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            error: Some(error),
        }
    }
}

/// Durable store contract used by the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Insert a new template.
    async fn insert_template(&self, template: &Template) -> Result<(), CoreError>;

    /// Fetch a template by id.
    async fn get_template(&self, template_id: &str) -> Result<Option<Template>, CoreError>;

    /// List templates ordered by creation time.
    async fn list_templates(&self, active_only: bool) -> Result<Vec<Template>, CoreError>;

    /// Toggle the active flag. Returns `false` when the template does not exist.
    async fn set_template_active(&self, template_id: &str, active: bool)
    -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Insert a new instance.
    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError>;

    /// Fetch an instance by id.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, CoreError>;

    /// Fetch only the status column.
    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStatus>, CoreError>;

    /// Oldest first, at most `limit` rows.
    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
        limit: i64,
    ) -> Result<Vec<Instance>, CoreError>;

    /// `running` instances with work a worker could pick up, least recently
    /// updated first.
    ///
    /// Excludes instances parked on an external event or on a child instance
    /// that has not finished yet. Everything else (a resolved wait, a rewound
    /// step, a timer lost to a restart) is returned.
    async fn list_stalled_instances(&self, limit: i64) -> Result<Vec<Instance>, CoreError>;

    /// Conditional status change `from -> to`.
    ///
    /// Used by producers for pause, resume and cancel. Terminal targets also
    /// stamp `completed_at`.
    async fn update_instance_status(
        &self,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, CoreError>;

    /// `pending -> running`, stamping `started_at` on the first start.
    async fn start_instance(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// Record the step the instance has reached.
    async fn set_current_step(&self, instance_id: &str, step_id: &str) -> Result<(), CoreError>;

    /// Overwrite the variable bag.
    async fn set_instance_variables(
        &self,
        instance_id: &str,
        variables: &JsonMap,
    ) -> Result<(), CoreError>;

    /// `running -> completed`.
    async fn complete_instance_if_running(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// `running -> failed` with an error message.
    async fn fail_instance_if_running(
        &self,
        instance_id: &str,
        error: &str,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Fetch a step record by its row id.
    async fn get_step(&self, id: &str) -> Result<Option<StepRecord>, CoreError>;

    /// Fetch the record for a step definition within an instance.
    async fn find_step(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, CoreError>;

    /// Insert a new step record.
    async fn insert_step(&self, step: &StepRecord) -> Result<(), CoreError>;

    /// All records of an instance in creation order.
    async fn list_steps(&self, instance_id: &str) -> Result<Vec<StepRecord>, CoreError>;

    /// Begin an attempt: status `running`, fresh `started_at`, no wake-up key.
    ///
    /// A record revisited after it finished (a loop in the graph) starts over
    /// with `retry_count = 0`; a rewound record keeps its count.
    async fn start_step(&self, id: &str) -> Result<StepRecord, CoreError>;

    /// Mark a running step as suspended on `waiting_for`.
    async fn set_step_waiting(&self, id: &str, waiting_for: &str) -> Result<(), CoreError>;

    /// `running -> status` with output and error payloads.
    async fn finish_step_if_running(
        &self,
        id: &str,
        status: StepStatus,
        output: &JsonMap,
        error: Option<&StepError>,
    ) -> Result<bool, CoreError>;

    /// `from -> pending`, incrementing `retry_count` only if it still equals
    /// `retry_count`. This is the single rewind path for retries.
    async fn rewind_step(
        &self,
        id: &str,
        from: StepStatus,
        retry_count: i32,
    ) -> Result<bool, CoreError>;

    /// Running, non-suspended steps started before `older_than`.
    async fn list_timed_out_steps(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRecord>, CoreError>;

    /// Resolve one instance's step suspended on `waiting_for`.
    async fn resolve_waiting_step(
        &self,
        instance_id: &str,
        waiting_for: &str,
        resolution: &StepResolution,
    ) -> Result<bool, CoreError>;

    /// Resolve every step suspended on `waiting_for`; returns the affected instance ids.
    async fn resolve_waiting_steps(
        &self,
        waiting_for: &str,
        resolution: &StepResolution,
    ) -> Result<Vec<String>, CoreError>;

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Insert a new trigger.
    async fn insert_trigger(&self, trigger: &Trigger) -> Result<(), CoreError>;

    /// Fetch a trigger by id.
    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<Trigger>, CoreError>;

    /// Triggers bound to a template.
    async fn list_triggers(&self, template_id: &str) -> Result<Vec<Trigger>, CoreError>;

    /// Stamp `last_triggered_at`. Returns `false` for unknown or inactive triggers.
    async fn mark_trigger_fired(&self, trigger_id: &str) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Round-trip a trivial query.
    async fn health_check(&self) -> Result<(), CoreError>;
}

/// Connect to the store named by `url` and run migrations.
///
/// `postgres://` and `postgresql://` select Postgres, `sqlite:` selects SQLite.
pub async fn connect(url: &str) -> Result<Arc<dyn Persistence>, CoreError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresPersistence::connect(url).await?))
    } else if let Some(path) = url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if path == ":memory:" {
            Ok(Arc::new(SqlitePersistence::in_memory().await?))
        } else {
            Ok(Arc::new(SqlitePersistence::from_path(path).await?))
        }
    } else {
        Err(CoreError::DatabaseError {
            operation: "connect".to_string(),
            details: format!("unsupported database url scheme: {}", url),
        })
    }
}
