// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Same contract as the SQLite backend; JSON columns are `JSONB` and
//! timestamps are `TIMESTAMPTZ`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;

use crate::error::CoreError;
use crate::models::{
    Instance, InstanceStatus, JsonMap, StepError, StepRecord, StepStatus, Template, Trigger,
};

use super::{Persistence, StepResolution};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    // ========================================================================
    // Template Operations
    // ========================================================================

    async fn insert_template(&self, template: &Template) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_templates
                (id, name, description, category, version, schema, metadata,
                 is_active, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.category)
        .bind(&template.version)
        .bind(Json(&template.schema))
        .bind(Json(&template.metadata))
        .bind(template.is_active)
        .bind(&template.created_by)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>, CoreError> {
        let template =
            sqlx::query_as::<_, Template>("SELECT * FROM workflow_templates WHERE id = $1")
                .bind(template_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(template)
    }

    async fn list_templates(&self, active_only: bool) -> Result<Vec<Template>, CoreError> {
        let templates = sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM workflow_templates
            WHERE is_active OR NOT $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(templates)
    }

    async fn set_template_active(
        &self,
        template_id: &str,
        active: bool,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE workflow_templates SET is_active = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(active)
        .bind(template_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Instance Operations
    // ========================================================================

    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, template_id, name, status, variables, context, current_step,
                 parent_instance_id, parent_step_id, started_at, completed_at,
                 error_message, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.template_id)
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(Json(&instance.variables))
        .bind(Json(&instance.context))
        .bind(&instance.current_step)
        .bind(&instance.parent_instance_id)
        .bind(&instance.parent_step_id)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.error_message)
        .bind(&instance.created_by)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, CoreError> {
        let instance =
            sqlx::query_as::<_, Instance>("SELECT * FROM workflow_instances WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(instance)
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStatus>, CoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_instances WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(s) => s
                .parse::<InstanceStatus>()
                .map(Some)
                .map_err(|e| CoreError::DatabaseError {
                    operation: "get_instance_status".to_string(),
                    details: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
        limit: i64,
    ) -> Result<Vec<Instance>, CoreError> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT * FROM workflow_instances
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    async fn list_stalled_instances(&self, limit: i64) -> Result<Vec<Instance>, CoreError> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT * FROM workflow_instances i
            WHERE i.status = 'running'
              AND NOT EXISTS (
                SELECT 1 FROM workflow_steps s
                WHERE s.instance_id = i.id
                  AND s.status = 'running'
                  AND (
                    s.waiting_for LIKE 'event:%'
                    OR EXISTS (
                        SELECT 1 FROM workflow_instances c
                        WHERE s.waiting_for = 'subflow:' || c.id
                          AND c.status NOT IN ('completed', 'failed', 'cancelled')
                    )
                  )
              )
            ORDER BY i.updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let completed_at = to.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $1,
                completed_at = COALESCE($2, completed_at),
                updated_at = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(to.as_str())
        .bind(completed_at)
        .bind(now)
        .bind(instance_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'running',
                started_at = COALESCE(started_at, $1),
                updated_at = $1
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_current_step(&self, instance_id: &str, step_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE workflow_instances SET current_step = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(step_id)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_instance_variables(
        &self,
        instance_id: &str,
        variables: &JsonMap,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE workflow_instances SET variables = $1, updated_at = $2 WHERE id = $3")
            .bind(Json(variables))
            .bind(Utc::now())
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete_instance_if_running(&self, instance_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'completed', completed_at = $1, updated_at = $1
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_instance_if_running(
        &self,
        instance_id: &str,
        error: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'failed', error_message = $1, completed_at = $2, updated_at = $2
            WHERE id = $3 AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Step Operations
    // ========================================================================

    async fn get_step(&self, id: &str) -> Result<Option<StepRecord>, CoreError> {
        let step = sqlx::query_as::<_, StepRecord>("SELECT * FROM workflow_steps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(step)
    }

    async fn find_step(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, CoreError> {
        let step = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM workflow_steps WHERE instance_id = $1 AND step_id = $2",
        )
        .bind(instance_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(step)
    }

    async fn insert_step(&self, step: &StepRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (id, instance_id, step_id, step_type, status, input_data, output_data,
                 error_data, waiting_for, retry_count, started_at, completed_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&step.id)
        .bind(&step.instance_id)
        .bind(&step.step_id)
        .bind(step.step_type.as_str())
        .bind(step.status.as_str())
        .bind(Json(&step.input_data))
        .bind(Json(&step.output_data))
        .bind(Json(&step.error_data))
        .bind(&step.waiting_for)
        .bind(step.retry_count)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_steps(&self, instance_id: &str) -> Result<Vec<StepRecord>, CoreError> {
        let steps = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM workflow_steps WHERE instance_id = $1 ORDER BY created_at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }

    async fn start_step(&self, id: &str) -> Result<StepRecord, CoreError> {
        let step = sqlx::query_as::<_, StepRecord>(
            r#"
            UPDATE workflow_steps
            SET retry_count = CASE
                    WHEN status IN ('completed', 'skipped', 'failed') THEN 0
                    ELSE retry_count
                END,
                status = 'running',
                output_data = '{}'::jsonb,
                error_data = 'null'::jsonb,
                waiting_for = NULL,
                started_at = $1,
                completed_at = NULL,
                updated_at = $1
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        step.ok_or_else(|| CoreError::DatabaseError {
            operation: "start_step".to_string(),
            details: format!("step record '{}' does not exist", id),
        })
    }

    async fn set_step_waiting(&self, id: &str, waiting_for: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET waiting_for = $1, updated_at = $2
            WHERE id = $3 AND status = 'running'
            "#,
        )
        .bind(waiting_for)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_step_if_running(
        &self,
        id: &str,
        status: StepStatus,
        output: &JsonMap,
        error: Option<&StepError>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = $1,
                output_data = $2,
                error_data = $3,
                waiting_for = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE id = $5 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(Json(output))
        .bind(Json(error))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rewind_step(
        &self,
        id: &str,
        from: StepStatus,
        retry_count: i32,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'pending',
                retry_count = retry_count + 1,
                waiting_for = NULL,
                started_at = NULL,
                completed_at = NULL,
                updated_at = $1
            WHERE id = $2 AND status = $3 AND retry_count = $4
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_timed_out_steps(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StepRecord>, CoreError> {
        let steps = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT * FROM workflow_steps
            WHERE status = 'running'
              AND waiting_for IS NULL
              AND started_at < $1
            ORDER BY started_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }

    async fn resolve_waiting_step(
        &self,
        instance_id: &str,
        waiting_for: &str,
        resolution: &StepResolution,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = $1,
                output_data = $2,
                error_data = $3,
                waiting_for = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE instance_id = $5 AND waiting_for = $6 AND status = 'running'
            "#,
        )
        .bind(resolution.status.as_str())
        .bind(Json(&resolution.output))
        .bind(Json(&resolution.error))
        .bind(Utc::now())
        .bind(instance_id)
        .bind(waiting_for)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve_waiting_steps(
        &self,
        waiting_for: &str,
        resolution: &StepResolution,
    ) -> Result<Vec<String>, CoreError> {
        let instance_ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workflow_steps
            SET status = $1,
                output_data = $2,
                error_data = $3,
                waiting_for = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE waiting_for = $5 AND status = 'running'
            RETURNING instance_id
            "#,
        )
        .bind(resolution.status.as_str())
        .bind(Json(&resolution.output))
        .bind(Json(&resolution.error))
        .bind(Utc::now())
        .bind(waiting_for)
        .fetch_all(&self.pool)
        .await?;

        Ok(instance_ids)
    }

    // ========================================================================
    // Trigger Operations
    // ========================================================================

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_triggers
                (id, template_id, trigger_type, trigger_config, is_active,
                 last_triggered_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&trigger.id)
        .bind(&trigger.template_id)
        .bind(trigger.trigger_type.as_str())
        .bind(Json(&trigger.trigger_config))
        .bind(trigger.is_active)
        .bind(trigger.last_triggered_at)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<Trigger>, CoreError> {
        let trigger =
            sqlx::query_as::<_, Trigger>("SELECT * FROM workflow_triggers WHERE id = $1")
                .bind(trigger_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(trigger)
    }

    async fn list_triggers(&self, template_id: &str) -> Result<Vec<Trigger>, CoreError> {
        let triggers = sqlx::query_as::<_, Trigger>(
            "SELECT * FROM workflow_triggers WHERE template_id = $1 ORDER BY created_at ASC",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(triggers)
    }

    async fn mark_trigger_fired(&self, trigger_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_triggers
            SET last_triggered_at = $1, updated_at = $1
            WHERE id = $2 AND is_active
            "#,
        )
        .bind(Utc::now())
        .bind(trigger_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
