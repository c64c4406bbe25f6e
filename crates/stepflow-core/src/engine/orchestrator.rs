// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance orchestration loop.
//!
//! One call of [`drive`] advances an instance until it reaches a terminal
//! status, suspends, or observes shutdown. Re-entry after a crash or a
//! wake-up starts from the persisted `current_step` and reuses a finished
//! record instead of executing the step again.

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::EngineContext;
use crate::error::CoreError;
use crate::events::WorkflowEvent;
use crate::executor::{StepOutcome, StepResult, SUBFLOW_KEY_PREFIX, TIMER_KEY_PREFIX, subflow_key};
use crate::models::{
    Instance, InstanceStatus, JsonMap, StepDefinition, StepError, StepStatus, WorkflowSchema,
};
use crate::persistence::StepResolution;

/// Worker entry point: drive the instance and log any store failure.
pub(crate) async fn run_worker(ctx: &EngineContext, instance_id: &str) {
    if let Err(e) = drive(ctx, instance_id).await {
        error!(instance_id = %instance_id, error = %e, "Orchestration loop failed");
    }
}

/// Advance `instance_id` as far as it can go.
pub(crate) async fn drive(ctx: &EngineContext, instance_id: &str) -> Result<(), CoreError> {
    let Some(mut instance) = ctx.store.get_instance(instance_id).await? else {
        warn!(instance_id = %instance_id, "Queued instance does not exist");
        return Ok(());
    };

    match instance.status {
        InstanceStatus::Pending => {
            if !ctx.store.start_instance(instance_id).await? {
                debug!(instance_id = %instance_id, "Instance left pending before pick-up");
                return Ok(());
            }
            instance.status = InstanceStatus::Running;
            info!(instance_id = %instance_id, template_id = %instance.template_id, "Instance started");
        }
        InstanceStatus::Running => {}
        InstanceStatus::Paused => {
            debug!(instance_id = %instance_id, "Instance is paused");
            return Ok(());
        }
        status => {
            return notify_parent(ctx, instance_id, status).await;
        }
    }

    let schema = match load_schema(ctx, &instance).await? {
        Ok(schema) => schema,
        Err(message) => return fail_instance(ctx, &instance, &message).await,
    };

    let Some(mut step_id) = instance
        .current_step
        .clone()
        .or_else(|| schema.entry_step_id().map(str::to_string))
    else {
        info!(instance_id = %instance_id, "Schema has no steps, completing instance");
        return complete_instance(ctx, &instance).await;
    };

    let mut resuming = true;

    loop {
        if ctx.shutdown.is_cancelled() {
            debug!(instance_id = %instance_id, "Shutdown observed, leaving instance");
            return Ok(());
        }

        match ctx.store.get_instance_status(instance_id).await? {
            Some(InstanceStatus::Running) => {}
            Some(status) if status.is_terminal() => {
                info!(instance_id = %instance_id, status = %status, "Instance finished elsewhere");
                return notify_parent(ctx, instance_id, status).await;
            }
            Some(status) => {
                info!(instance_id = %instance_id, status = %status, "Instance no longer running, stopping");
                return Ok(());
            }
            None => return Ok(()),
        }

        let Some(def) = schema.step(&step_id) else {
            let e = CoreError::StepNotFound {
                instance_id: instance.id.clone(),
                step_id: step_id.clone(),
            };
            return fail_instance(ctx, &instance, &e.to_string()).await;
        };

        if instance.current_step.as_deref() != Some(step_id.as_str()) {
            ctx.store.set_current_step(instance_id, &step_id).await?;
            instance.current_step = Some(step_id.clone());
        }

        let outcome = if resuming {
            resume(ctx, &mut instance, def).await?
        } else {
            ctx.executor.execute(&mut instance, def).await?
        };
        resuming = false;

        match outcome {
            StepOutcome::Completed(result) => {
                let Some(next) = def.next_step(result.success) else {
                    return complete_instance(ctx, &instance).await;
                };
                debug!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    next_step = %next,
                    success = result.success,
                    "Advancing"
                );
                step_id = next.to_string();

                tokio::select! {
                    _ = ctx.shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(ctx.config.step_yield) => {}
                }
            }
            StepOutcome::Failed { error, record } => {
                let policy = def.retry_policy.filter(|_| error.retryable);
                match policy {
                    Some(policy) if policy.allows_retry(record.retry_count, ctx.config.step_retry_limit) => {
                        if !ctx
                            .store
                            .rewind_step(&record.id, StepStatus::Failed, record.retry_count)
                            .await?
                        {
                            resuming = true;
                            continue;
                        }
                        info!(
                            instance_id = %instance_id,
                            step_id = %step_id,
                            attempt = record.retry_count + 1,
                            max_retries = policy.effective_max(ctx.config.step_retry_limit),
                            "Retrying step"
                        );
                        tokio::select! {
                            _ = ctx.shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(policy.delay()) => {}
                        }
                    }
                    _ => {
                        let message = format!("step '{}' failed: {}", step_id, error.error);
                        return fail_instance(ctx, &instance, &message).await;
                    }
                }
            }
            StepOutcome::Suspended { waiting_for, spawned } => {
                debug!(instance_id = %instance_id, step_id = %step_id, waiting_for = %waiting_for, "Yielding worker");
                if let Some(child_id) = spawned {
                    if let Err(e) = ctx.scheduler.queue(&child_id) {
                        // The sweep picks up pending children.
                        warn!(child_instance_id = %child_id, error = %e, "Failed to queue subflow instance");
                    }
                }
                return Ok(());
            }
            StepOutcome::Superseded => {
                debug!(instance_id = %instance_id, step_id = %step_id, "Step result superseded, re-reading record");
                resuming = true;
            }
            StepOutcome::Interrupted => return Ok(()),
        }
    }
}

/// Decide what to do with an existing record of the step being re-entered.
async fn resume(
    ctx: &EngineContext,
    instance: &mut Instance,
    def: &StepDefinition,
) -> Result<StepOutcome, CoreError> {
    let mut reconciled = false;

    loop {
        let Some(record) = ctx.store.find_step(&instance.id, &def.id).await? else {
            return ctx.executor.execute(instance, def).await;
        };

        match record.status {
            StepStatus::Completed | StepStatus::Skipped => {
                debug!(instance_id = %instance.id, step_id = %def.id, "Reusing finished step");
                return Ok(StepOutcome::Completed(StepResult {
                    success: record.matched(),
                    data: record.output_data.clone(),
                    error: None,
                }));
            }
            StepStatus::Failed => {
                let error = record
                    .error_data
                    .clone()
                    .unwrap_or_else(|| StepError::fatal("step failed"));
                return Ok(StepOutcome::Failed { error, record });
            }
            StepStatus::Pending => return ctx.executor.execute(instance, def).await,
            StepStatus::Running => match record.waiting_for.as_deref() {
                None => return ctx.executor.execute(instance, def).await,
                // Timers do not survive a restart; the wait starts over.
                Some(key) if key.starts_with(TIMER_KEY_PREFIX) => {
                    return ctx.executor.execute(instance, def).await;
                }
                Some(key) => {
                    if !reconciled {
                        if let Some(child_id) = key.strip_prefix(SUBFLOW_KEY_PREFIX) {
                            if reconcile_subflow(ctx, instance, child_id).await? {
                                reconciled = true;
                                continue;
                            }
                        }
                    }
                    return Ok(StepOutcome::Suspended {
                        waiting_for: key.to_string(),
                        spawned: None,
                    });
                }
            },
        }
    }
}

/// Resolve a parent step whose child already finished. Returns `true` if the
/// parent step is no longer suspended.
async fn reconcile_subflow(
    ctx: &EngineContext,
    parent: &Instance,
    child_id: &str,
) -> Result<bool, CoreError> {
    match ctx.store.get_instance_status(child_id).await? {
        Some(status) if status.is_terminal() => {
            let resolution = child_resolution(ctx, child_id, status).await?;
            ctx.store
                .resolve_waiting_step(&parent.id, &subflow_key(child_id), &resolution)
                .await?;
            Ok(true)
        }
        Some(_) => Ok(false),
        None => {
            let resolution = StepResolution::failed(
                JsonMap::new(),
                StepError::fatal(format!("subflow instance '{}' not found", child_id)),
            );
            ctx.store
                .resolve_waiting_step(&parent.id, &subflow_key(child_id), &resolution)
                .await?;
            Ok(true)
        }
    }
}

async fn load_schema(
    ctx: &EngineContext,
    instance: &Instance,
) -> Result<Result<WorkflowSchema, String>, CoreError> {
    let Some(template) = ctx.store.get_template(&instance.template_id).await? else {
        return Ok(Err(CoreError::TemplateNotFound {
            template_id: instance.template_id.clone(),
        }
        .to_string()));
    };

    if let Err(reason) = template.schema.validate() {
        return Ok(Err(CoreError::InvalidSchema {
            template_id: template.id.clone(),
            reason,
        }
        .to_string()));
    }

    Ok(Ok(template.schema))
}

async fn complete_instance(ctx: &EngineContext, instance: &Instance) -> Result<(), CoreError> {
    if ctx.store.complete_instance_if_running(&instance.id).await? {
        info!(instance_id = %instance.id, "Instance completed");
        notify_parent(ctx, &instance.id, InstanceStatus::Completed).await?;
    }
    Ok(())
}

async fn fail_instance(
    ctx: &EngineContext,
    instance: &Instance,
    message: &str,
) -> Result<(), CoreError> {
    if ctx.store.fail_instance_if_running(&instance.id, message).await? {
        warn!(instance_id = %instance.id, error = %message, "Instance failed");
        notify_parent(ctx, &instance.id, InstanceStatus::Failed).await?;
    }
    Ok(())
}

async fn child_resolution(
    ctx: &EngineContext,
    child_id: &str,
    status: InstanceStatus,
) -> Result<StepResolution, CoreError> {
    let child = ctx.store.get_instance(child_id).await?;

    let mut output = JsonMap::new();
    output.insert("child_instance_id".to_string(), json!(child_id));
    output.insert("status".to_string(), json!(status.as_str()));

    if status == InstanceStatus::Completed {
        if let Some(child) = child {
            output.insert("variables".to_string(), json!(child.variables));
        }
        return Ok(StepResolution::completed(output));
    }

    let message = child
        .and_then(|c| c.error_message)
        .map(|e| format!("subflow instance '{}' {}: {}", child_id, status, e))
        .unwrap_or_else(|| format!("subflow instance '{}' {}", child_id, status));
    Ok(StepResolution::failed(output, StepError::fatal(message)))
}

/// Resolve the parent's subflow step once a child is terminal, then wake the
/// parent. Idempotent: only a still-suspended step is resolved.
async fn notify_parent(
    ctx: &EngineContext,
    child_id: &str,
    status: InstanceStatus,
) -> Result<(), CoreError> {
    let Some(child) = ctx.store.get_instance(child_id).await? else {
        return Ok(());
    };
    let (Some(parent_id), Some(parent_step)) = (&child.parent_instance_id, &child.parent_step_id)
    else {
        return Ok(());
    };

    let resolution = child_resolution(ctx, child_id, status).await?;
    if !ctx
        .store
        .resolve_waiting_step(parent_id, &subflow_key(child_id), &resolution)
        .await?
    {
        return Ok(());
    }

    info!(
        instance_id = %parent_id,
        step_id = %parent_step,
        child_instance_id = %child_id,
        status = %status,
        "Subflow finished, resuming parent"
    );

    let event = WorkflowEvent::step_completed(
        parent_id,
        parent_step,
        resolution.error.is_none(),
        resolution.error.as_ref().map(|e| e.error.clone()),
    );
    if let Err(e) = ctx.bus.publish(&event).await {
        warn!(error = %e, "Failed to publish subflow completion");
    }
    if let Err(e) = ctx.scheduler.queue(parent_id) {
        warn!(instance_id = %parent_id, error = %e, "Failed to queue parent instance");
    }
    Ok(())
}
