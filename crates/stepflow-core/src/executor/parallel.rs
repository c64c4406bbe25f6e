// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent fan-out for `parallel` steps.
//!
//! Sub-tasks are inline action configs. All of them run concurrently inside
//! the owning worker; the step succeeds only if every task succeeds.

use futures::future::join_all;
use serde_json::{Value, json};

use crate::actions::{ActionContext, ActionError, ActionRegistry};
use crate::models::{Instance, JsonMap};

/// Outcome of a fan-out.
#[derive(Debug)]
pub(crate) struct ParallelOutcome {
    /// Per-task report keyed by task id.
    pub data: JsonMap,
    /// Updates from successful tasks in declaration order.
    pub variable_updates: Option<JsonMap>,
    /// First failure, if any task failed.
    pub failure: Option<ActionError>,
}

struct Task<'a> {
    id: String,
    config: &'a JsonMap,
}

fn tasks(config: &JsonMap) -> Result<Vec<Task<'_>>, ActionError> {
    let raw = config
        .get("parallel_steps")
        .or_else(|| config.get("tasks"))
        .and_then(Value::as_array)
        .ok_or_else(|| ActionError::InvalidConfig("parallel_steps not specified".to_string()))?;

    if raw.is_empty() {
        return Err(ActionError::InvalidConfig("no parallel steps defined".to_string()));
    }

    raw.iter()
        .enumerate()
        .map(|(index, entry)| {
            let config = entry.as_object().ok_or_else(|| {
                ActionError::InvalidConfig(format!("parallel step {} must be an object", index))
            })?;
            let id = config
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("parallel_{}", index));
            Ok(Task { id, config })
        })
        .collect()
}

/// Validate every task up front, then run them all concurrently.
pub(crate) async fn run(
    registry: &ActionRegistry,
    instance: &Instance,
    config: &JsonMap,
) -> Result<ParallelOutcome, ActionError> {
    let tasks = tasks(config)?;

    for task in &tasks {
        let action = registry.resolve(task.config).map_err(|e| {
            ActionError::InvalidConfig(format!("parallel step '{}': {}", task.id, e))
        })?;
        action.validate(task.config).map_err(|e| {
            ActionError::InvalidConfig(format!("parallel step '{}': {}", task.id, e))
        })?;
    }

    let results = join_all(tasks.iter().map(|task| async move {
        let ctx = ActionContext {
            instance_id: &instance.id,
            step_id: &task.id,
            variables: &instance.variables,
            context: &instance.context,
            config: task.config,
        };
        registry.dispatch(&ctx).await
    }))
    .await;

    let mut data = JsonMap::new();
    let mut updates = JsonMap::new();
    let mut failure = None;
    let mut failed = 0usize;

    for (task, result) in tasks.iter().zip(results) {
        let entry = match result {
            Ok(output) => {
                if let Some(task_updates) = output.variable_updates {
                    updates.extend(task_updates);
                }
                json!({"status": "completed", "data": output.data})
            }
            Err(e) => {
                failed += 1;
                let entry = json!({"status": "failed", "error": e.to_string()});
                failure.get_or_insert(e);
                entry
            }
        };
        data.insert(task.id.clone(), entry);
    }

    let failure = failure.map(|first| {
        let message = format!("{} of {} parallel steps failed: {}", failed, tasks.len(), first);
        match first {
            ActionError::InvalidConfig(_) => ActionError::InvalidConfig(message),
            ActionError::Failed(_) => ActionError::Failed(message),
        }
    });

    Ok(ParallelOutcome {
        data,
        variable_updates: (!updates.is_empty()).then_some(updates),
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::actions::{Action, ActionOutput};

    struct Sleepy {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Action for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn validate(&self, _config: &JsonMap) -> Result<(), ActionError> {
            Ok(())
        }

        async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if ctx.config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return Err(ActionError::Failed("sleepy failed".to_string()));
            }
            Ok(ActionOutput::default())
        }
    }

    fn config(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> (ActionRegistry, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::with_builtins();
        registry.register(Sleepy {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        (registry, peak)
    }

    #[tokio::test]
    async fn test_tasks_run_concurrently() {
        let (registry, peak) = registry();
        let instance = Instance::new("tpl", "fan-out");
        let cfg = config(json!({"parallel_steps": [
            {"action": "sleepy"}, {"action": "sleepy"}, {"action": "sleepy"}
        ]}));

        let started = Instant::now();
        let outcome = run(&registry, &instance, &cfg).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(290));
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.data["parallel_0"]["status"], "completed");
        assert_eq!(outcome.data.len(), 3);
    }

    #[tokio::test]
    async fn test_any_failure_fails_the_step() {
        let (registry, _) = registry();
        let instance = Instance::new("tpl", "fan-out");
        let cfg = config(json!({"tasks": [
            {"id": "ok", "action": "update_variables", "updates": {"a": 1}},
            {"id": "bad", "action": "sleepy", "fail": true}
        ]}));

        let outcome = run(&registry, &instance, &cfg).await.unwrap();
        let failure = outcome.failure.unwrap();
        assert!(failure.is_retryable());
        assert_eq!(failure.to_string(), "1 of 2 parallel steps failed: sleepy failed");
        assert_eq!(outcome.data["ok"]["status"], "completed");
        assert_eq!(outcome.data["bad"]["error"], "sleepy failed");
        assert_eq!(outcome.variable_updates.unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn test_invalid_task_rejected_before_anything_runs() {
        let (registry, peak) = registry();
        let instance = Instance::new("tpl", "fan-out");
        let cfg = config(json!({"parallel_steps": [
            {"action": "sleepy"},
            {"id": "broken", "action": "log_message"}
        ]}));

        let err = run(&registry, &instance, &cfg).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "parallel step 'broken': message not specified for log"
        );
        assert_eq!(peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_fan_out_is_config_error() {
        let (registry, _) = registry();
        let instance = Instance::new("tpl", "fan-out");
        let err = run(&registry, &instance, &config(json!({"parallel_steps": []})))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
