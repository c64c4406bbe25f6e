// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step executor: runs one step definition against one instance.
//!
//! ```text
//!   find/insert record ──► start_step (running)
//!            │
//!            ▼
//!   typed work (action | condition | parallel | wait | subflow)
//!            │
//!   ┌────────┼─────────────┬──────────────┐
//!   ▼        ▼             ▼              ▼
//! completed failed   suspended (running   interrupted
//!                    + waiting_for)       (shutdown)
//! ```
//!
//! Completed and failed records are finalized with a conditional
//! `running -> ...` update. Losing that update means the sweeper rewound or
//! failed the step first, and the result is discarded as
//! [`StepOutcome::Superseded`].

pub mod condition;
mod parallel;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::{ActionContext, ActionError, ActionRegistry};
use crate::error::CoreError;
use crate::events::{EventBus, WorkflowEvent};
use crate::models::{Instance, JsonMap, StepDefinition, StepError, StepRecord, StepStatus, StepType};
use crate::persistence::Persistence;

/// Wake-up key prefix for `wait` steps on external events.
pub const EVENT_KEY_PREFIX: &str = "event:";
/// Wake-up key prefix for `subflow` steps waiting on a child instance.
pub const SUBFLOW_KEY_PREFIX: &str = "subflow:";
/// Marker for `wait` steps sleeping on a timer. Never resolved externally.
pub const TIMER_KEY_PREFIX: &str = "timer:";

/// Wake-up key for an external event.
pub fn event_key(name: &str) -> String {
    format!("{}{}", EVENT_KEY_PREFIX, name)
}

/// Wake-up key for a child instance.
pub fn subflow_key(child_instance_id: &str) -> String {
    format!("{}{}", SUBFLOW_KEY_PREFIX, child_instance_id)
}

/// `{success, data, error?}` result of a finished step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Predicate outcome for conditions; `true` for every other completed step.
    pub success: bool,
    /// Step output.
    pub data: JsonMap,
    /// Error message for failed steps.
    pub error: Option<String>,
}

/// What happened to a step execution.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The record is `completed`.
    Completed(StepResult),
    /// The record is `failed`.
    Failed {
        /// The stored error payload.
        error: StepError,
        /// The record as of the failure (id and retry count).
        record: StepRecord,
    },
    /// The record stays `running` with a wake-up key; the worker should yield.
    Suspended {
        /// The wake-up key.
        waiting_for: String,
        /// Child instance created by a subflow step, to be queued.
        spawned: Option<String>,
    },
    /// Another actor changed the record first; the result was discarded.
    Superseded,
    /// Shutdown interrupted the step; the record is left `running`.
    Interrupted,
}

enum Work {
    Done {
        success: bool,
        data: JsonMap,
        variable_updates: Option<JsonMap>,
    },
    Failed {
        error: ActionError,
        data: JsonMap,
    },
    Suspend {
        waiting_for: String,
        spawned: Option<String>,
    },
    Interrupted,
}

impl From<ActionError> for Work {
    fn from(error: ActionError) -> Self {
        Work::Failed {
            error,
            data: JsonMap::new(),
        }
    }
}

/// Executes step definitions and persists their records.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn Persistence>,
    bus: Arc<dyn EventBus>,
    actions: Arc<ActionRegistry>,
    step_timeout: Duration,
    shutdown: CancellationToken,
}

impl StepExecutor {
    /// Create an executor. `shutdown` interrupts duration waits.
    pub fn new(
        store: Arc<dyn Persistence>,
        bus: Arc<dyn EventBus>,
        actions: Arc<ActionRegistry>,
        step_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            actions,
            step_timeout,
            shutdown,
        }
    }

    /// Actions available to `action` steps.
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Execute `step` for `instance`.
    ///
    /// Variable updates are merged into `instance.variables` and written to
    /// the store before the step record is finalized.
    pub async fn execute(
        &self,
        instance: &mut Instance,
        step: &StepDefinition,
    ) -> Result<StepOutcome, CoreError> {
        let record = match self.store.find_step(&instance.id, &step.id).await? {
            Some(record) => record,
            None => {
                let record = StepRecord::new(
                    &instance.id,
                    &step.id,
                    step.step_type.clone(),
                    step.config.clone(),
                );
                self.store.insert_step(&record).await?;
                record
            }
        };
        let record = self.store.start_step(&record.id).await?;

        debug!(
            instance_id = %instance.id,
            step_id = %step.id,
            step_type = %step.step_type,
            retry_count = record.retry_count,
            "Executing step"
        );

        let work = if step.step_type == StepType::Wait {
            // Waits bound themselves; the timer marker keeps the sweeper off them.
            self.run(instance, step, &record).await
        } else {
            match tokio::time::timeout(self.step_timeout, self.run(instance, step, &record)).await {
                Ok(work) => work,
                Err(_) => {
                    ActionError::Failed(format!("step timed out after {:?}", self.step_timeout))
                        .into()
                }
            }
        };

        match work {
            Work::Done {
                success,
                data,
                variable_updates,
            } => {
                if let Some(updates) = variable_updates {
                    instance.variables.extend(updates);
                    self.store
                        .set_instance_variables(&instance.id, &instance.variables)
                        .await?;
                }

                if !self
                    .store
                    .finish_step_if_running(&record.id, StepStatus::Completed, &data, None)
                    .await?
                {
                    return Ok(StepOutcome::Superseded);
                }

                self.publish(WorkflowEvent::step_completed(&instance.id, &step.id, success, None))
                    .await;

                Ok(StepOutcome::Completed(StepResult {
                    success,
                    data,
                    error: None,
                }))
            }
            Work::Failed { error, data } => {
                let stored = StepError {
                    error: error.to_string(),
                    retryable: error.is_retryable(),
                };

                warn!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    retryable = stored.retryable,
                    error = %stored.error,
                    "Step failed"
                );

                if !self
                    .store
                    .finish_step_if_running(&record.id, StepStatus::Failed, &data, Some(&stored))
                    .await?
                {
                    return Ok(StepOutcome::Superseded);
                }

                self.publish(WorkflowEvent::step_completed(
                    &instance.id,
                    &step.id,
                    false,
                    Some(stored.error.clone()),
                ))
                .await;

                Ok(StepOutcome::Failed {
                    error: stored,
                    record,
                })
            }
            Work::Suspend {
                waiting_for,
                spawned,
            } => {
                self.store.set_step_waiting(&record.id, &waiting_for).await?;
                info!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    waiting_for = %waiting_for,
                    "Step suspended"
                );
                Ok(StepOutcome::Suspended {
                    waiting_for,
                    spawned,
                })
            }
            Work::Interrupted => Ok(StepOutcome::Interrupted),
        }
    }

    async fn publish(&self, event: WorkflowEvent) {
        if let Err(e) = self.bus.publish(&event).await {
            warn!(error = %e, "Failed to publish step event");
        }
    }

    async fn run(&self, instance: &Instance, step: &StepDefinition, record: &StepRecord) -> Work {
        match &step.step_type {
            StepType::Action => self.run_action(instance, step).await,
            StepType::Condition => Self::run_condition(instance, step),
            StepType::Parallel => self.run_parallel(instance, step).await,
            StepType::Wait => self.run_wait(step, record).await,
            StepType::Subflow => self.run_subflow(instance, step).await,
            StepType::Unknown(other) => {
                ActionError::InvalidConfig(format!("unknown step type: {}", other)).into()
            }
        }
    }

    async fn run_action(&self, instance: &Instance, step: &StepDefinition) -> Work {
        let ctx = ActionContext {
            instance_id: &instance.id,
            step_id: &step.id,
            variables: &instance.variables,
            context: &instance.context,
            config: &step.config,
        };

        match self.actions.dispatch(&ctx).await {
            Ok(output) => Work::Done {
                success: true,
                data: output.data,
                variable_updates: output.variable_updates,
            },
            Err(e) => e.into(),
        }
    }

    fn run_condition(instance: &Instance, step: &StepDefinition) -> Work {
        let (matched, report) = condition::evaluate_all(&step.conditions, &instance.variables);

        let mut data = JsonMap::new();
        data.insert("matched".to_string(), json!(matched));
        if step.conditions.is_empty() {
            data.insert("reason".to_string(), json!("no conditions defined"));
        } else {
            data.insert("conditions".to_string(), Value::Array(report));
        }

        Work::Done {
            success: matched,
            data,
            variable_updates: None,
        }
    }

    async fn run_parallel(&self, instance: &Instance, step: &StepDefinition) -> Work {
        match parallel::run(&self.actions, instance, &step.config).await {
            Ok(outcome) => match outcome.failure {
                None => Work::Done {
                    success: true,
                    data: outcome.data,
                    variable_updates: outcome.variable_updates,
                },
                Some(error) => Work::Failed {
                    error,
                    data: outcome.data,
                },
            },
            Err(e) => e.into(),
        }
    }

    async fn run_wait(&self, step: &StepDefinition, record: &StepRecord) -> Work {
        let config = &step.config;
        let wait_type = config
            .get("wait_type")
            .and_then(Value::as_str)
            .unwrap_or(if config.contains_key("event") { "event" } else { "duration" });

        match wait_type {
            "event" => match config.get("event").and_then(Value::as_str) {
                Some(name) if !name.is_empty() => Work::Suspend {
                    waiting_for: event_key(name),
                    spawned: None,
                },
                _ => ActionError::InvalidConfig("event not specified for wait".to_string()).into(),
            },
            "duration" => {
                let Some(seconds) = config
                    .get("duration")
                    .and_then(Value::as_f64)
                    .filter(|s| s.is_finite() && *s >= 0.0)
                else {
                    return ActionError::InvalidConfig(
                        "duration not specified for wait".to_string(),
                    )
                    .into();
                };
                let duration = Duration::from_secs_f64(seconds);

                let until = chrono::Utc::now()
                    + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
                let marker = format!("{}{}", TIMER_KEY_PREFIX, until.to_rfc3339());
                if let Err(e) = self.store.set_step_waiting(&record.id, &marker).await {
                    return ActionError::Failed(e.to_string()).into();
                }

                tokio::select! {
                    _ = self.shutdown.cancelled() => Work::Interrupted,
                    _ = tokio::time::sleep(duration) => {
                        let mut data = JsonMap::new();
                        data.insert("waited_secs".to_string(), json!(seconds));
                        Work::Done { success: true, data, variable_updates: None }
                    }
                }
            }
            other => ActionError::InvalidConfig(format!("unknown wait type: {}", other)).into(),
        }
    }

    async fn run_subflow(&self, parent: &Instance, step: &StepDefinition) -> Work {
        let config = &step.config;
        let Some(template_id) = config
            .get("template_id")
            .or_else(|| config.get("subflow_id"))
            .and_then(Value::as_str)
        else {
            return ActionError::InvalidConfig("subflow template not specified".to_string()).into();
        };

        let template = match self.store.get_template(template_id).await {
            Ok(Some(template)) => template,
            Ok(None) => {
                return ActionError::InvalidConfig(format!(
                    "subflow template '{}' not found",
                    template_id
                ))
                .into();
            }
            Err(e) => return ActionError::Failed(e.to_string()).into(),
        };
        if !template.is_active {
            return ActionError::InvalidConfig(format!(
                "subflow template '{}' is not active",
                template_id
            ))
            .into();
        }

        let inherit = config
            .get("inherit_variables")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut variables = if inherit {
            parent.variables.clone()
        } else {
            JsonMap::new()
        };
        if let Some(extra) = config.get("variables").and_then(Value::as_object) {
            variables.extend(extra.clone());
        }

        let mut child = Instance::new(&template.id, format!("{} / {}", parent.name, step.id))
            .with_variables(variables)
            .with_context(parent.context.clone())
            .with_parent(&parent.id, &step.id);
        child.created_by = parent.created_by.clone();

        if let Err(e) = self.store.insert_instance(&child).await {
            return ActionError::Failed(e.to_string()).into();
        }

        info!(
            instance_id = %parent.id,
            step_id = %step.id,
            child_instance_id = %child.id,
            template_id = %template.id,
            "Spawned subflow"
        );

        Work::Suspend {
            waiting_for: subflow_key(&child.id),
            spawned: Some(child.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalEventBus;
    use crate::models::{ConditionOperator, InstanceStatus, RetryPolicy, Template, WorkflowSchema};
    use crate::persistence::SqlitePersistence;

    struct Harness {
        store: Arc<dyn Persistence>,
        executor: StepExecutor,
        instance: Instance,
        shutdown: CancellationToken,
    }

    async fn harness(steps: Vec<StepDefinition>, variables: Value) -> Harness {
        let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let template = Template::new("executor-test", WorkflowSchema::new(steps));
        store.insert_template(&template).await.unwrap();
        let instance = Instance::new(&template.id, "run")
            .with_variables(variables.as_object().cloned().unwrap_or_default());
        store.insert_instance(&instance).await.unwrap();
        store.start_instance(&instance.id).await.unwrap();

        let shutdown = CancellationToken::new();
        let executor = StepExecutor::new(
            store.clone(),
            Arc::new(LocalEventBus::default()),
            Arc::new(ActionRegistry::with_builtins()),
            Duration::from_secs(5),
            shutdown.clone(),
        );
        Harness {
            store,
            executor,
            instance,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_action_step_completes_record() {
        let step = StepDefinition::new("A", StepType::Action)
            .with_config("action", "log_message")
            .with_config("message", "hello");
        let mut h = harness(vec![step.clone()], json!({})).await;

        let outcome = h.executor.execute(&mut h.instance, &step).await.unwrap();
        let StepOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert!(result.success);
        assert_eq!(result.data["logged"], true);

        let record = h.store.find_step(&h.instance.id, "A").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.input_data["message"], "hello");
    }

    #[tokio::test]
    async fn test_update_variables_persists_before_finish() {
        let step = StepDefinition::new("set", StepType::Action)
            .with_config("action", "update_variables")
            .with_config("updates", json!({"approved": true}));
        let mut h = harness(vec![step.clone()], json!({"x": 1})).await;

        h.executor.execute(&mut h.instance, &step).await.unwrap();
        assert_eq!(h.instance.variables["approved"], true);

        let stored = h.store.get_instance(&h.instance.id).await.unwrap().unwrap();
        assert_eq!(stored.variables["approved"], true);
        assert_eq!(stored.variables["x"], 1);
    }

    #[tokio::test]
    async fn test_condition_records_matched() {
        let step = StepDefinition::new("B", StepType::Condition)
            .with_condition("x", ConditionOperator::GreaterThan, 5)
            .then(["C", "D"]);
        let mut h = harness(vec![step.clone()], json!({"x": 1})).await;

        let StepOutcome::Completed(result) = h.executor.execute(&mut h.instance, &step).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert!(!result.success);

        let record = h.store.find_step(&h.instance.id, "B").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert!(!record.matched());
    }

    #[tokio::test]
    async fn test_missing_config_is_non_retryable_failure() {
        let step = StepDefinition::new("mail", StepType::Action)
            .with_config("action", "send_email")
            .with_retry(RetryPolicy::new(3));
        let mut h = harness(vec![step.clone()], json!({})).await;

        let StepOutcome::Failed { error, .. } = h.executor.execute(&mut h.instance, &step).await.unwrap()
        else {
            panic!("expected failure");
        };
        assert!(!error.retryable);
        assert_eq!(error.error, "to address not specified for email");

        let record = h.store.find_step(&h.instance.id, "mail").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error_data, Some(error));
    }

    #[tokio::test]
    async fn test_unknown_step_type_fails() {
        let step = StepDefinition::new("x", StepType::Unknown("script".into()));
        let mut h = harness(vec![step.clone()], json!({})).await;

        let StepOutcome::Failed { error, .. } = h.executor.execute(&mut h.instance, &step).await.unwrap()
        else {
            panic!("expected failure");
        };
        assert_eq!(error.error, "unknown step type: script");
    }

    #[tokio::test]
    async fn test_event_wait_suspends() {
        let step = StepDefinition::new("approval", StepType::Wait)
            .with_config("wait_type", "event")
            .with_config("event", "approved");
        let mut h = harness(vec![step.clone()], json!({})).await;

        let outcome = h.executor.execute(&mut h.instance, &step).await.unwrap();
        let StepOutcome::Suspended { waiting_for, spawned } = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(waiting_for, "event:approved");
        assert!(spawned.is_none());

        let record = h.store.find_step(&h.instance.id, "approval").await.unwrap().unwrap();
        assert!(record.is_suspended());
    }

    #[tokio::test]
    async fn test_duration_wait_sleeps() {
        let step = StepDefinition::new("pause", StepType::Wait).with_config("duration", 0.05);
        let mut h = harness(vec![step.clone()], json!({})).await;

        let started = std::time::Instant::now();
        let outcome = h.executor.execute(&mut h.instance, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let record = h.store.find_step(&h.instance.id, "pause").await.unwrap().unwrap();
        assert!(record.waiting_for.is_none());
    }

    #[tokio::test]
    async fn test_duration_wait_interrupted_by_shutdown() {
        let step = StepDefinition::new("pause", StepType::Wait).with_config("duration", 60);
        let mut h = harness(vec![step.clone()], json!({})).await;

        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.executor.execute(&mut h.instance, &step),
        )
        .await
        .expect("wait should observe shutdown")
        .unwrap();
        assert!(matches!(outcome, StepOutcome::Interrupted));

        let record = h.store.find_step(&h.instance.id, "pause").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_subflow_spawns_linked_child() {
        let mut h = harness(vec![], json!({"order": 7, "secret": "s"})).await;
        let child_template = Template::new(
            "child",
            WorkflowSchema::new(vec![StepDefinition::new("only", StepType::Action)]),
        );
        h.store.insert_template(&child_template).await.unwrap();

        let step = StepDefinition::new("sub", StepType::Subflow)
            .with_config("subflow_id", child_template.id.clone())
            .with_config("variables", json!({"mode": "fast"}));

        let StepOutcome::Suspended { waiting_for, spawned } =
            h.executor.execute(&mut h.instance, &step).await.unwrap()
        else {
            panic!("expected suspension");
        };
        let child_id = spawned.unwrap();
        assert_eq!(waiting_for, format!("subflow:{}", child_id));

        let child = h.store.get_instance(&child_id).await.unwrap().unwrap();
        assert_eq!(child.status, InstanceStatus::Pending);
        assert_eq!(child.parent_instance_id.as_deref(), Some(h.instance.id.as_str()));
        assert_eq!(child.parent_step_id.as_deref(), Some("sub"));
        assert_eq!(child.variables["mode"], "fast");
        assert!(!child.variables.contains_key("order"));
    }

    #[tokio::test]
    async fn test_subflow_unknown_template_is_config_error() {
        let step = StepDefinition::new("sub", StepType::Subflow).with_config("template_id", "nope");
        let mut h = harness(vec![step.clone()], json!({})).await;

        let StepOutcome::Failed { error, .. } = h.executor.execute(&mut h.instance, &step).await.unwrap()
        else {
            panic!("expected failure");
        };
        assert!(!error.retryable);
        assert_eq!(error.error, "subflow template 'nope' not found");
    }

    #[tokio::test]
    async fn test_lost_race_is_superseded() {
        let step = StepDefinition::new("pause", StepType::Wait).with_config("duration", 0.2);
        let mut h = harness(vec![step.clone()], json!({})).await;

        let store = h.store.clone();
        let instance_id = h.instance.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let record = store.find_step(&instance_id, "pause").await.unwrap().unwrap();
            store
                .rewind_step(&record.id, StepStatus::Running, record.retry_count)
                .await
                .unwrap();
        });

        let outcome = h.executor.execute(&mut h.instance, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Superseded));

        let record = h.store.find_step(&h.instance.id, "pause").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.retry_count, 1);
    }
}
