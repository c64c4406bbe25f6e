// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepflow-core engine tests.
//!
//! Engines run against an in-memory SQLite store with short intervals so the
//! scenarios finish in well under a second each.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use stepflow_core::actions::{Action, ActionContext, ActionError, ActionOutput, ActionRegistry};
use stepflow_core::engine::Engine;
use stepflow_core::models::{
    Instance, InstanceStatus, JsonMap, StepDefinition, StepRecord, Template, WorkflowSchema,
};
use stepflow_core::persistence::{Persistence, SqlitePersistence};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn memory_store() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory store"),
    )
}

/// Engine with millisecond-scale intervals and the given extra actions.
pub async fn start_engine(store: Arc<dyn Persistence>, actions: ActionRegistry) -> Engine {
    Engine::builder()
        .persistence(store)
        .actions(actions)
        .check_interval(Duration::from_millis(50))
        .step_yield(Duration::from_millis(1))
        .build()
        .expect("Failed to build engine")
        .start()
        .await
        .expect("Failed to start engine")
}

pub async fn insert_template(store: &Arc<dyn Persistence>, steps: Vec<StepDefinition>) -> Template {
    let template = Template::new("test-template", WorkflowSchema::new(steps));
    store
        .insert_template(&template)
        .await
        .expect("Failed to insert template");
    template
}

/// Insert a pending instance of `template` with the given variables.
pub async fn create_instance(
    store: &Arc<dyn Persistence>,
    template: &Template,
    variables: Value,
) -> Instance {
    let instance = Instance::new(&template.id, "test-instance")
        .with_variables(to_map(variables));
    store
        .insert_instance(&instance)
        .await
        .expect("Failed to insert instance");
    instance
}

pub fn to_map(value: Value) -> JsonMap {
    value.as_object().cloned().unwrap_or_default()
}

/// Poll until the instance reaches `status`.
pub async fn wait_for_status(
    store: &Arc<dyn Persistence>,
    instance_id: &str,
    status: InstanceStatus,
) -> Instance {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let instance = store
            .get_instance(instance_id)
            .await
            .expect("Failed to read instance")
            .expect("Instance disappeared");
        if instance.status == status {
            return instance;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "Instance {} stuck in {} (current step {:?}, error {:?}), expected {}",
                instance_id, instance.status, instance.current_step, instance.error_message, status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until a step record satisfies `check`.
pub async fn wait_for_step<F>(
    store: &Arc<dyn Persistence>,
    instance_id: &str,
    step_id: &str,
    check: F,
) -> StepRecord
where
    F: Fn(&StepRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(record) = store
            .find_step(instance_id, step_id)
            .await
            .expect("Failed to read step")
        {
            if check(&record) {
                return record;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Step {} of {} never reached the expected state", step_id, instance_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Step ids that have a record, in creation order.
pub async fn executed_steps(store: &Arc<dyn Persistence>, instance_id: &str) -> Vec<String> {
    store
        .list_steps(instance_id)
        .await
        .expect("Failed to list steps")
        .into_iter()
        .map(|s| s.step_id)
        .collect()
}

/// Test action that counts executions.
///
/// Fails transiently for the first `fail_first` runs and sleeps `delay` per run.
#[derive(Clone)]
pub struct CountingAction {
    pub name: &'static str,
    pub runs: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub fail_first: usize,
    pub delay: Duration,
}

impl CountingAction {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            runs: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_first(mut self, runs: usize) -> Self {
        self.fail_first = runs;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for CountingAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, _config: &JsonMap) -> Result<(), ActionError> {
        Ok(())
    }

    async fn execute(&self, _ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if run <= self.fail_first {
            return Err(ActionError::Failed(format!("{} attempt {} failed", self.name, run)));
        }

        let mut data = JsonMap::new();
        data.insert("run".to_string(), json!(run));
        Ok(ActionOutput::new(data))
    }
}

/// Registry with the built-ins plus `actions`.
pub fn registry(actions: &[&CountingAction]) -> ActionRegistry {
    let mut registry = ActionRegistry::with_builtins();
    for action in actions {
        registry.register((*action).clone());
    }
    registry
}

#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

#[macro_export]
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        }
    };
}
