// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action sub-types for `action` steps.
//!
//! An action step names its action in `config.action`. The registry looks the
//! name up, the action validates its required keys, then executes. Validation
//! failures are configuration errors and are never retried.
//!
//! | Action | Required keys | Optional keys |
//! |--------|---------------|---------------|
//! | `http_request` | `url` | `method`, `headers`, `body`, `timeout_secs` |
//! | `send_email` | `to` | `subject`, `body` |
//! | `log_message` | `message` | `level` |
//! | `update_variables` | `updates` | |

mod email;
mod http;
mod log;
mod variables;

pub use self::email::{EmailMessage, Mailer, SendEmailAction, TracingMailer};
pub use self::http::HttpRequestAction;
pub use self::log::LogMessageAction;
pub use self::variables::UpdateVariablesAction;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::models::{JsonMap, StepDefinition, StepType, WorkflowSchema};

/// Config key naming the action of an `action` step.
pub const ACTION_KEY: &str = "action";

/// Action-level failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Missing or malformed configuration. Not retryable.
    #[error("{0}")]
    InvalidConfig(String),

    /// The underlying call failed. Retryable under the step's policy.
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    /// Whether a retry could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Everything an action can see while it runs.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    /// Owning instance.
    pub instance_id: &'a str,
    /// Step definition id (or parallel sub-task id).
    pub step_id: &'a str,
    /// Instance variables at the start of the step.
    pub variables: &'a JsonMap,
    /// Instance input context.
    pub context: &'a JsonMap,
    /// The action's configuration.
    pub config: &'a JsonMap,
}

/// Successful action result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    /// Recorded as the step's output.
    pub data: JsonMap,
    /// Keys to merge into the instance variables.
    pub variable_updates: Option<JsonMap>,
}

impl ActionOutput {
    /// Output without variable updates.
    pub fn new(data: JsonMap) -> Self {
        Self {
            data,
            variable_updates: None,
        }
    }
}

/// A named action implementation.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key, e.g. `http_request`.
    fn name(&self) -> &'static str;

    /// Check required configuration keys before anything runs.
    fn validate(&self, config: &JsonMap) -> Result<(), ActionError>;

    /// Perform the action.
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError>;
}

/// Capability-keyed set of actions.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<&'static str, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in actions with a default HTTP client and a logging mailer.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(HttpRequestAction::default());
        registry.register(SendEmailAction::new(Arc::new(TracingMailer)));
        registry.register(LogMessageAction);
        registry.register(UpdateVariablesAction);
        registry
    }

    /// Add or replace an action under its name.
    pub fn register<A: Action + 'static>(&mut self, action: A) -> &mut Self {
        self.actions.insert(action.name(), Arc::new(action));
        self
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Resolve `config.action` to a registered action.
    pub fn resolve(&self, config: &JsonMap) -> Result<Arc<dyn Action>, ActionError> {
        let name = config
            .get(ACTION_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidConfig("action type not specified".to_string()))?;

        self.get(name)
            .ok_or_else(|| ActionError::InvalidConfig(format!("unknown action type: {}", name)))
    }

    /// Check an `action` step's configuration without running anything.
    ///
    /// Unknown step types, unknown action names and missing required keys
    /// are reported as [`CoreError::InvalidStepConfig`]. Other step types
    /// are checked when they run.
    pub fn check_step(&self, step: &StepDefinition) -> Result<(), CoreError> {
        let invalid = |message: String| CoreError::InvalidStepConfig {
            step_id: step.id.clone(),
            message,
        };

        match &step.step_type {
            StepType::Action => self
                .resolve(&step.config)
                .and_then(|action| action.validate(&step.config))
                .map_err(|e| invalid(e.to_string())),
            StepType::Unknown(other) => Err(invalid(format!("unknown step type: {}", other))),
            _ => Ok(()),
        }
    }

    /// [`check_step`](Self::check_step) over every step of `schema`, stopping
    /// at the first problem.
    pub fn check_schema(&self, schema: &WorkflowSchema) -> Result<(), CoreError> {
        schema.steps.iter().try_for_each(|step| self.check_step(step))
    }

    /// Resolve, validate and execute the action named in `ctx.config`.
    pub async fn dispatch(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let action = self.resolve(ctx.config)?;
        action.validate(ctx.config)?;
        action.execute(ctx).await
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// A required, non-empty string config value.
pub(crate) fn required_str<'a>(
    config: &'a JsonMap,
    key: &str,
    message: &str,
) -> Result<&'a str, ActionError> {
    match config.get(key).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ActionError::InvalidConfig(message.to_string())),
    }
}

/// An optional string config value with a default.
pub(crate) fn optional_str<'a>(config: &'a JsonMap, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}
