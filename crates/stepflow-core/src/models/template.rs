// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Templates and the step graph they carry.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JsonMap, new_id};

/// A published workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Template {
    /// Unique identifier.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional grouping label.
    pub category: Option<String>,
    /// Semantic version string.
    pub version: String,
    /// The step graph.
    #[sqlx(json)]
    pub schema: WorkflowSchema,
    /// Arbitrary metadata.
    #[sqlx(json)]
    pub metadata: JsonMap,
    /// Inactive templates cannot spawn new instances.
    pub is_active: bool,
    /// Who created the template.
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Create a new active template at version `1.0.0`.
    pub fn new(name: impl Into<String>, schema: WorkflowSchema) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            category: None,
            version: "1.0.0".to_string(),
            schema,
            metadata: JsonMap::new(),
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ordered set of step definitions with an optional explicit entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchema {
    /// Step definitions, in declaration order.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Entry step id; the first declared step when absent.
    #[serde(default, alias = "entry_point", skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl WorkflowSchema {
    /// Build a schema from steps, entering at the first one.
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self { steps, entry: None }
    }

    /// Look up a step definition by id.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// The id of the first step to execute, `None` for an empty schema.
    pub fn entry_step_id(&self) -> Option<&str> {
        match &self.entry {
            Some(entry) => Some(entry.as_str()),
            None => self.steps.first().map(|step| step.id.as_str()),
        }
    }

    /// Check that every referenced step id exists and ids are unique.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err("step with empty id".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
        }

        if let Some(entry) = &self.entry
            && !seen.contains(entry.as_str())
        {
            return Err(format!("entry point '{}' is not a step", entry));
        }

        for step in &self.steps {
            for next in &step.next {
                if !seen.contains(next.as_str()) {
                    return Err(format!(
                        "step '{}' references unknown next step '{}'",
                        step.id, next
                    ));
                }
            }
        }

        Ok(())
    }
}

/// One node of a template's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the template.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Step type.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Type specific configuration.
    #[serde(default)]
    pub config: JsonMap,
    /// Successor step ids.
    #[serde(default, rename = "next_steps", alias = "next", skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
    /// Predicates for `condition` steps (AND semantics).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StepCondition>,
    /// Retry policy for timeouts and transient failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl StepDefinition {
    /// Create a step with an empty configuration.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            config: JsonMap::new(),
            next: Vec::new(),
            conditions: Vec::new(),
            retry_policy: None,
        }
    }

    /// Set a configuration key.
    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// Append successor step ids.
    pub fn then<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next.extend(next.into_iter().map(Into::into));
        self
    }

    /// Append a predicate.
    pub fn with_condition(
        mut self,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.conditions.push(StepCondition {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }

    /// Attach a retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Resolve the successor after this step ran with the given predicate outcome.
    ///
    /// Only `condition` steps branch: index 0 on success, index 1 on failure.
    /// A failing condition without a second entry ends the workflow.
    pub fn next_step(&self, success: bool) -> Option<&str> {
        if self.step_type == StepType::Condition {
            let index = if success { 0 } else { 1 };
            return self.next.get(index).map(String::as_str);
        }
        self.next.first().map(String::as_str)
    }
}

/// Closed set of step types with a single fallback for anything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    /// Dispatch to a named action.
    Action,
    /// Evaluate predicates against the variables.
    Condition,
    /// Fan out inline actions concurrently.
    Parallel,
    /// Sleep or wait for an external event.
    Wait,
    /// Run a child instance of another template.
    Subflow,
    /// Any type this engine does not know; fails as a configuration error.
    Unknown(String),
}

impl StepType {
    /// The stored representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Wait => "wait",
            Self::Subflow => "subflow",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "action" => Self::Action,
            "condition" => Self::Condition,
            "parallel" => Self::Parallel,
            "wait" => Self::Wait,
            "subflow" => Self::Subflow,
            _ => Self::Unknown(value),
        }
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(field, operator, value)` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Variable name.
    pub field: String,
    /// Comparison operator.
    pub operator: ConditionOperator,
    /// Right-hand operand.
    #[serde(default)]
    pub value: Value,
}

/// Predicate operators. Unknown operators evaluate to false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    /// `eq` / `equals`
    Equals,
    /// `ne` / `not_equals`
    NotEquals,
    /// `gt` / `greater_than`, numbers only.
    GreaterThan,
    /// `lt` / `less_than`, numbers only.
    LessThan,
    /// Substring test, strings only.
    Contains,
    /// Unrecognized operator.
    Unknown(String),
}

impl ConditionOperator {
    /// Canonical short name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Equals => "eq",
            Self::NotEquals => "ne",
            Self::GreaterThan => "gt",
            Self::LessThan => "lt",
            Self::Contains => "contains",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for ConditionOperator {
    fn from(value: String) -> Self {
        match value.as_str() {
            "eq" | "equals" => Self::Equals,
            "ne" | "not_equals" => Self::NotEquals,
            "gt" | "greater_than" => Self::GreaterThan,
            "lt" | "less_than" => Self::LessThan,
            "contains" => Self::Contains,
            _ => Self::Unknown(value),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(value: ConditionOperator) -> Self {
        value.as_str().to_string()
    }
}

/// Retry policy attached to a step definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay between attempts, in seconds.
    #[serde(default)]
    pub delay: u64,
}

impl RetryPolicy {
    /// Policy with `max_retries` and no delay.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: 0,
        }
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    /// `max_retries` clamped to the engine-wide limit.
    pub fn effective_max(&self, limit: u32) -> u32 {
        self.max_retries.min(limit)
    }

    /// Whether another attempt is allowed after `retry_count` rewinds.
    pub fn allows_retry(&self, retry_count: i32, limit: u32) -> bool {
        retry_count >= 0 && (retry_count as u32) < self.effective_max(limit)
    }
}
