// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonMap, new_id};

text_enum! {
    /// Instance lifecycle state.
    ///
    /// ```text
    /// pending ──► running ──► completed
    ///                │  ▲ └──► failed
    ///                ▼  │
    ///              paused      (any non-terminal) ──► cancelled
    /// ```
    InstanceStatus, "instance status" {
        /// Created, not yet picked up by a worker.
        Pending => "pending",
        /// A worker is advancing it or it is suspended on a wait.
        Running => "running",
        /// Reached a terminal step successfully.
        Completed => "completed",
        /// A step failed permanently.
        Failed => "failed",
        /// Cancelled by an operator.
        Cancelled => "cancelled",
        /// Suspended by an operator.
        Paused => "paused",
    }
}

impl InstanceStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One execution of a template.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    /// Unique identifier.
    pub id: String,
    /// Template this instance executes.
    pub template_id: String,
    /// Human readable name.
    pub name: String,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: InstanceStatus,
    /// Mutable variable bag read by conditions and written by actions.
    #[sqlx(json)]
    pub variables: JsonMap,
    /// Immutable input context.
    #[sqlx(json)]
    pub context: JsonMap,
    /// The step currently being executed, `None` before the first step.
    pub current_step: Option<String>,
    /// Parent instance when spawned by a subflow step.
    pub parent_instance_id: Option<String>,
    /// The parent's subflow step id.
    pub parent_step_id: Option<String>,
    /// First transition to running.
    pub started_at: Option<DateTime<Utc>>,
    /// Transition to a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason for failed instances.
    pub error_message: Option<String>,
    /// Who created the instance.
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// A new pending instance of `template_id` with empty variables.
    pub fn new(template_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            template_id: template_id.into(),
            name: name.into(),
            status: InstanceStatus::Pending,
            variables: JsonMap::new(),
            context: JsonMap::new(),
            current_step: None,
            parent_instance_id: None,
            parent_step_id: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the initial variables.
    pub fn with_variables(mut self, variables: JsonMap) -> Self {
        self.variables = variables;
        self
    }

    /// Replace the input context.
    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    /// Link this instance to the subflow step that spawned it.
    pub fn with_parent(mut self, parent_instance_id: &str, parent_step_id: &str) -> Self {
        self.parent_instance_id = Some(parent_instance_id.to_string());
        self.parent_step_id = Some(parent_step_id.to_string());
        self
    }

    /// Whether a subflow step spawned this instance.
    pub fn is_child(&self) -> bool {
        self.parent_instance_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
            InstanceStatus::Paused,
        ] {
            let parsed: InstanceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        let err = InstanceStatus::try_from("exploded".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "unknown instance status 'exploded'");
    }

    #[test]
    fn test_terminal_states() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_instance_defaults() {
        let instance = Instance::new("tpl", "order-42").with_parent("p-1", "sub");
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(instance.current_step.is_none());
        assert!(instance.is_child());
        assert_eq!(instance.parent_step_id.as_deref(), Some("sub"));
    }
}
