// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonMap, StepType};

text_enum! {
    /// Step record lifecycle state.
    StepStatus, "step status" {
        /// Created or rewound for retry.
        Pending => "pending",
        /// Executing, or suspended when `waiting_for` is set.
        Running => "running",
        /// Finished successfully; the predicate outcome lives in the output.
        Completed => "completed",
        /// Finished with an error.
        Failed => "failed",
        /// Not executed.
        Skipped => "skipped",
    }
}

impl StepStatus {
    /// Whether the record holds a final outcome.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Error payload stored on failed step records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Human readable message.
    pub error: String,
    /// Whether a retry could succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl StepError {
    /// A non-retryable error.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }

    /// A transient error.
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }
}

/// Execution record of one step definition within one instance.
///
/// At most one record exists per `(instance_id, step_id)`; retries reuse it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Step definition id within the template.
    pub step_id: String,
    /// Copied from the definition.
    #[sqlx(try_from = "String")]
    pub step_type: StepType,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: StepStatus,
    /// Snapshot of the definition's config.
    #[sqlx(json)]
    pub input_data: JsonMap,
    /// Step result, including `matched` for conditions.
    #[sqlx(json)]
    pub output_data: JsonMap,
    /// Set on failure.
    #[sqlx(json)]
    pub error_data: Option<StepError>,
    /// Wake-up key while suspended (`event:<name>` or `subflow:<id>`).
    pub waiting_for: Option<String>,
    /// Times this record was rewound for another attempt.
    pub retry_count: i32,
    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the last attempt.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    /// A new pending record for `step_id` with the definition's config as input.
    pub fn new(
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        step_type: StepType,
        input_data: JsonMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            step_type,
            status: StepStatus::Pending,
            input_data,
            output_data: JsonMap::new(),
            error_data: None,
            waiting_for: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Running with a wake-up key: suspended, not executing.
    pub fn is_suspended(&self) -> bool {
        self.status == StepStatus::Running && self.waiting_for.is_some()
    }

    /// Predicate outcome recorded in the output, `true` when absent.
    pub fn matched(&self) -> bool {
        self.output_data
            .get("matched")
            .and_then(|value| value.as_bool())
            .unwrap_or(true)
    }
}
