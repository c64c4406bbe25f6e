// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stepflow-core.
//!
//! [`CoreError`] is the engine-level error. Step-level failures never surface
//! as `CoreError`; they are recorded on the step row (see [`crate::actions::ActionError`]).

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the engine, the store and the event bus.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Template was not found in the store.
    TemplateNotFound {
        /// The template ID that was not found.
        template_id: String,
    },

    /// Instance was not found in the store.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// The instance points at a step the template does not define.
    StepNotFound {
        /// The instance being advanced.
        instance_id: String,
        /// The unresolvable step id.
        step_id: String,
    },

    /// The template schema is malformed (dangling `next`, duplicate ids, ...).
    InvalidSchema {
        /// The offending template.
        template_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A step definition carries an invalid or incomplete configuration.
    InvalidStepConfig {
        /// The step definition id.
        step_id: String,
        /// The validation error message.
        message: String,
    },

    /// The scheduler queue is at capacity.
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The engine is shutting down and no longer accepts work.
    ShuttingDown,

    /// Publishing to or subscribing on the event bus failed.
    EventBus {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::InvalidSchema { .. } => "INVALID_SCHEMA",
            Self::InvalidStepConfig { .. } => "INVALID_STEP_CONFIG",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::EventBus { .. } => "EVENT_BUS_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the failure is infrastructural and worth retrying on the next sweep.
    ///
    /// Configuration errors (unknown step, malformed schema, bad config) are
    /// fatal to the instance and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError { .. } | Self::EventBus { .. } | Self::QueueFull { .. }
        )
    }

    /// Whether this error means the instance itself is inconsistent and must fail.
    pub fn is_fatal_to_instance(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound { .. }
                | Self::StepNotFound { .. }
                | Self::InvalidSchema { .. }
                | Self::InvalidStepConfig { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemplateNotFound { template_id } => {
                write!(f, "Template '{}' not found", template_id)
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::StepNotFound {
                instance_id,
                step_id,
            } => {
                write!(
                    f,
                    "Step definition '{}' not found for instance '{}'",
                    step_id, instance_id
                )
            }
            Self::InvalidSchema {
                template_id,
                reason,
            } => {
                write!(
                    f,
                    "Invalid workflow schema in template '{}': {}",
                    template_id, reason
                )
            }
            Self::InvalidStepConfig { step_id, message } => {
                write!(f, "Invalid configuration for step '{}': {}", step_id, message)
            }
            Self::QueueFull { capacity } => {
                write!(f, "Workflow queue is full (capacity {})", capacity)
            }
            Self::ShuttingDown => write!(f, "Workflow engine is shutting down"),
            Self::EventBus { operation, details } => {
                write!(f, "Event bus error during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::EventBus {
            operation: "redis".to_string(),
            details: err.to_string(),
        }
    }
}
