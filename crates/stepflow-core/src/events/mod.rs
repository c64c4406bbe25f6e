// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event bus: step-completion and external-trigger signals.
//!
//! Delivery is at-least-once with no ordering across instances. Consumers
//! must be idempotent; the engine's listener only re-queues instances and
//! resolves waits through conditional updates, so duplicates are harmless.

mod local;
mod redis_bus;

pub use self::local::LocalEventBus;
pub use self::redis_bus::RedisEventBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::models::JsonMap;

/// Buffered events per subscription before the forwarder applies backpressure.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;

/// Kind of event carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A step finished (or a child instance resolved its parent's step).
    StepCompleted,
    /// An external event fired; wakes `wait` steps listening for it.
    WorkflowTriggered,
    /// Anything else; logged and ignored.
    #[serde(other)]
    Unknown,
}

/// Envelope published on the bus channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Instance the event concerns. Absent for broadcast triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Step definition id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// External event name for `workflow_triggered`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Step outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Step error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Extra payload; for triggers it becomes the wait step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
}

impl WorkflowEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            instance_id: None,
            step_id: None,
            event: None,
            timestamp: chrono::Utc::now().timestamp(),
            success: None,
            error: None,
            data: None,
        }
    }

    /// A `step_completed` event for `instance_id`/`step_id`.
    pub fn step_completed(
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            step_id: Some(step_id.into()),
            success: Some(success),
            error,
            ..Self::new(EventType::StepCompleted)
        }
    }

    /// A `workflow_triggered` event for the external event `name`.
    pub fn triggered(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            ..Self::new(EventType::WorkflowTriggered)
        }
    }

    /// Scope the event to one instance.
    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: JsonMap) -> Self {
        self.data = Some(data);
        self
    }
}

/// A live subscription. Dropping it stops the forwarding task.
pub struct EventSubscription {
    rx: mpsc::Receiver<WorkflowEvent>,
    forwarder: JoinHandle<()>,
}

impl EventSubscription {
    pub(crate) fn new(rx: mpsc::Receiver<WorkflowEvent>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Next event, or `None` once the bus is closed or the connection is lost.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Publish/subscribe contract.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `event` to every subscriber.
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), CoreError>;

    /// Open a new subscription on the channel.
    async fn subscribe(&self) -> Result<EventSubscription, CoreError>;

    /// End all subscriptions. Further publishes may fail.
    async fn close(&self) -> Result<(), CoreError>;
}
