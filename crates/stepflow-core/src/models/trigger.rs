// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Triggers bound to templates.
//!
//! The engine only stores triggers. Spawning instances from them is up to
//! the producer service, which calls [`crate::persistence::Persistence::mark_trigger_fired`]
//! after it starts one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonMap, new_id};

text_enum! {
    /// How a trigger fires.
    TriggerType, "trigger type" {
        /// Started explicitly.
        Manual => "manual",
        /// Started on a cron-like schedule.
        Schedule => "schedule",
        /// Started by a named event.
        Event => "event",
        /// Started by an inbound HTTP call.
        Webhook => "webhook",
        /// Started when a condition on external data holds.
        Condition => "condition",
    }
}

/// A template binding that can start new instances.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trigger {
    /// Unique identifier.
    pub id: String,
    /// Template started by this trigger.
    pub template_id: String,
    /// How the trigger fires.
    #[sqlx(try_from = "String")]
    pub trigger_type: TriggerType,
    /// Type specific configuration, e.g. `{"event": "order.created"}`.
    #[sqlx(json)]
    pub trigger_config: JsonMap,
    /// Inactive triggers are ignored.
    pub is_active: bool,
    /// Last time an instance was started by this trigger.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// A new active trigger.
    pub fn new(template_id: impl Into<String>, trigger_type: TriggerType, config: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            template_id: template_id.into(),
            trigger_type,
            trigger_config: config,
            is_active: true,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The event name an `event` trigger listens for.
    pub fn event_name(&self) -> Option<&str> {
        match self.trigger_type {
            TriggerType::Event => self.trigger_config.get("event").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}
