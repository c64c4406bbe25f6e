// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `log_message` action.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{Action, ActionContext, ActionError, ActionOutput, optional_str, required_str};
use crate::models::JsonMap;

/// Emits a tracing event at the configured level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessageAction;

#[async_trait]
impl Action for LogMessageAction {
    fn name(&self) -> &'static str {
        "log_message"
    }

    fn validate(&self, config: &JsonMap) -> Result<(), ActionError> {
        required_str(config, "message", "message not specified for log")?;
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let message = required_str(ctx.config, "message", "message not specified for log")?;
        let level = optional_str(ctx.config, "level", "info");

        match level {
            "error" => error!(instance_id = %ctx.instance_id, step_id = %ctx.step_id, "{}", message),
            "warn" => warn!(instance_id = %ctx.instance_id, step_id = %ctx.step_id, "{}", message),
            "debug" => debug!(instance_id = %ctx.instance_id, step_id = %ctx.step_id, "{}", message),
            _ => info!(instance_id = %ctx.instance_id, step_id = %ctx.step_id, "{}", message),
        }

        let mut data = JsonMap::new();
        data.insert("message".to_string(), json!(message));
        data.insert("level".to_string(), json!(level));
        data.insert("logged".to_string(), json!(true));
        Ok(ActionOutput::new(data))
    }
}
