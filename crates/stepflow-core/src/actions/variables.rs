// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `update_variables` action: the only action that changes instance state.

use async_trait::async_trait;
use serde_json::Value;

use super::{Action, ActionContext, ActionError, ActionOutput};
use crate::models::JsonMap;

/// Merges `config.updates` into the instance variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateVariablesAction;

fn updates(config: &JsonMap) -> Result<&JsonMap, ActionError> {
    config
        .get("updates")
        .and_then(Value::as_object)
        .ok_or_else(|| ActionError::InvalidConfig("updates not specified for variable update".to_string()))
}

#[async_trait]
impl Action for UpdateVariablesAction {
    fn name(&self) -> &'static str {
        "update_variables"
    }

    fn validate(&self, config: &JsonMap) -> Result<(), ActionError> {
        updates(config).map(|_| ())
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let updates = updates(ctx.config)?.clone();

        let mut data = JsonMap::new();
        data.insert(
            "updated_variables".to_string(),
            Value::Object(updates.clone()),
        );
        Ok(ActionOutput {
            data,
            variable_updates: Some(updates),
        })
    }
}
