// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `send_email` action and the mail delivery seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{Action, ActionContext, ActionError, ActionOutput, optional_str, required_str};
use crate::models::JsonMap;

/// A message handed to the [`Mailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
}

/// Delivers email. Errors are treated as transient.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver `message`.
    async fn send(&self, message: &EmailMessage) -> Result<(), String>;
}

/// Mailer that only logs the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), String> {
        info!(to = %message.to, subject = %message.subject, "Sending email");
        Ok(())
    }
}

/// Sends an email through a [`Mailer`].
#[derive(Clone)]
pub struct SendEmailAction {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailAction {
    /// Deliver through `mailer`.
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Action for SendEmailAction {
    fn name(&self) -> &'static str {
        "send_email"
    }

    fn validate(&self, config: &JsonMap) -> Result<(), ActionError> {
        required_str(config, "to", "to address not specified for email")?;
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let message = EmailMessage {
            to: required_str(ctx.config, "to", "to address not specified for email")?.to_string(),
            subject: optional_str(ctx.config, "subject", "").to_string(),
            body: optional_str(ctx.config, "body", "").to_string(),
        };

        self.mailer
            .send(&message)
            .await
            .map_err(|e| ActionError::Failed(format!("failed to send email to {}: {}", message.to, e)))?;

        let mut data = JsonMap::new();
        data.insert("to".to_string(), json!(message.to));
        data.insert("subject".to_string(), json!(message.subject));
        data.insert("sent".to_string(), json!(true));
        Ok(ActionOutput::new(data))
    }
}
