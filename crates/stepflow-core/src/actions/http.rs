// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `http_request` action.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Action, ActionContext, ActionError, ActionOutput, optional_str, required_str};
use crate::models::JsonMap;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs an HTTP call. Non-2xx responses are transient failures.
#[derive(Debug, Clone)]
pub struct HttpRequestAction {
    client: reqwest::Client,
}

impl HttpRequestAction {
    /// Use a caller-provided client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequestAction {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

fn parse_method(raw: &str) -> Result<reqwest::Method, ActionError> {
    reqwest::Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| ActionError::InvalidConfig(format!("invalid HTTP method: {}", raw)))
}

#[async_trait]
impl Action for HttpRequestAction {
    fn name(&self) -> &'static str {
        "http_request"
    }

    fn validate(&self, config: &JsonMap) -> Result<(), ActionError> {
        required_str(config, "url", "url not specified for HTTP request")?;
        parse_method(optional_str(config, "method", "GET"))?;
        if let Some(headers) = config.get("headers")
            && !headers.is_object()
        {
            return Err(ActionError::InvalidConfig(
                "headers must be an object".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let config = ctx.config;
        let url = required_str(config, "url", "url not specified for HTTP request")?;
        let method = parse_method(optional_str(config, "method", "GET"))?;
        let timeout = config
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut request = self.client.request(method.clone(), url).timeout(timeout);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(key.as_str(), value);
            }
        }

        request = match config.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(body)) => request.body(body.clone()),
            Some(body) => request.json(body),
        };

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Failed(format!("HTTP request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Failed(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(ActionError::Failed(format!(
                "HTTP request to {} returned status {}",
                url,
                status.as_u16()
            )));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let mut data = JsonMap::new();
        data.insert("method".to_string(), json!(method.as_str()));
        data.insert("url".to_string(), json!(url));
        data.insert("status_code".to_string(), json!(status.as_u16()));
        data.insert("response".to_string(), body);
        Ok(ActionOutput::new(data))
    }
}
