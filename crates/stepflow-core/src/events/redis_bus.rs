// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis pub/sub event bus.
//!
//! Publishing goes through a shared [`ConnectionManager`]; each subscription
//! opens its own pub/sub connection.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventBus, EventSubscription, SUBSCRIPTION_BUFFER, WorkflowEvent};
use crate::error::CoreError;

/// Event bus backed by a Redis channel.
#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    publisher: ConnectionManager,
    channel: String,
    closed: CancellationToken,
}

impl RedisEventBus {
    /// Connect to `url` and use `channel` for all events.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(|e| CoreError::EventBus {
            operation: "connect".to_string(),
            details: e.to_string(),
        })?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CoreError::EventBus {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
            closed: CancellationToken::new(),
        })
    }

    /// The channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), CoreError> {
        let payload = serde_json::to_string(event).map_err(|e| CoreError::EventBus {
            operation: "publish".to_string(),
            details: e.to_string(),
        })?;

        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(&self.channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventSubscription, CoreError> {
        if self.closed.is_cancelled() {
            return Err(CoreError::EventBus {
                operation: "subscribe".to_string(),
                details: "bus is closed".to_string(),
            });
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let closed = self.closed.clone();
        let channel = self.channel.clone();

        let forwarder = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.on_message());
            loop {
                let msg = tokio::select! {
                    _ = closed.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => {
                            warn!(channel = %channel, "Redis subscription stream ended");
                            break;
                        }
                    },
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable event payload");
                        continue;
                    }
                };

                match serde_json::from_str::<WorkflowEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, payload = %payload, "Malformed workflow event"),
                }
            }
            debug!(channel = %channel, "Redis event subscription closed");
        });

        Ok(EventSubscription::new(rx, forwarder))
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.closed.cancel();
        Ok(())
    }
}
