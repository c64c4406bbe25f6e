// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus on a tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventBus, EventSubscription, SUBSCRIPTION_BUFFER, WorkflowEvent};
use crate::error::CoreError;

/// Single-process bus. Used when no Redis URL is configured and in tests.
#[derive(Clone)]
pub struct LocalEventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    closed: CancellationToken,
}

impl LocalEventBus {
    /// Create a bus whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            closed: CancellationToken::new(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), CoreError> {
        if self.closed.is_cancelled() {
            return Err(CoreError::EventBus {
                operation: "publish".to_string(),
                details: "bus is closed".to_string(),
            });
        }
        // No receivers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventSubscription, CoreError> {
        if self.closed.is_cancelled() {
            return Err(CoreError::EventBus {
                operation: "subscribe".to_string(),
                details: "bus is closed".to_string(),
            });
        }
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let closed = self.closed.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    received = source.recv() => match received {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Local event subscription closed");
        });

        Ok(EventSubscription::new(rx, forwarder))
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.closed.cancel();
        Ok(())
    }
}
