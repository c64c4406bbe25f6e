// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event listener: turns bus events into queue wake-ups.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::EngineContext;
use crate::error::CoreError;
use crate::events::{EventBus, EventSubscription, EventType, WorkflowEvent};
use crate::executor::event_key;
use crate::persistence::StepResolution;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Consume `subscription` until shutdown.
///
/// A subscription that ends while the engine is still running (a dropped
/// Redis connection, for example) is replaced with a fresh one.
pub(crate) async fn run(ctx: Arc<EngineContext>, mut subscription: EventSubscription) {
    info!("Event listener started");

    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = subscription.recv() => event,
        };

        match event {
            Some(event) => {
                if let Err(e) = handle_event(&ctx, &event).await {
                    error!(event_type = ?event.event_type, error = %e, "Failed to handle event");
                }
            }
            None => {
                warn!("Event subscription ended, re-subscribing");
                match resubscribe(&ctx).await {
                    Some(fresh) => subscription = fresh,
                    None => break,
                }
            }
        }
    }

    info!("Event listener stopped");
}

/// Subscribe again with exponential backoff. `None` once shutdown begins.
async fn resubscribe(ctx: &EngineContext) -> Option<EventSubscription> {
    let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }

        match ctx.bus.subscribe().await {
            Ok(subscription) => {
                info!("Event subscription restored");
                return Some(subscription);
            }
            Err(e) => {
                error!(
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Failed to re-subscribe to event bus"
                );
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
            }
        }
    }
}

/// Apply one event. Unknown event types are ignored.
pub(crate) async fn handle_event(ctx: &EngineContext, event: &WorkflowEvent) -> Result<(), CoreError> {
    match event.event_type {
        EventType::StepCompleted => {
            // A worker that owns the instance already moves it along.
            if let Some(instance_id) = event
                .instance_id
                .as_deref()
                .filter(|id| !ctx.scheduler.is_running(id))
            {
                wake(ctx, instance_id);
            }
        }
        EventType::WorkflowTriggered => {
            let Some(name) = event.event.as_deref().filter(|n| !n.is_empty()) else {
                debug!("Trigger event without a name");
                return Ok(());
            };

            let mut output = event.data.clone().unwrap_or_default();
            output.insert("event".to_string(), json!(name));
            let resolution = StepResolution::completed(output);
            let key = event_key(name);

            match &event.instance_id {
                Some(instance_id) => {
                    if ctx
                        .store
                        .resolve_waiting_step(instance_id, &key, &resolution)
                        .await?
                    {
                        info!(instance_id = %instance_id, event = %name, "Event resolved waiting step");
                    }
                    wake(ctx, instance_id);
                }
                None => {
                    let woken = ctx.store.resolve_waiting_steps(&key, &resolution).await?;
                    info!(event = %name, instances = woken.len(), "Event broadcast to waiting steps");
                    for instance_id in &woken {
                        wake(ctx, instance_id);
                    }
                }
            }
        }
        EventType::Unknown => debug!("Ignoring unknown event type"),
    }
    Ok(())
}

fn wake(ctx: &EngineContext, instance_id: &str) {
    if let Err(e) = ctx.scheduler.queue(instance_id) {
        warn!(instance_id = %instance_id, error = %e, "Failed to queue instance from event");
    }
}
