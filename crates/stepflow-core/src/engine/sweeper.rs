// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic sweep.
//!
//! Every `check_interval` the sweeper:
//! 1. re-queues instances left `pending` by producers that never queued them
//! 2. hands steps `running` for longer than `step_timeout` to the timeout
//!    handler, which rewinds them under the step's retry policy or fails the
//!    step and its instance
//! 3. re-queues `running` instances no worker owns whose next move does not
//!    depend on an outside signal, so a wake-up lost to a full queue is
//!    retried here
//!
//! Both races with live workers are settled by conditional updates in the
//! store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::EngineContext;
use crate::error::CoreError;
use crate::models::{InstanceStatus, JsonMap, RetryPolicy, StepError, StepRecord, StepStatus};

/// Counters for one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub requeued: usize,
    pub resumed: usize,
    pub rewound: usize,
    pub failed: usize,
}

pub(crate) struct Sweeper {
    ctx: Arc<EngineContext>,
}

impl Sweeper {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run until shutdown.
    pub(crate) async fn run(self) {
        info!(
            check_interval_secs = self.ctx.config.check_interval.as_secs(),
            step_timeout_secs = self.ctx.config.step_timeout.as_secs(),
            batch_size = self.ctx.config.pending_batch_size,
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.ctx.config.check_interval) => {
                    match self.sweep().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                requeued = report.requeued,
                                resumed = report.resumed,
                                rewound = report.rewound,
                                failed = report.failed,
                                "Sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
    }

    /// One pass over pending instances, timed-out steps and stalled instances.
    pub(crate) async fn sweep(&self) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport {
            requeued: self.requeue_pending().await?,
            ..SweepReport::default()
        };

        let cutoff = chrono::Duration::from_std(self.ctx.config.step_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let timed_out = self
            .ctx
            .store
            .list_timed_out_steps(cutoff, self.ctx.config.pending_batch_size)
            .await?;

        for step in timed_out {
            match self.handle_timeout(&step).await {
                Ok(TimeoutAction::Rewound) => report.rewound += 1,
                Ok(TimeoutAction::Failed) => report.failed += 1,
                Ok(TimeoutAction::None) => {}
                Err(e) => {
                    error!(
                        instance_id = %step.instance_id,
                        step_id = %step.step_id,
                        error = %e,
                        "Failed to handle step timeout"
                    );
                }
            }
        }

        let limit = self.ctx.config.pending_batch_size + self.ctx.scheduler.running_count() as i64;
        report.resumed = requeue_stalled(&self.ctx, limit).await?;

        Ok(report)
    }

    async fn requeue_pending(&self) -> Result<usize, CoreError> {
        let pending = self
            .ctx
            .store
            .list_instances_by_status(InstanceStatus::Pending, self.ctx.config.pending_batch_size)
            .await?;

        let mut requeued = 0;
        for instance in pending {
            if self.ctx.scheduler.is_running(&instance.id) {
                continue;
            }
            match self.ctx.scheduler.queue(&instance.id) {
                Ok(()) => requeued += 1,
                Err(CoreError::QueueFull { .. }) => {
                    debug!("Queue full, leaving remaining pending instances for the next sweep");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    async fn retry_policy(&self, step: &StepRecord) -> Result<Option<RetryPolicy>, CoreError> {
        let Some(instance) = self.ctx.store.get_instance(&step.instance_id).await? else {
            return Ok(None);
        };
        let Some(template) = self.ctx.store.get_template(&instance.template_id).await? else {
            return Ok(None);
        };
        Ok(template
            .schema
            .step(&step.step_id)
            .and_then(|def| def.retry_policy))
    }

    async fn handle_timeout(&self, step: &StepRecord) -> Result<TimeoutAction, CoreError> {
        let limit = self.ctx.config.step_retry_limit;
        let policy = self.retry_policy(step).await?;

        if policy.is_some_and(|p| p.allows_retry(step.retry_count, limit)) {
            if !self
                .ctx
                .store
                .rewind_step(&step.id, StepStatus::Running, step.retry_count)
                .await?
            {
                return Ok(TimeoutAction::None);
            }
            warn!(
                instance_id = %step.instance_id,
                step_id = %step.step_id,
                retry_count = step.retry_count + 1,
                "Step timed out, rewound for retry"
            );
            self.wake(&step.instance_id);
            return Ok(TimeoutAction::Rewound);
        }

        let error = StepError::fatal("step timed out");
        if !self
            .ctx
            .store
            .finish_step_if_running(&step.id, StepStatus::Failed, &JsonMap::new(), Some(&error))
            .await?
        {
            return Ok(TimeoutAction::None);
        }

        let message = format!("step '{}' timed out", step.step_id);
        if self
            .ctx
            .store
            .fail_instance_if_running(&step.instance_id, &message)
            .await?
        {
            warn!(
                instance_id = %step.instance_id,
                step_id = %step.step_id,
                retry_count = step.retry_count,
                "Step timed out, instance failed"
            );
        }
        // The worker propagates the failure to a waiting parent.
        self.wake(&step.instance_id);
        Ok(TimeoutAction::Failed)
    }

    fn wake(&self, instance_id: &str) {
        if let Err(e) = self.ctx.scheduler.queue(instance_id) {
            warn!(instance_id = %instance_id, error = %e, "Failed to queue instance after timeout");
        }
    }
}

/// Queue `running` instances that no worker owns and that are not parked on
/// an event or an unfinished child. Stops quietly when the queue fills up.
pub(crate) async fn requeue_stalled(ctx: &EngineContext, limit: i64) -> Result<usize, CoreError> {
    let stalled = ctx.store.list_stalled_instances(limit).await?;

    let mut requeued = 0;
    for instance in stalled {
        if ctx.scheduler.is_running(&instance.id) {
            continue;
        }
        match ctx.scheduler.queue(&instance.id) {
            Ok(()) => {
                debug!(instance_id = %instance.id, "Re-queued stalled instance");
                requeued += 1;
            }
            Err(CoreError::QueueFull { .. }) => {
                debug!("Queue full, leaving remaining stalled instances for the next sweep");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(requeued)
}

enum TimeoutAction {
    Rewound,
    Failed,
    None,
}
