// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded instance queue and dispatch loop.
//!
//! The running set maps an instance id to a re-run flag. The dispatch loop is
//! the only writer of new entries, and a worker removes its own entry on exit,
//! so an id is never owned by two workers at once. A wake-up that arrives
//! while the instance is running sets the flag and the finishing worker
//! queues the id once more.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Queue plus the in-memory "currently running" set.
pub(crate) struct Scheduler {
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    capacity: usize,
    running: DashMap<String, bool>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(capacity: usize, max_concurrent: usize, shutdown: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            running: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            shutdown,
        }
    }

    /// Non-blocking enqueue.
    pub(crate) fn queue(&self, instance_id: &str) -> Result<(), CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        self.tx
            .try_send(instance_id.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CoreError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => CoreError::ShuttingDown,
            })
    }

    pub(crate) fn is_running(&self, instance_id: &str) -> bool {
        self.running.contains_key(instance_id)
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Ids waiting in the queue.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Claim `instance_id` as if a worker owned it.
    #[cfg(test)]
    pub(crate) fn mark_running(&self, instance_id: &str) {
        self.running.insert(instance_id.to_string(), false);
    }

    /// Pull ids until shutdown, starting one tracked worker per id.
    ///
    /// `work` is called at most once at a time per instance id.
    pub(crate) async fn dispatch<F, Fut>(self: Arc<Self>, tracker: TaskTracker, work: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("Dispatch loop already started");
            return;
        };
        let work = Arc::new(work);

        info!(
            capacity = self.capacity,
            max_concurrent = self.permits.available_permits(),
            "Dispatch loop started"
        );

        loop {
            let instance_id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            match self.running.entry(instance_id.clone()) {
                Entry::Occupied(mut entry) => {
                    debug!(instance_id = %instance_id, "Instance already running, flagging re-run");
                    *entry.get_mut() = true;
                    continue;
                }
                Entry::Vacant(entry) => {
                    entry.insert(false);
                }
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.running.remove(&instance_id);
                    break;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.running.remove(&instance_id);
                        break;
                    }
                },
            };

            let scheduler = self.clone();
            let work = work.clone();
            tracker.spawn(async move {
                let _permit = permit;
                work(instance_id.clone()).await;

                let rerun = scheduler
                    .running
                    .remove(&instance_id)
                    .is_some_and(|(_, rerun)| rerun);
                if rerun && !scheduler.shutdown.is_cancelled() {
                    if let Err(e) = scheduler.queue(&instance_id) {
                        warn!(instance_id = %instance_id, error = %e, "Failed to re-queue instance");
                    }
                }
            });
        }

        rx.close();
        info!("Dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let scheduler = Scheduler::new(2, 1, CancellationToken::new());
        scheduler.queue("a").unwrap();
        scheduler.queue("b").unwrap();
        let err = scheduler.queue("c").unwrap_err();
        assert!(matches!(err, CoreError::QueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_queue_after_shutdown() {
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(2, 1, shutdown.clone());
        shutdown.cancel();
        assert!(matches!(scheduler.queue("a"), Err(CoreError::ShuttingDown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_queue_never_runs_twice() {
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(16, 4, shutdown.clone()));
        let tracker = TaskTracker::new();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (a, p, r) = (active.clone(), peak.clone(), runs.clone());

        let dispatcher = tokio::spawn(scheduler.clone().dispatch(tracker.clone(), move |_id| {
            let (a, p, r) = (a.clone(), p.clone(), r.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                r.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        }));

        for _ in 0..5 {
            scheduler.queue("same").unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // First run plus exactly one re-run for the wake-ups that arrived meanwhile.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_running("same"));

        shutdown.cancel();
        dispatcher.await.unwrap();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(16, 2, shutdown.clone()));
        let tracker = TaskTracker::new();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        let dispatcher = tokio::spawn(scheduler.clone().dispatch(tracker.clone(), move |_id| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        }));

        for i in 0..6 {
            scheduler.queue(&format!("instance-{}", i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.running_count(), 0);

        shutdown.cancel();
        dispatcher.await.unwrap();
        tracker.close();
        tracker.wait().await;
    }
}
