use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::runtime::storage::TaskStore;
use crate::runtime::types::TaskId;

/// Sweep schedule and retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// How long a terminal task stays queryable after it finished.
    pub retention: Duration,
    /// Warn about tasks processing for longer than this. Never evicts them.
    pub stale_processing_after: Option<Duration>,
}

/// Periodic eviction of terminal tasks whose retention window has passed.
///
/// Only deletes. Pending and processing tasks are never touched, whatever
/// their age. Sweeps are not atomic with respect to status queries, so a
/// client may see a task disappear between two polls.
#[derive(Debug, Clone)]
pub struct Reaper {
    store: TaskStore,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: TaskStore, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Run one sweep and return the number of evicted tasks.
    ///
    /// Idempotent: a second sweep right after the first evicts nothing new.
    pub fn sweep(&self) -> usize {
        let now = self.store.now();
        let cutoff = before(now, self.config.retention);

        let expired: Vec<TaskId> = self.store.list_expired(cutoff).collect();
        let evicted = expired
            .iter()
            .filter(|id| self.store.delete_if_expired(id, cutoff))
            .inspect(|id| debug!(task_id = %id, "expired task evicted"))
            .count();

        if let Some(stale_after) = self.config.stale_processing_after {
            for record in self.store.processing_since_before(before(now, stale_after)) {
                warn!(
                    task_id = %record.id,
                    filename = %record.input.filename,
                    started_at = ?record.started_at,
                    "task has been processing unusually long"
                );
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.store.len(), "reaper sweep finished");
        }
        evicted
    }

    /// Run sweeps on the configured interval until the handle is shut down
    /// or dropped. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(
                interval_secs = self.config.sweep_interval.as_secs_f64(),
                retention_secs = self.config.retention.as_secs_f64(),
                "reaper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        ReaperHandle { shutdown_tx, handle }
    }
}

/// Owner of a running reaper loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
