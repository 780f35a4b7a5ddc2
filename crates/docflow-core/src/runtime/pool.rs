use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::runtime::executor::{TaskExecutor, WorkItem};
use crate::runtime::types::TaskError;

/// Fixed set of workers fed through a bounded multi-consumer queue.
///
/// `dispatch` never waits: a full queue is reported back to the submitter
/// immediately. Closing the pool lets the workers drain what is already queued
/// and then exit.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    /// `None` once the pool has been closed.
    submit_tx: RwLock<Option<flume::Sender<WorkItem>>>,
    capacity: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks. Must be called inside a Tokio runtime.
    pub fn start(workers: usize, capacity: usize, executor: TaskExecutor) -> Self {
        let (submit_tx, submit_rx) = flume::bounded::<WorkItem>(capacity);
        let executor = Arc::new(executor);

        let handles = (0..workers)
            .map(|worker| {
                let rx = submit_rx.clone();
                let executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    Self::run_worker(worker, rx, executor).await;
                })
            })
            .collect();

        info!(workers, capacity, "worker pool started");
        Self {
            submit_tx: RwLock::new(Some(submit_tx)),
            capacity,
            handles: Mutex::new(handles),
        }
    }

    async fn run_worker(worker: usize, rx: flume::Receiver<WorkItem>, executor: Arc<TaskExecutor>) {
        debug!(worker, "worker started");
        while let Ok(item) = rx.recv_async().await {
            executor.run(item).await;
        }
        debug!(worker, "worker stopped");
    }

    /// Queue a work item without waiting.
    pub fn dispatch(&self, item: WorkItem) -> Result<(), TaskError> {
        let guard = self.submit_tx.read().map_err(|_| TaskError::Internal {
            message: "worker pool lock poisoned".into(),
        })?;
        let tx = guard.as_ref().ok_or_else(|| TaskError::Internal {
            message: "task manager is shut down".into(),
        })?;
        tx.try_send(item).map_err(|e| match e {
            flume::TrySendError::Full(_) => TaskError::QueueFull {
                capacity: self.capacity,
            },
            flume::TrySendError::Disconnected(_) => TaskError::Internal {
                message: "all workers have exited".into(),
            },
        })
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.submit_tx
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|tx| tx.len()))
            .unwrap_or(0)
    }

    /// Stop accepting work, let the workers finish the queue, and wait for them.
    pub async fn close(&self) {
        if let Ok(mut guard) = self.submit_tx.write() {
            guard.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        join_workers(handles).await;
        info!("worker pool stopped");
    }
}

/// Await every worker, reporting any that panicked or was cancelled.
async fn join_workers(handles: Vec<JoinHandle<()>>) -> usize {
    let mut abnormal = 0;
    for handle in handles {
        if let Err(err) = handle.await {
            abnormal += 1;
            error!(error = %err, "worker exited abnormally");
        }
    }
    abnormal
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn worker_panics_are_reported_on_join() {
        let handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(async {}),
            tokio::spawn(async {
                panic!("worker bug");
            }),
        ];
        assert_eq!(join_workers(handles).await, 1);
        assert!(logs_contain("worker exited abnormally"));
    }
}
