use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::runtime::processor::{DocumentInput, DocumentProcessor, ProgressReporter};
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{FailureKind, TaskFailure, TaskId};

/// One unit of work handed from `submit` to the worker pool.
#[derive(Debug)]
pub(crate) struct WorkItem {
    pub task_id: TaskId,
    pub input: DocumentInput,
}

/// The execution routine bound to a single task.
///
/// Drives `Pending → Processing → Completed | Failed` and is the only writer
/// of a task's state, result and error while it is processing.
#[derive(Clone)]
pub(crate) struct TaskExecutor {
    store: TaskStore,
    processor: Arc<dyn DocumentProcessor>,
    timeout: Option<Duration>,
    max_attempts: u32,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(
        store: TaskStore,
        processor: Arc<dyn DocumentProcessor>,
        timeout: Option<Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            processor,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run the task to a terminal state.
    pub async fn run(&self, item: WorkItem) {
        let WorkItem { task_id, input } = item;

        let now = self.store.now();
        let message = format!("processing {}", input.descriptor.filename);
        match self.store.update(&task_id, |t| t.begin(message, now)) {
            Ok(true) => {}
            Ok(false) => {
                warn!(%task_id, "task is not pending; skipping duplicate dispatch");
                return;
            }
            Err(_) => {
                debug!(%task_id, "task deleted before a worker picked it up");
                return;
            }
        }
        info!(
            %task_id,
            filename = %input.descriptor.filename,
            size_bytes = input.descriptor.size_bytes,
            "task started"
        );

        let started = Instant::now();
        let outcome = self.attempt_all(task_id, input).await;
        self.finish(task_id, outcome, started.elapsed());
    }

    /// Invoke the processor up to `max_attempts` times.
    ///
    /// Each attempt runs in its own task and the deadline is awaited on its
    /// join handle, so a processor that blocks its thread cannot hold the
    /// deadline back. On expiry the attempt is aborted; a processor stuck in
    /// blocking code keeps its thread, but its late result is discarded.
    async fn attempt_all(
        &self,
        task_id: TaskId,
        input: DocumentInput,
    ) -> Result<serde_json::Value, TaskFailure> {
        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        let mut last_failure = None;

        for attempt in 1..=self.max_attempts {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.deadline_failure());
            }

            let message = if attempt == 1 {
                "running document processor".to_owned()
            } else {
                format!("retrying document processor (attempt {attempt}/{})", self.max_attempts)
            };
            let now = self.store.now();
            match self.store.update(&task_id, |t| t.start_attempt(message, now)) {
                Ok(Some(_)) => {}
                // Deleted or otherwise no longer ours; the final write becomes a no-op.
                _ => return Err(TaskFailure::processing("task is no longer processing")),
            }

            let reporter = ProgressReporter::new(task_id, self.store.clone());
            let processor = Arc::clone(&self.processor);
            let attempt_input = input.clone();
            let mut handle =
                tokio::spawn(async move { processor.process(attempt_input, reporter).await });

            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        handle.abort();
                        return Err(self.deadline_failure());
                    }
                },
                None => handle.await,
            };

            match joined {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    warn!(%task_id, attempt, error = %err, "document processor failed");
                    last_failure = Some(TaskFailure::processing(err.message));
                }
                Err(join_err) if join_err.is_panic() => {
                    let reason = panic_message(join_err.into_panic().as_ref());
                    error!(%task_id, attempt, panic = %reason, "document processor panicked");
                    last_failure = Some(TaskFailure::processing(format!(
                        "document processor panicked: {reason}"
                    )));
                }
                Err(join_err) => {
                    warn!(%task_id, attempt, error = %join_err, "document processor cancelled");
                    last_failure = Some(TaskFailure::processing(format!(
                        "document processor was cancelled: {join_err}"
                    )));
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| TaskFailure::processing("document processor was not invoked")))
    }

    fn deadline_failure(&self) -> TaskFailure {
        let limit = self.timeout.unwrap_or_default();
        TaskFailure::timeout(format!(
            "processing exceeded the {:.1}s deadline",
            limit.as_secs_f64()
        ))
    }

    /// Commit the terminal state. A task deleted mid-flight is left alone.
    fn finish(&self, task_id: TaskId, outcome: Result<serde_json::Value, TaskFailure>, elapsed: Duration) {
        let now = self.store.now();
        let applied = match outcome {
            Ok(value) => {
                let message = format!("processing completed in {:.2}s", elapsed.as_secs_f64());
                let applied = self
                    .store
                    .update(&task_id, |t| t.complete(Arc::new(value), message, now));
                if matches!(applied, Ok(true)) {
                    info!(%task_id, elapsed_ms = elapsed.as_millis() as u64, "task completed");
                }
                applied
            }
            Err(failure) => {
                let kind = failure.kind;
                let reason = failure.message.clone();
                let applied = self.store.update(&task_id, |t| t.fail(failure, now));
                if matches!(applied, Ok(true)) {
                    match kind {
                        FailureKind::Timeout => warn!(%task_id, error = %reason, "task timed out"),
                        FailureKind::Processing => warn!(%task_id, error = %reason, "task failed"),
                    }
                }
                applied
            }
        };

        match applied {
            Ok(true) => {}
            Ok(false) => debug!(%task_id, "task already terminal; final update ignored"),
            Err(_) => debug!(%task_id, "task deleted while processing; final update dropped"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
