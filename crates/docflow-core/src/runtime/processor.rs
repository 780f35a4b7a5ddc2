use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::runtime::storage::TaskStore;
use crate::runtime::types::{InputDescriptor, TaskId};

/// The raw document handed to the processor.
///
/// `Bytes` is reference counted, so retrying an attempt does not copy the
/// document.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub bytes: Bytes,
    pub descriptor: InputDescriptor,
}

impl DocumentInput {
    /// Declared MIME type, used by processors as the format hint.
    pub fn format_hint(&self) -> &str {
        &self.descriptor.content_type
    }
}

/// Failure reported by a document processor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessError {
    pub message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// External extraction engine invoked once per attempt of a task.
///
/// Implementations may take minutes. They are run on a worker of the task
/// manager's pool, never on the submitting caller's path, and may be dropped
/// mid-flight when the processing deadline expires. Synchronous engines should
/// be wrapped in a [`BlockingProcessor`] instead of blocking inside `process`.
#[async_trait]
pub trait DocumentProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        input: DocumentInput,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, ProcessError>;
}

type BlockingFn = Arc<
    dyn Fn(DocumentInput, ProgressReporter) -> Result<serde_json::Value, ProcessError>
        + Send
        + Sync,
>;

/// A processor that runs synchronous, CPU-bound logic inside `spawn_blocking`.
///
/// A panic in the work function propagates to the calling attempt and is
/// recorded as a processing failure.
#[derive(Clone)]
pub struct BlockingProcessor {
    work: BlockingFn,
}

impl std::fmt::Debug for BlockingProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingProcessor").finish_non_exhaustive()
    }
}

impl BlockingProcessor {
    pub fn new(
        work: impl Fn(DocumentInput, ProgressReporter) -> Result<serde_json::Value, ProcessError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self { work: Arc::new(work) }
    }
}

#[async_trait]
impl DocumentProcessor for BlockingProcessor {
    async fn process(
        &self,
        input: DocumentInput,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, ProcessError> {
        let work = Arc::clone(&self.work);
        match tokio::task::spawn_blocking(move || work(input, progress)).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(ProcessError::new(format!("blocking processor was cancelled: {err}"))),
        }
    }
}

/// Handle given to a processor for publishing intermediate progress.
///
/// Reports are clamped to `[0, 100]`, never lower the recorded progress, and
/// become no-ops once the task is terminal or has been deleted.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    store: TaskStore,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, store: TaskStore) -> Self {
        Self { task_id, store }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Publish `progress` (percent) with a status message.
    ///
    /// Returns `false` if the update was dropped because the task is no longer
    /// processing or no longer exists.
    pub fn report(&self, progress: f32, message: impl Into<String>) -> bool {
        let now = self.store.now();
        let message = message.into();
        match self.store.update(&self.task_id, |t| t.advance(progress, message, now)) {
            Ok(applied) => applied,
            Err(_) => {
                debug!(task_id = %self.task_id, "progress for deleted task dropped");
                false
            }
        }
    }
}
