use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::runtime::executor::{TaskExecutor, WorkItem};
use crate::runtime::pool::WorkerPool;
use crate::runtime::processor::{DocumentInput, DocumentProcessor};
use crate::runtime::storage::{TaskRecord, TaskStore};
use crate::runtime::types::{InputDescriptor, TaskError, TaskId, TaskState};

/// The task lifecycle manager.
///
/// Accepts document submissions, hands each one to the worker pool exactly
/// once, and answers status queries from the [`TaskStore`].
///
/// # Usage
///
/// ```rust,ignore
/// let manager = TaskManager::start(store, processor, &Config::default());
/// let task_id = manager.submit(bytes, descriptor)?;
/// let record = manager.get_status(&task_id)?;
/// ```
#[derive(Debug)]
pub struct TaskManager {
    store: TaskStore,
    pool: WorkerPool,
    policy: SubmitPolicy,
}

impl TaskManager {
    /// Start the manager and its workers.
    ///
    /// Must be called inside a Tokio runtime. `config` is expected to have
    /// passed [`Config::validate`].
    pub fn start(store: TaskStore, processor: Arc<dyn DocumentProcessor>, config: &Config) -> Self {
        let executor = TaskExecutor::new(
            store.clone(),
            processor,
            config.processing_timeout,
            config.max_attempts,
        );
        let pool = WorkerPool::start(config.workers.max(1), config.queue_capacity.max(1), executor);
        Self {
            store,
            pool,
            policy: SubmitPolicy::from_config(config),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Accept a document for background processing.
    ///
    /// Returns the new task's id as soon as the task is stored and queued;
    /// processing happens on the worker pool. Invalid submissions are rejected
    /// before any task is created.
    ///
    /// A task is stored before it is queued. When the queue is full it is
    /// removed again and `QueueFull` is returned, so a concurrent
    /// [`list`](Self::list) or [`counts`](Self::counts) may briefly include a
    /// `Pending` task whose id the caller never receives.
    pub fn submit(&self, bytes: Bytes, descriptor: InputDescriptor) -> Result<TaskId, TaskError> {
        self.policy.check(&bytes, &descriptor)?;

        let task_id = self.store.create(descriptor.clone());
        let filename = descriptor.filename.clone();
        let item = WorkItem {
            task_id,
            input: DocumentInput { bytes, descriptor },
        };

        if let Err(err) = self.pool.dispatch(item) {
            // Never leave a task behind that no worker will pick up.
            let _ = self.store.delete(&task_id);
            match &err {
                TaskError::QueueFull { capacity } => {
                    warn!(%task_id, capacity, "work queue full; submission rejected")
                }
                other => error!(%task_id, error = %other, "failed to dispatch task"),
            }
            return Err(err);
        }

        info!(%task_id, %filename, "task accepted");
        Ok(task_id)
    }

    /// Return a snapshot of the task's current state.
    pub fn get_status(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.store.get(task_id)
    }

    /// Remove a task regardless of its state.
    ///
    /// Deleting a processing task does not interrupt its processor; the
    /// execution routine's remaining updates are silently dropped.
    pub fn delete(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.store.delete(task_id)?;
        info!(%task_id, "task deleted");
        Ok(())
    }

    /// Snapshots of all tasks, newest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.store.list()
    }

    /// Number of tasks per state.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            queued: self.pool.queued(),
            ..TaskCounts::default()
        };
        for record in self.store.list() {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Processing => counts.processing += 1,
                TaskState::Completed { .. } => counts.completed += 1,
                TaskState::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Stop accepting submissions and wait for queued work to finish.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// Per-state task totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Work items waiting for a free worker.
    pub queued: usize,
}

/// Submission checks applied before a task is created.
#[derive(Debug, Clone)]
struct SubmitPolicy {
    max_input_bytes: u64,
    accepted_content_types: Vec<String>,
}

impl SubmitPolicy {
    fn from_config(config: &Config) -> Self {
        Self {
            max_input_bytes: config.max_input_bytes,
            accepted_content_types: config
                .accepted_content_types
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    fn check(&self, bytes: &Bytes, descriptor: &InputDescriptor) -> Result<(), TaskError> {
        if bytes.is_empty() {
            return Err(TaskError::validation("document is empty"));
        }
        if descriptor.filename.trim().is_empty() {
            return Err(TaskError::validation("filename is required"));
        }
        if descriptor.size_bytes != bytes.len() as u64 {
            return Err(TaskError::validation(format!(
                "declared size {} does not match received {} bytes",
                descriptor.size_bytes,
                bytes.len()
            )));
        }
        if descriptor.size_bytes > self.max_input_bytes {
            return Err(TaskError::validation(format!(
                "document is {} bytes; the limit is {}",
                descriptor.size_bytes, self.max_input_bytes
            )));
        }

        // Ignore MIME parameters such as `; charset=binary`.
        let content_type = descriptor
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !self.accepted_content_types.iter().any(|t| *t == content_type) {
            return Err(TaskError::validation(format!(
                "unsupported content type '{}'; accepted: {}",
                descriptor.content_type,
                self.accepted_content_types.join(", ")
            )));
        }
        Ok(())
    }
}
