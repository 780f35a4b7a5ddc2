use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a submitted document task.
///
/// Backed by a random (v4) UUID so identifiers never collide across the
/// lifetime of the process, or across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Structured output of the document processor.
///
/// Held behind an `Arc` so that status snapshots share the payload instead of
/// copying it on every poll.
pub type DocumentResult = Arc<serde_json::Value>;

/// Minimal metadata about a submitted document, kept for audit and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub filename: String,
    pub size_bytes: u64,
    /// Declared MIME type, e.g. `application/pdf`.
    pub content_type: String,
}

impl InputDescriptor {
    pub fn new(filename: impl Into<String>, size_bytes: u64, content_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            size_bytes,
            content_type: content_type.into(),
        }
    }
}

/// Why a task ended in [`TaskState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailureKind {
    /// The document processor reported an error (or panicked).
    Processing,
    /// Processing exceeded the configured deadline.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// The error recorded on a failed task. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Processing,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Lifecycle state of a task.
///
/// Transitions only move forward:
/// `Pending → Processing → Completed | Failed`. The terminal variants carry
/// their payload, so a completed task always has a result and a failed task
/// always has an error.
#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    /// Accepted, waiting for a worker.
    Pending,
    /// A worker is running the document processor for this task.
    Processing,
    /// Finished successfully.
    Completed { result: DocumentResult },
    /// Finished with an error.
    Failed { error: TaskFailure },
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Processing => TaskStatus::Processing,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed { .. } | TaskState::Failed { .. })
    }

    pub fn result(&self) -> Option<&DocumentResult> {
        match self {
            TaskState::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskFailure> {
        match self {
            TaskState::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// The state name without its payload, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Errors returned synchronously by the task manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The id is unknown, or the task was already deleted or reaped.
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// The submission was rejected before a task was created.
    #[error("invalid submission: {reason}")]
    Validation { reason: String },

    /// The worker pool queue is at capacity; retry later.
    #[error("work queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The manager can no longer accept work (workers gone, store fault).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    pub fn not_found(task_id: impl fmt::Display) -> Self {
        TaskError::NotFound {
            task_id: task_id.to_string(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        TaskError::Validation {
            reason: reason.into(),
        }
    }

    /// Only internal faults should take the whole service down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Internal { .. })
    }
}
