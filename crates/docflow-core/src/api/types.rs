use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::storage::TaskRecord;
use crate::runtime::types::{FailureKind, TaskId, TaskStatus};

/// Response to an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub status: String,
    pub message: String,
}

impl SubmitReceipt {
    pub(crate) fn accepted(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: "accepted".to_owned(),
            message: format!("document queued; poll the status of task {task_id} for progress"),
        }
    }
}

/// Error recorded on a failed task, as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorView {
    pub kind: FailureKind,
    pub message: String,
}

/// A status snapshot in the shape clients poll for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: f32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
    pub filename: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusView {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            status: record.state.status(),
            progress: record.progress,
            message: record.message.clone(),
            result: record.result().map(|r| r.as_ref().clone()),
            error: record.error().map(|e| ErrorView {
                kind: e.kind,
                message: e.message.clone(),
            }),
            filename: record.input.filename.clone(),
            attempts: record.attempts,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        }
    }
}

impl From<TaskRecord> for TaskStatusView {
    fn from(record: TaskRecord) -> Self {
        Self::from(&record)
    }
}
