//! Public-facing facade for the task manager.
//!
//! A transport layer (HTTP handlers, a CLI, an IPC listener) only needs
//! [`DocumentService`]: it owns the store, the manager with its workers and
//! the reaper loop, and speaks in string ids and [`TaskStatusView`]s.
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use docflow_core::api::DocumentService;
//! use docflow_core::{
//!     Config, DocumentInput, DocumentProcessor, InputDescriptor, ProcessError, ProgressReporter,
//! };
//!
//! struct PageCounter;
//!
//! #[async_trait::async_trait]
//! impl DocumentProcessor for PageCounter {
//!     async fn process(
//!         &self,
//!         input: DocumentInput,
//!         progress: ProgressReporter,
//!     ) -> Result<serde_json::Value, ProcessError> {
//!         progress.report(50.0, "counting pages");
//!         Ok(serde_json::json!({ "bytes": input.bytes.len() }))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = DocumentService::start(Config::default(), Arc::new(PageCounter)).unwrap();
//! let receipt = service
//!     .submit(b"%PDF-1.7".to_vec(), InputDescriptor::new("a.pdf", 8, "application/pdf"))
//!     .unwrap();
//! let view = service
//!     .wait(&receipt.task_id.to_string(), Duration::from_secs(30))
//!     .await
//!     .unwrap();
//! println!("{}", serde_json::to_string_pretty(&view).unwrap());
//! service.shutdown().await;
//! # }
//! ```
mod types;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::manager::{TaskCounts, TaskManager};
use crate::runtime::processor::DocumentProcessor;
use crate::runtime::reaper::{Reaper, ReaperHandle};
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{InputDescriptor, TaskError, TaskId};

pub use types::{ErrorView, SubmitReceipt, TaskStatusView};

/// Poll interval used by [`DocumentService::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The task manager, its store and its reaper behind a single handle.
#[derive(Debug)]
pub struct DocumentService {
    manager: TaskManager,
    reaper: Reaper,
    reaper_handle: Mutex<Option<ReaperHandle>>,
}

impl DocumentService {
    /// Start workers and the reaper loop using the system clock.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(config: Config, processor: Arc<dyn DocumentProcessor>) -> Result<Self, ConfigError> {
        Self::start_with_clock(config, processor, Arc::new(SystemClock::new()))
    }

    /// Same as [`Self::start`] with an injected clock.
    pub fn start_with_clock(
        config: Config,
        processor: Arc<dyn DocumentProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = TaskStore::new(clock);
        let manager = TaskManager::start(store.clone(), processor, &config);
        let reaper = Reaper::new(store, config.reaper());
        let reaper_handle = reaper.clone().spawn();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            timeout_secs = config.processing_timeout.map(|t| t.as_secs()),
            max_attempts = config.max_attempts,
            "document service started"
        );

        Ok(Self {
            manager,
            reaper,
            reaper_handle: Mutex::new(Some(reaper_handle)),
        })
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Accept a document; returns without waiting for any processing.
    pub fn submit(
        &self,
        bytes: impl Into<Bytes>,
        descriptor: InputDescriptor,
    ) -> Result<SubmitReceipt, TaskError> {
        let task_id = self.manager.submit(bytes.into(), descriptor)?;
        Ok(SubmitReceipt::accepted(task_id))
    }

    /// Current status of a task.
    ///
    /// `NotFound` covers unknown ids, malformed ids, deleted tasks and tasks
    /// evicted after their retention window.
    pub fn status(&self, task_id: &str) -> Result<TaskStatusView, TaskError> {
        let id = parse_id(task_id)?;
        self.manager.get_status(&id).map(TaskStatusView::from)
    }

    pub fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        let id = parse_id(task_id)?;
        self.manager.delete(&id)
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Vec<TaskStatusView> {
        self.manager.list().iter().map(TaskStatusView::from).collect()
    }

    pub fn counts(&self) -> TaskCounts {
        self.manager.counts()
    }

    /// Poll until the task is terminal or `timeout` elapses.
    ///
    /// On timeout the latest non-terminal snapshot is returned.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<TaskStatusView, TaskError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.status(task_id)?;
            if view.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Run a reaper sweep now instead of waiting for the next interval.
    pub fn sweep(&self) -> usize {
        self.reaper.sweep()
    }

    /// Stop the reaper, refuse new submissions, and wait for queued work.
    pub async fn shutdown(&self) {
        let handle = self.reaper_handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.manager.shutdown().await;
        info!("document service stopped");
    }
}

fn parse_id(raw: &str) -> Result<TaskId, TaskError> {
    raw.trim().parse().map_err(|_| TaskError::not_found(raw))
}
