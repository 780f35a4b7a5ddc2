//! In-memory lifecycle management for long-running document processing tasks.
//!
//! Documents are submitted to a [`TaskManager`], processed in the background
//! by a [`DocumentProcessor`] on a bounded worker pool, polled through status
//! snapshots, and evicted by the [`Reaper`] once their retention window has
//! passed. [`api::DocumentService`] bundles all of it behind one handle.

mod runtime;

pub mod api;
pub mod config;

pub use config::{Config, ConfigError};
pub use runtime::clock::{Clock, ManualClock, SystemClock};
pub use runtime::manager::{TaskCounts, TaskManager};
pub use runtime::processor::{
    BlockingProcessor, DocumentInput, DocumentProcessor, ProcessError, ProgressReporter,
};
pub use runtime::reaper::{Reaper, ReaperConfig, ReaperHandle};
pub use runtime::storage::{TaskRecord, TaskStore};
pub use runtime::types::{
    DocumentResult, FailureKind, InputDescriptor, TaskError, TaskFailure, TaskId, TaskState,
    TaskStatus,
};
