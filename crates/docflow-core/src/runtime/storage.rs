use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::runtime::clock::Clock;
use crate::runtime::types::{DocumentResult, InputDescriptor, TaskError, TaskFailure, TaskId, TaskState};

/// The complete in-memory record for a single submitted task.
///
/// Records handed out by [`TaskStore::get`] are copies; mutating one has no
/// effect on the stored task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    /// Percentage in `[0.0, 100.0]`.
    pub progress: f32,
    pub message: String,
    pub input: InputDescriptor,
    /// Number of processor invocations started so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn new(id: TaskId, input: InputDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            progress: 0.0,
            message: "document queued for processing".to_owned(),
            input,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn result(&self) -> Option<&DocumentResult> {
        self.state.result()
    }

    pub fn error(&self) -> Option<&TaskFailure> {
        self.state.error()
    }

    /// `Pending → Processing`. Returns `false` if the task was already picked up.
    pub fn begin(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Processing;
        self.message = message.into();
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Record progress while `Processing`.
    ///
    /// The value is clamped to `[0, 100]` and never lowers the current
    /// progress. Ignored in any other state.
    pub fn advance(&mut self, progress: f32, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Processing {
            return false;
        }
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        self.progress = self.progress.max(progress);
        self.message = message.into();
        self.updated_at = now;
        true
    }

    /// Count a processor invocation. Ignored unless `Processing`.
    pub fn start_attempt(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Option<u32> {
        if self.state != TaskState::Processing {
            return None;
        }
        self.attempts += 1;
        self.message = message.into();
        self.updated_at = now;
        Some(self.attempts)
    }

    /// `Processing → Completed`, progress pinned to 100.
    pub fn complete(&mut self, result: DocumentResult, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Processing {
            return false;
        }
        self.state = TaskState::Completed { result };
        self.progress = 100.0;
        self.message = message.into();
        self.updated_at = now;
        self.finished_at = Some(now);
        true
    }

    /// `Processing → Failed`. Progress keeps its last recorded value.
    pub fn fail(&mut self, error: TaskFailure, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Processing {
            return false;
        }
        self.message = format!("error: {}", error.message);
        self.state = TaskState::Failed { error };
        self.updated_at = now;
        self.finished_at = Some(now);
        true
    }

    /// Terminal and finished strictly before `cutoff`.
    pub fn expired_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_terminal() && self.finished_at.is_some_and(|at| at < cutoff)
    }
}

/// Centralized, thread-safe registry of all live tasks.
///
/// Backed by a sharded [`DashMap`]: there is no store-wide lock, and every
/// mutation of one task runs under that task's shard lock, so updates to the
/// same id never interleave. Closures passed to [`Self::update`] must be short
/// and must not call back into the store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    inner: Arc<DashMap<TaskId, TaskRecord>>,
    clock: Arc<dyn Clock>,
}

impl TaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Allocate a new `TaskId` and insert a `Pending` record.
    pub fn create(&self, input: InputDescriptor) -> TaskId {
        let now = self.clock.now();
        loop {
            let id = TaskId::new();
            // A v4 collision is practically impossible, but never overwrite a live task.
            if let Entry::Vacant(slot) = self.inner.entry(id) {
                slot.insert(TaskRecord::new(id, input, now));
                return id;
            }
        }
    }

    /// Return a snapshot of the task.
    pub fn get(&self, id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.inner
            .get(id)
            .map(|record| record.value().clone())
            .ok_or_else(|| TaskError::not_found(id))
    }

    /// Atomically apply `mutate` to the stored record.
    ///
    /// Returns whatever the closure returns, or `NotFound` if the task is gone.
    pub fn update<R>(&self, id: &TaskId, mutate: impl FnOnce(&mut TaskRecord) -> R) -> Result<R, TaskError> {
        let mut record = self.inner.get_mut(id).ok_or_else(|| TaskError::not_found(id))?;
        Ok(mutate(record.value_mut()))
    }

    pub fn delete(&self, id: &TaskId) -> Result<(), TaskError> {
        self.inner
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TaskError::not_found(id))
    }

    /// Remove the task only if it is still terminal and finished before `cutoff`.
    pub fn delete_if_expired(&self, id: &TaskId, cutoff: DateTime<Utc>) -> bool {
        self.inner
            .remove_if(id, |_, record| record.expired_before(cutoff))
            .is_some()
    }

    /// Lazily scan for terminal tasks that finished before `cutoff`.
    ///
    /// Each call starts a fresh scan. The iterator holds shard read locks while
    /// it is alive, so collect it before deleting anything.
    pub fn list_expired(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = TaskId> + '_ {
        self.inner
            .iter()
            .filter(move |entry| entry.value().expired_before(cutoff))
            .map(|entry| *entry.key())
    }

    /// Snapshots of every task, newest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.inner.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Snapshots of tasks that have been `Processing` since before `cutoff`.
    pub fn processing_since_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskRecord> {
        self.inner
            .iter()
            .filter(|e| {
                let record = e.value();
                record.state == TaskState::Processing
                    && record.started_at.is_some_and(|at| at < cutoff)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runtime::clock::ManualClock;

    fn store() -> (TaskStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (TaskStore::new(clock.clone()), clock)
    }

    fn pdf() -> InputDescriptor {
        InputDescriptor::new("report.pdf", 4, "application/pdf")
    }

    #[test]
    fn create_inserts_pending_record() {
        let (store, clock) = store();
        let id = store.create(pdf());
        let record = store.get(&id).expect("task should exist");
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.progress, 0.0);
        assert_eq!(record.created_at, clock.now());
        assert_eq!(record.updated_at, clock.now());
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn snapshots_are_detached_from_the_store() {
        let (store, _) = store();
        let id = store.create(pdf());
        let mut snapshot = store.get(&id).unwrap();
        snapshot.message = "scribbled".into();
        assert_ne!(store.get(&id).unwrap().message, "scribbled");
    }

    #[test]
    fn transitions_only_move_forward() {
        let (store, clock) = store();
        let id = store.create(pdf());
        let now = clock.now();

        assert!(!store.update(&id, |t| t.advance(10.0, "early", now)).unwrap());
        assert!(store.update(&id, |t| t.begin("started", now)).unwrap());
        assert!(!store.update(&id, |t| t.begin("again", now)).unwrap());
        assert!(store.update(&id, |t| t.advance(40.0, "halfway", now)).unwrap());
        assert!(store.update(&id, |t| t.advance(20.0, "backwards", now)).unwrap());
        assert_eq!(store.get(&id).unwrap().progress, 40.0);

        let failure = TaskFailure::processing("unsupported layout");
        assert!(store.update(&id, |t| t.fail(failure, now)).unwrap());
        let record = store.get(&id).unwrap();
        assert_eq!(record.progress, 40.0);
        assert_eq!(record.finished_at, Some(now));

        let result = Arc::new(serde_json::json!({"late": true}));
        assert!(!store.update(&id, |t| t.complete(result, "late", now)).unwrap());
        assert!(store.get(&id).unwrap().result().is_none());
    }

    #[test]
    fn progress_is_clamped() {
        let (store, clock) = store();
        let id = store.create(pdf());
        let now = clock.now();
        store.update(&id, |t| t.begin("go", now)).unwrap();
        store.update(&id, |t| t.advance(250.0, "over", now)).unwrap();
        assert_eq!(store.get(&id).unwrap().progress, 100.0);
        store.update(&id, |t| t.advance(f32::NAN, "nan", now)).unwrap();
        assert_eq!(store.get(&id).unwrap().progress, 100.0);
    }

    #[test]
    fn update_and_delete_of_missing_task_is_not_found() {
        let (store, _) = store();
        let id = TaskId::new();
        assert!(matches!(store.get(&id), Err(TaskError::NotFound { .. })));
        assert!(matches!(store.update(&id, |_| ()), Err(TaskError::NotFound { .. })));
        assert!(matches!(store.delete(&id), Err(TaskError::NotFound { .. })));
    }

    #[test]
    fn list_expired_only_returns_old_terminal_tasks() {
        let (store, clock) = store();
        let pending = store.create(pdf());
        let done = store.create(pdf());
        let now = clock.now();
        store.update(&done, |t| t.begin("go", now)).unwrap();
        store
            .update(&done, |t| t.complete(Arc::new(serde_json::json!({})), "done", now))
            .unwrap();

        assert_eq!(store.list_expired(now).count(), 0);
        clock.advance(Duration::from_secs(1));
        let expired: Vec<_> = store.list_expired(clock.now()).collect();
        assert_eq!(expired, vec![done]);

        assert!(!store.delete_if_expired(&pending, clock.now()));
        assert!(store.delete_if_expired(&done, clock.now()));
        assert_eq!(store.len(), 1);
    }
}
