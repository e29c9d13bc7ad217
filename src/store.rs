//! Task result store
//!
//! In-memory map from task id to task state with read-once consumption of
//! terminal entries, deadline promotion of stuck pending entries and a
//! retention sweep for results nobody collected.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::task::{FailureReason, TaskId, TaskState};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {0} already exists")]
    DuplicateId(TaskId),
}

#[derive(Debug)]
struct TaskEntry {
    created: Instant,
    deadline: Duration,
    state: TaskState,
}

/// What a client read observes
#[derive(Debug, Clone, PartialEq)]
pub enum TaskView {
    /// Still working; the entry stays in the store
    Pending { label: String, elapsed: Duration },
    /// Terminal state, now removed from the store
    Finished(TaskState),
}

#[derive(Debug, Default)]
pub struct ResultStore {
    entries: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new pending entry
    pub fn create_pending(
        &self,
        id: &TaskId,
        label: impl Into<String>,
        deadline: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(StoreError::DuplicateId(id.clone()));
        }
        entries.insert(
            id.clone(),
            TaskEntry {
                created: Instant::now(),
                deadline,
                state: TaskState::Pending {
                    label: label.into(),
                },
            },
        );
        Ok(())
    }

    /// Record the solver's terminal state over the existing entry
    ///
    /// An entry that is gone was already consumed (read as timed out), so the
    /// late result is dropped rather than delivered a second time.
    pub fn write_terminal(&self, id: &TaskId, state: TaskState) {
        match self.entries().get_mut(id) {
            Some(entry) => entry.state = state,
            None => debug!("Dropping late result for consumed task {}", id),
        }
    }

    /// Client read: pending stays, terminal is consumed
    pub fn read(&self, id: &str) -> Result<TaskView, StoreError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let TaskState::Pending { label } = &entry.state {
            let elapsed = entry.created.elapsed();
            if elapsed < entry.deadline {
                return Ok(TaskView::Pending {
                    label: label.clone(),
                    elapsed,
                });
            }
            entry.state = TaskState::Error {
                reason: FailureReason::PendingTimeout,
                elapsed,
            };
        }

        let entry = entries
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(TaskView::Finished(entry.state))
    }

    /// Drop terminal entries older than `retention`; pending ones are left alone
    pub fn evict_stale(&self, retention: Duration) -> Vec<TaskId> {
        let mut entries = self.entries();
        let expired: Vec<TaskId> = entries
            .iter()
            .filter(|(_, entry)| entry.state.is_terminal() && entry.created.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::ChallengeKind;
    use serde_json::Map;

    fn success(value: &str) -> TaskState {
        TaskState::Success {
            value: value.to_string(),
            elapsed: Duration::from_millis(1500),
            extra: Map::new(),
        }
    }

    fn failure() -> TaskState {
        TaskState::Error {
            reason: FailureReason::NoTokenObserved(ChallengeKind::Turnstile),
            elapsed: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.create_pending(&id, "solving turnstile", Duration::from_secs(300)).unwrap();
        assert_eq!(
            store.create_pending(&id, "again", Duration::from_secs(300)),
            Err(StoreError::DuplicateId(id.clone()))
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let store = ResultStore::new();
        assert_eq!(
            store.read("nope"),
            Err(StoreError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_read_once() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.create_pending(&id, "solving turnstile", Duration::from_secs(300)).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        match store.read(id.as_str()).unwrap() {
            TaskView::Pending { label, elapsed } => {
                assert_eq!(label, "solving turnstile");
                assert_eq!(elapsed, Duration::from_secs(2));
            }
            other => panic!("unexpected view: {:?}", other),
        }
        assert_eq!(store.len(), 1);

        store.write_terminal(&id, success("token"));
        assert_eq!(
            store.read(id.as_str()).unwrap(),
            TaskView::Finished(success("token"))
        );
        assert!(matches!(
            store.read(id.as_str()),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_past_deadline_becomes_timeout() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.create_pending(&id, "solving funcaptcha", Duration::from_secs(180)).unwrap();

        tokio::time::advance(Duration::from_secs(180)).await;
        match store.read(id.as_str()).unwrap() {
            TaskView::Finished(TaskState::Error { reason, elapsed }) => {
                assert_eq!(reason, FailureReason::PendingTimeout);
                assert_eq!(elapsed, Duration::from_secs(180));
            }
            other => panic!("unexpected view: {:?}", other),
        }
        assert!(store.read(id.as_str()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_per_task() {
        let store = ResultStore::new();
        let short = TaskId::new();
        let long = TaskId::new();
        store.create_pending(&short, "a", Duration::from_secs(180)).unwrap();
        store.create_pending(&long, "b", Duration::from_secs(300)).unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(matches!(
            store.read(short.as_str()),
            Ok(TaskView::Finished(_))
        ));
        assert!(matches!(
            store.read(long.as_str()),
            Ok(TaskView::Pending { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_write_after_timeout_is_dropped() {
        let store = ResultStore::new();
        let id = TaskId::new();
        store.create_pending(&id, "x", Duration::from_secs(300)).unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(matches!(
            store.read(id.as_str()),
            Ok(TaskView::Finished(TaskState::Error {
                reason: FailureReason::PendingTimeout,
                ..
            }))
        ));

        store.write_terminal(&id, success("tok"));
        assert_eq!(store.len(), 0);
        assert_eq!(
            store.read(id.as_str()),
            Err(StoreError::NotFound(id.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_skips_pending_and_fresh() {
        let store = ResultStore::new();
        let pending = TaskId::new();
        let old_error = TaskId::new();
        let old_success = TaskId::new();
        store.create_pending(&pending, "p", Duration::from_secs(300)).unwrap();
        store.create_pending(&old_error, "e", Duration::from_secs(300)).unwrap();
        store.create_pending(&old_success, "s", Duration::from_secs(300)).unwrap();
        store.write_terminal(&old_error, failure());
        store.write_terminal(&old_success, success("tok"));

        tokio::time::advance(Duration::from_secs(1800)).await;
        let fresh_error = TaskId::new();
        store.create_pending(&fresh_error, "f", Duration::from_secs(300)).unwrap();
        store.write_terminal(&fresh_error, failure());

        tokio::time::advance(Duration::from_secs(1801)).await;
        let mut evicted = store.evict_stale(Duration::from_secs(3600));
        evicted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = vec![old_error, old_success];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(evicted, expected);

        assert!(store.read(pending.as_str()).is_ok());
        assert!(store.read(fresh_error.as_str()).is_ok());
    }
}
