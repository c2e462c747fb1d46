use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerPhase {
    Idle,
    Scanning,
    Processing,
    Cleanup,
    Complete,
}

/// Observable snapshot of the engine. `is_indexing` covers the whole
/// scanning-to-cleanup span; `progress` is 0-100.
#[derive(Clone, Debug, Serialize)]
pub struct IndexerState {
    pub is_indexing: bool,
    pub phase: IndexerPhase,
    pub progress: f64,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: String,
}

impl Default for IndexerState {
    fn default() -> Self {
        Self {
            is_indexing: false,
            phase: IndexerPhase::Idle,
            progress: 0.0,
            total_files: 0,
            processed_files: 0,
            current_file: String::new(),
        }
    }
}

/// Cloneable handle to the engine's state cell. All mutation goes through
/// the watch sender, so transitions are atomic with respect to observers
/// and to competing `try_begin` callers.
#[derive(Clone)]
pub struct IndexerStatus {
    tx: Arc<watch::Sender<IndexerState>>,
    generation: Arc<AtomicU64>,
}

impl IndexerStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(IndexerState::default());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> IndexerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexerState> {
        self.tx.subscribe()
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut IndexerState)) {
        self.tx.send_modify(apply);
    }

    /// Guarded `idle -> scanning` transition. The check and the set run
    /// inside the sender's critical section, so two racing starts cannot
    /// both win. Returns the run's generation, or `None` when a scan is
    /// already active.
    pub(crate) fn try_begin(&self) -> Option<u64> {
        let mut started = None;
        self.tx.send_if_modified(|state| {
            if state.is_indexing {
                return false;
            }
            *state = IndexerState {
                is_indexing: true,
                phase: IndexerPhase::Scanning,
                ..IndexerState::default()
            };
            started = Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1);
            true
        });
        started
    }

    pub(crate) fn complete(&self) {
        self.update(|state| {
            state.is_indexing = false;
            state.phase = IndexerPhase::Complete;
            state.progress = 100.0;
        });
    }

    pub(crate) fn reset_idle(&self) {
        self.update(|state| {
            state.is_indexing = false;
            state.phase = IndexerPhase::Idle;
        });
    }

    /// The deferred complete -> idle transition. A newer scan bumps the
    /// generation, which voids any grace timer started by an older run.
    pub(crate) fn idle_after_grace(&self, generation: u64) {
        self.tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            if state.is_indexing || state.phase != IndexerPhase::Complete {
                return false;
            }
            state.phase = IndexerPhase::Idle;
            true
        });
    }
}

impl Default for IndexerStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_begin_is_exclusive() {
        let status = IndexerStatus::new();
        let first = status.try_begin();
        assert!(first.is_some());
        assert!(status.try_begin().is_none());

        status.reset_idle();
        let second = status.try_begin();
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn grace_transition_only_fires_for_the_latest_run() {
        let status = IndexerStatus::new();
        let first = status.try_begin().unwrap();
        status.complete();

        // A newer scan starts during the grace window.
        let second = status.try_begin().unwrap();
        status.idle_after_grace(first);
        assert_eq!(status.current().phase, IndexerPhase::Scanning);

        status.complete();
        status.idle_after_grace(second);
        assert_eq!(status.current().phase, IndexerPhase::Idle);
        assert!(!status.current().is_indexing);
    }

    #[test]
    fn begin_resets_counters() {
        let status = IndexerStatus::new();
        status.try_begin().unwrap();
        status.update(|state| {
            state.total_files = 10;
            state.processed_files = 10;
            state.progress = 100.0;
        });
        status.complete();
        status.try_begin().unwrap();
        let state = status.current();
        assert_eq!(state.total_files, 0);
        assert_eq!(state.processed_files, 0);
        assert_eq!(state.progress, 0.0);
        assert_eq!(state.phase, IndexerPhase::Scanning);
    }
}
