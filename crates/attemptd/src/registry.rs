//! In-memory registry of attempts with a run in flight.
//!
//! Entries are inserted when a run starts and removed in the run's final step.
//! The emit channel consults an entry's `aborted` flag before every write.

use attempt_core::Id;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Per-run state shared by the controller, the emit channel and `stop`.
#[derive(Debug)]
pub struct RunHandle {
    pub attempt_id: Id,
    pub board_id: Id,
    pub repo_path: PathBuf,
    cancel: CancellationToken,
    aborted: AtomicBool,
    worktree_path: RwLock<Option<PathBuf>>,
    /// Serializes sequence allocation for conversation items.
    pub(crate) seq_lock: tokio::sync::Mutex<()>,
}

impl RunHandle {
    pub fn new(attempt_id: Id, board_id: Id, repo_path: PathBuf) -> Self {
        Self {
            attempt_id,
            board_id,
            repo_path,
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            worktree_path: RwLock::new(None),
            seq_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Mark the run aborted and cancel its token.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn worktree_path(&self) -> Option<PathBuf> {
        self.worktree_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_worktree_path(&self, path: &Path) {
        *self
            .worktree_path
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(path.to_path_buf());
    }
}

/// `attempt_id -> RunHandle` for runs in flight.
#[derive(Debug, Default)]
pub struct RunningRegistry {
    runs: Mutex<HashMap<Id, Arc<RunHandle>>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Returns `None` when the attempt already has one in flight.
    pub fn insert(&self, handle: RunHandle) -> Option<Arc<RunHandle>> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&handle.attempt_id) {
            return None;
        }
        let handle = Arc::new(handle);
        runs.insert(handle.attempt_id.clone(), Arc::clone(&handle));
        Some(handle)
    }

    pub fn get(&self, attempt_id: &Id) -> Option<Arc<RunHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(attempt_id)
            .cloned()
    }

    pub fn remove(&self, attempt_id: &Id) -> Option<Arc<RunHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(attempt_id)
    }

    pub fn contains(&self, attempt_id: &Id) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(attempt_id)
    }

    /// Abort a run in flight. Returns false when the attempt has none.
    pub fn abort(&self, attempt_id: &Id) -> bool {
        match self.get(attempt_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Attempts with a run in flight.
    pub fn ids(&self) -> Vec<Id> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
