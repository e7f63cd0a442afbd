//! Worktree provider interface and the native git implementation.
//!
//! Each attempt runs in its own git worktree under `worktree_root`. Creation
//! and removal are blocking git calls; async callers go through
//! `spawn_blocking`.

use attempt_core::prompt::slugify;
use attempt_core::Id;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree path exists and is not a worktree: {0}")]
    PathOccupied(String),
    #[error("worktree task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Identifies the attempt a worktree belongs to (for logging).
#[derive(Debug, Clone)]
pub struct WorktreeMeta {
    pub attempt_id: Id,
    pub board_id: Id,
    pub card_id: Id,
}

/// Worktree lifecycle management.
pub trait WorktreeProvider: Send + Sync {
    /// Create a worktree at `out_dir` with `branch` checked out, branching from
    /// `base_branch` when needed. Returns the worktree path.
    fn create_worktree(
        &self,
        repo: &Path,
        base_branch: &str,
        branch: &str,
        out_dir: &Path,
        meta: &WorktreeMeta,
    ) -> Result<PathBuf>;

    fn remove_worktree(&self, repo: &Path, path: &Path, meta: &WorktreeMeta) -> Result<()>;

    /// Canonical location for an attempt's worktree.
    fn worktree_path(&self, board_id: &Id, attempt_id: &Id) -> PathBuf;

    /// Human-readable location keyed by project and task name.
    fn worktree_path_by_names(&self, project: &str, task: &str) -> PathBuf;
}

/// Git worktree provider using native git commands.
#[derive(Debug, Clone)]
pub struct GitWorktreeProvider {
    root: PathBuf,
}

impl GitWorktreeProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorktreeProvider for GitWorktreeProvider {
    fn create_worktree(
        &self,
        repo: &Path,
        base_branch: &str,
        branch: &str,
        out_dir: &Path,
        meta: &WorktreeMeta,
    ) -> Result<PathBuf> {
        if out_dir.exists() {
            // Resumed attempts reuse their worktree.
            if git::is_registered_worktree(repo, out_dir)? {
                debug!(attempt_id = %meta.attempt_id, path = %out_dir.display(), "reusing worktree");
                return Ok(out_dir.to_path_buf());
            }
            return Err(WorktreeError::PathOccupied(out_dir.display().to_string()));
        }

        git::create_worktree(repo, out_dir, branch, base_branch)?;
        info!(
            attempt_id = %meta.attempt_id,
            card_id = %meta.card_id,
            branch,
            path = %out_dir.display(),
            "worktree created"
        );
        Ok(out_dir.to_path_buf())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path, meta: &WorktreeMeta) -> Result<()> {
        git::remove_worktree(repo, path)?;
        info!(attempt_id = %meta.attempt_id, path = %path.display(), "worktree removed");
        Ok(())
    }

    fn worktree_path(&self, board_id: &Id, attempt_id: &Id) -> PathBuf {
        self.root.join(board_id.as_ref()).join(attempt_id.as_ref())
    }

    fn worktree_path_by_names(&self, project: &str, task: &str) -> PathBuf {
        self.root.join(slugify(project)).join(slugify(task))
    }
}
