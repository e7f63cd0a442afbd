//! Native git commands used by the worktree provider.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run `git <args>` in `repo` and return trimmed stdout.
fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(repo).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Whether `git <args>` exits successfully.
fn git_ok(repo: &Path, args: &[&str]) -> Result<bool> {
    let output = Command::new("git").args(args).current_dir(repo).output()?;
    Ok(output.status.success())
}

/// Default branch: `origin/HEAD` when known, else `main`, else `master`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    git_ok(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
}

/// Create `branch` from `base` without checking it out.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git(repo, &["branch", branch, base]).map(|_| ())
}

/// Whether `path` is already registered as a worktree of `repo`.
pub fn is_registered_worktree(repo: &Path, path: &Path) -> Result<bool> {
    let listing = git(repo, &["worktree", "list", "--porcelain"])?;
    let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(listing
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .any(|p| {
            let p = Path::new(p);
            p.canonicalize().unwrap_or_else(|_| p.to_path_buf()) == wanted
        }))
}

/// Add a worktree at `worktree_path` with `branch` checked out.
///
/// The branch is created from `base_branch` when it does not exist yet.
pub fn create_worktree(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }

    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base_branch)?;
    }

    git(
        repo,
        &["worktree", "add", &worktree_path.to_string_lossy(), branch],
    )
    .map(|_| ())
}

/// Remove a worktree, forcing removal when it has local changes.
pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    if git(repo, &["worktree", "remove", &path]).is_ok() {
        return Ok(());
    }
    git(repo, &["worktree", "remove", "--force", &path]).map(|_| ())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a git repository with one commit on `main`.
    pub(crate) fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(status.status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);
        dir
    }

    #[test]
    fn detects_main_branch() {
        let repo = setup_test_repo();
        assert_eq!(detect_default_branch(repo.path()).unwrap(), "main");
    }

    #[test]
    fn create_and_remove_worktree() {
        let repo = setup_test_repo();
        let out = TempDir::new().unwrap();
        let wt = out.path().join("wt").join("attempt-1");

        create_worktree(repo.path(), &wt, "attempt/feature", "main").unwrap();
        assert!(wt.join("README.md").exists());
        assert!(branch_exists(repo.path(), "attempt/feature").unwrap());
        assert!(is_registered_worktree(repo.path(), &wt).unwrap());

        std::fs::write(wt.join("scratch.txt"), "dirty").unwrap();
        remove_worktree(repo.path(), &wt).unwrap();
        assert!(!wt.exists());
        assert!(!is_registered_worktree(repo.path(), &wt).unwrap());
    }

    #[test]
    fn create_worktree_with_unknown_base_fails() {
        let repo = setup_test_repo();
        let out = TempDir::new().unwrap();
        let result = create_worktree(repo.path(), &out.path().join("wt"), "b", "no-such-base");
        assert!(matches!(result, Err(GitError::CommandFailed(_))));
    }
}
