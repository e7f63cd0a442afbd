//! attemptd - Attempt Orchestration Daemon
//!
//! Runs coding agents against board cards in isolated git worktrees and
//! persists their normalized output.

pub mod agent;
pub mod automation;
pub mod bus;
pub mod emit;
pub mod git;
pub mod grouper;
pub mod lifecycle;
pub mod proc;
pub mod registry;
pub mod storage;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;

use agent::AgentRegistry;
use attempt_core::Config;
use bus::EventBus;
use lifecycle::Orchestrator;
use storage::SqliteRepository;
use tracing::info;
use worktree::GitWorktreeProvider;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    pub bus_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bus_capacity: bus::DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Get the default database path (~/.local/share/attemptd/attempts.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("attemptd").join("attempts.db")
}

/// Open (and migrate) the database and wire an orchestrator with the
/// built-in agents and git worktrees.
pub async fn open_orchestrator(
    daemon: &DaemonConfig,
    config: Config,
) -> storage::Result<Orchestrator> {
    let repo = SqliteRepository::new(&daemon.db_path).await?;
    repo.migrate_embedded().await?;
    info!(db = %daemon.db_path.display(), "database ready");

    let agents = AgentRegistry::with_builtin(&config);
    let worktrees = Arc::new(GitWorktreeProvider::new(config.worktree_root.clone()));
    Ok(Orchestrator::new(
        Arc::new(repo),
        EventBus::new(daemon.bus_capacity),
        agents,
        worktrees,
        config,
    ))
}
