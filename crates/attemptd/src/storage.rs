//! SQLite storage for attempts.
//!
//! `AttemptsRepository` is the persistence contract the lifecycle controller and
//! the emit channel depend on; `SqliteRepository` implements it with sqlx.

use async_trait::async_trait;
use attempt_core::{
    Attempt, AttemptStatus, AttemptTodoSummary, ConversationItem, ConversationRecord, Id,
    LogLevel, LogRecord,
};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePoolOptions, SqliteQueryResult},
    Pool, Sqlite,
};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for attempts table queries.
const ATTEMPTS_COLUMNS: &str = "id, board_id, card_id, agent_key, status, base_branch, \
    branch_name, worktree_path, session_id, profile_id, is_planning, created_at, updated_at, \
    started_at, ended_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("attempt {id} is already {status}")]
    AlreadyActive { id: String, status: AttemptStatus },
    #[error("attempt {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: String,
        from: AttemptStatus,
        to: AttemptStatus,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence contract for attempts and their streamed output.
#[async_trait]
pub trait AttemptsRepository: Send + Sync {
    /// Insert a new attempt.
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()>;

    /// Overwrite the mutable fields of an existing attempt.
    async fn update_attempt(&self, attempt: &Attempt) -> Result<()>;

    async fn get_attempt(&self, id: &Id) -> Result<Attempt>;

    /// The single live attempt for a card, if any.
    async fn find_attempt_by_card(&self, board_id: &Id, card_id: &Id) -> Result<Option<Attempt>>;

    /// Reset an existing attempt to `queued`, clearing run timestamps.
    ///
    /// Fails with `AlreadyActive` when the attempt is running or stopping.
    async fn requeue_attempt(&self, id: &Id) -> Result<Attempt>;

    /// Record a status; `running` stamps `started_at`, terminal statuses stamp `ended_at`.
    ///
    /// Fails with `IllegalTransition` unless the stored status may move to
    /// `status` (see `AttemptStatus::can_transition_to`).
    async fn update_attempt_status(&self, id: &Id, status: AttemptStatus) -> Result<()>;

    async fn set_session_id(&self, id: &Id, session_id: &str) -> Result<()>;

    async fn set_worktree_path(&self, id: &Id, worktree_path: &str) -> Result<()>;

    async fn insert_log(&self, id: &Id, level: LogLevel, message: &str) -> Result<LogRecord>;

    async fn list_logs(&self, id: &Id) -> Result<Vec<LogRecord>>;

    /// Next conversation sequence number (1-based).
    async fn next_seq(&self, id: &Id) -> Result<i64>;

    async fn insert_conversation_item(
        &self,
        id: &Id,
        seq: i64,
        item: &ConversationItem,
    ) -> Result<ConversationRecord>;

    /// Conversation items ordered by sequence.
    async fn list_conversation(&self, id: &Id) -> Result<Vec<ConversationRecord>>;

    /// Replace the todo snapshot for an attempt.
    async fn upsert_todos(&self, id: &Id, summary: &AttemptTodoSummary) -> Result<()>;

    async fn get_todos(&self, id: &Id) -> Result<Option<AttemptTodoSummary>>;
}

/// SQLite-backed repository.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the compiled-in migrations. Safe to call repeatedly.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_attempts.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Map an UPDATE that touched no rows to `AttemptNotFound`.
fn ensure_found(result: &SqliteQueryResult, id: &Id) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(StorageError::AttemptNotFound(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl AttemptsRepository for SqliteRepository {
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempts (id, board_id, card_id, agent_key, status, base_branch,
                                  branch_name, worktree_path, session_id, profile_id, is_planning,
                                  created_at, updated_at, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(attempt.id.as_ref())
        .bind(attempt.board_id.as_ref())
        .bind(attempt.card_id.as_ref())
        .bind(&attempt.agent_key)
        .bind(attempt.status.as_str())
        .bind(&attempt.base_branch)
        .bind(&attempt.branch_name)
        .bind(&attempt.worktree_path)
        .bind(&attempt.session_id)
        .bind(&attempt.profile_id)
        .bind(attempt.is_planning)
        .bind(attempt.created_at.timestamp_millis())
        .bind(attempt.updated_at.timestamp_millis())
        .bind(attempt.started_at.map(|t| t.timestamp_millis()))
        .bind(attempt.ended_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_attempt(&self, attempt: &Attempt) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attempts SET agent_key = ?1, status = ?2, base_branch = ?3, branch_name = ?4, \
             worktree_path = ?5, session_id = ?6, profile_id = ?7, is_planning = ?8, \
             updated_at = ?9, started_at = ?10, ended_at = ?11 WHERE id = ?12",
        )
        .bind(&attempt.agent_key)
        .bind(attempt.status.as_str())
        .bind(&attempt.base_branch)
        .bind(&attempt.branch_name)
        .bind(&attempt.worktree_path)
        .bind(&attempt.session_id)
        .bind(&attempt.profile_id)
        .bind(attempt.is_planning)
        .bind(Utc::now().timestamp_millis())
        .bind(attempt.started_at.map(|t| t.timestamp_millis()))
        .bind(attempt.ended_at.map(|t| t.timestamp_millis()))
        .bind(attempt.id.as_ref())
        .execute(&self.pool)
        .await?;
        ensure_found(&result, &attempt.id)
    }

    async fn get_attempt(&self, id: &Id) -> Result<Attempt> {
        let query = format!("SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE id = ?1");
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AttemptNotFound(id.to_string()))?;

        Ok(row.into_attempt())
    }

    async fn find_attempt_by_card(&self, board_id: &Id, card_id: &Id) -> Result<Option<Attempt>> {
        let query =
            format!("SELECT {ATTEMPTS_COLUMNS} FROM attempts WHERE board_id = ?1 AND card_id = ?2");
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(board_id.as_ref())
            .bind(card_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(AttemptRow::into_attempt))
    }

    async fn requeue_attempt(&self, id: &Id) -> Result<Attempt> {
        let now = Utc::now().timestamp_millis();
        // Guarded in SQL so two concurrent requeues cannot both win.
        let result = sqlx::query(
            "UPDATE attempts SET status = 'queued', started_at = NULL, ended_at = NULL, \
             updated_at = ?1 WHERE id = ?2 AND status NOT IN ('running', 'stopping')",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        let attempt = self.get_attempt(id).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyActive {
                id: id.to_string(),
                status: attempt.status,
            });
        }
        Ok(attempt)
    }

    async fn update_attempt_status(&self, id: &Id, status: AttemptStatus) -> Result<()> {
        let sql = if status == AttemptStatus::Running {
            "UPDATE attempts SET status = ?1, updated_at = ?2, started_at = ?2, ended_at = NULL \
             WHERE id = ?3 AND status = ?4"
        } else if status.is_terminal() {
            "UPDATE attempts SET status = ?1, updated_at = ?2, ended_at = ?2 \
             WHERE id = ?3 AND status = ?4"
        } else {
            "UPDATE attempts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4"
        };

        // Compare-and-set against the status the check was made on; retry if
        // another writer moved it in between.
        loop {
            let current = self.get_attempt(id).await?.status;
            if !current.can_transition_to(status) {
                return Err(StorageError::IllegalTransition {
                    id: id.to_string(),
                    from: current,
                    to: status,
                });
            }
            let result = sqlx::query(sql)
                .bind(status.as_str())
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_ref())
                .bind(current.as_str())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
        }
    }

    async fn set_session_id(&self, id: &Id, session_id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE attempts SET session_id = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(session_id)
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        ensure_found(&result, id)
    }

    async fn set_worktree_path(&self, id: &Id, worktree_path: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE attempts SET worktree_path = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(worktree_path)
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        ensure_found(&result, id)
    }

    async fn insert_log(&self, id: &Id, level: LogLevel, message: &str) -> Result<LogRecord> {
        let ts = Utc::now();
        sqlx::query(
            "INSERT INTO attempt_logs (attempt_id, level, message, ts) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id.as_ref())
        .bind(level.as_str())
        .bind(message)
        .bind(ts.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(LogRecord {
            attempt_id: id.clone(),
            level,
            message: message.to_string(),
            ts,
        })
    }

    async fn list_logs(&self, id: &Id) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT attempt_id, level, message, ts FROM attempt_logs WHERE attempt_id = ?1 \
             ORDER BY id ASC",
        )
        .bind(id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LogRow::into_log).collect())
    }

    async fn next_seq(&self, id: &Id) -> Result<i64> {
        let max: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(seq) FROM conversation_items WHERE attempt_id = ?1")
                .bind(id.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(max.0.unwrap_or(0) + 1)
    }

    async fn insert_conversation_item(
        &self,
        id: &Id,
        seq: i64,
        item: &ConversationItem,
    ) -> Result<ConversationRecord> {
        let created_at = Utc::now();
        let item_json = serde_json::to_string(item)?;
        sqlx::query(
            "INSERT INTO conversation_items (attempt_id, seq, item_type, item_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(seq)
        .bind(item.kind())
        .bind(&item_json)
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(ConversationRecord {
            attempt_id: id.clone(),
            seq,
            item: item.clone(),
            created_at,
        })
    }

    async fn list_conversation(&self, id: &Id) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT attempt_id, seq, item_json, created_at FROM conversation_items \
             WHERE attempt_id = ?1 ORDER BY seq ASC",
        )
        .bind(id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConversationRow::into_record).collect()
    }

    async fn upsert_todos(&self, id: &Id, summary: &AttemptTodoSummary) -> Result<()> {
        let summary_json = serde_json::to_string(summary)?;
        sqlx::query(
            "INSERT INTO attempt_todos (attempt_id, summary_json, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT (attempt_id) DO UPDATE SET summary_json = excluded.summary_json, \
             updated_at = excluded.updated_at",
        )
        .bind(id.as_ref())
        .bind(summary_json)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_todos(&self, id: &Id) -> Result<Option<AttemptTodoSummary>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT summary_json FROM attempt_todos WHERE attempt_id = ?1")
                .bind(id.as_ref())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// --- Row types for SQLx ---

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    board_id: String,
    card_id: String,
    agent_key: String,
    status: String,
    base_branch: String,
    branch_name: String,
    worktree_path: Option<String>,
    session_id: Option<String>,
    profile_id: Option<String>,
    is_planning: bool,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl AttemptRow {
    fn into_attempt(self) -> Attempt {
        Attempt {
            id: Id::from_string(self.id),
            board_id: Id::from_string(self.board_id),
            card_id: Id::from_string(self.card_id),
            agent_key: self.agent_key,
            status: AttemptStatus::parse(&self.status).unwrap_or(AttemptStatus::Failed),
            base_branch: self.base_branch,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path,
            session_id: self.session_id,
            profile_id: self.profile_id,
            is_planning: self.is_planning,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            started_at: self.started_at.map(from_millis),
            ended_at: self.ended_at.map(from_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    attempt_id: String,
    level: String,
    message: String,
    ts: i64,
}

impl LogRow {
    fn into_log(self) -> LogRecord {
        LogRecord {
            attempt_id: Id::from_string(self.attempt_id),
            level: LogLevel::parse(&self.level),
            message: self.message,
            ts: from_millis(self.ts),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    attempt_id: String,
    seq: i64,
    item_json: String,
    created_at: i64,
}

impl ConversationRow {
    fn into_record(self) -> Result<ConversationRecord> {
        Ok(ConversationRecord {
            attempt_id: Id::from_string(self.attempt_id),
            seq: self.seq,
            item: serde_json::from_str(&self.item_json)?,
            created_at: from_millis(self.created_at),
        })
    }
}
