//! Core types for the attempt orchestrator.
//!
//! Attempts, conversation items, todo summaries and automation stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for attempts, boards and cards.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Attempt lifecycle status.
///
/// `queued -> running -> {succeeded | failed | stopped}`, with `stopping`
/// reachable only from `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses end an attempt run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Succeeded | Self::Failed)
    }

    /// Active statuses block a second run of the same attempt.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Running, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            // A crashed run can leave a queued attempt that is stopped before it starts.
            (Self::Queued, Self::Stopped | Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            // Re-queue of a finished attempt.
            (current, Self::Queued) => current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-configured shell stage run around the agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStage {
    CopyFiles,
    Setup,
    Dev,
    Cleanup,
}

impl AutomationStage {
    pub const ALL: [Self; 4] = [Self::CopyFiles, Self::Setup, Self::Dev, Self::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CopyFiles => "copy_files",
            Self::Setup => "setup",
            Self::Dev => "dev",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for AutomationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an attempt log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    Markdown,
    Plain,
}

/// Outcome of a tool call or automation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

// --- Conversation items ---

/// A correlated tool invocation (begin + end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub status: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of one automation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationItem {
    pub stage: AutomationStage,
    pub command: String,
    pub cwd: String,
    pub status: RunState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Carries `pid` for a still-running `dev` stage.
    pub metadata: serde_json::Value,
}

/// One canonical unit of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: MessageRole,
        text: String,
        #[serde(default)]
        format: MessageFormat,
    },
    Thinking {
        text: String,
    },
    Tool(ToolItem),
    Error {
        text: String,
    },
    Todo {
        summary: AttemptTodoSummary,
    },
    Automation(AutomationItem),
}

impl ConversationItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Thinking { .. } => "thinking",
            Self::Tool(_) => "tool",
            Self::Error { .. } => "error",
            Self::Todo { .. } => "todo",
            Self::Automation(_) => "automation",
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::Assistant,
            text: text.into(),
            format: MessageFormat::Markdown,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }
}

// --- Todos ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Open,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub status: TodoStatus,
}

/// Snapshot of an agent's todo list. Replaces the previous snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttemptTodoSummary {
    pub total: u32,
    pub completed: u32,
    pub items: Vec<TodoItem>,
}

impl AttemptTodoSummary {
    pub fn from_items(items: Vec<TodoItem>) -> Self {
        let completed = items
            .iter()
            .filter(|item| item.status == TodoStatus::Done)
            .count() as u32;
        Self {
            total: items.len() as u32,
            completed,
            items,
        }
    }
}

// --- Attempts ---

/// One execution of an agent against a card's branch/worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Id,
    pub board_id: Id,
    pub card_id: Id,
    pub agent_key: String,
    pub status: AttemptStatus,
    pub base_branch: String,
    pub branch_name: String,
    pub worktree_path: Option<String>,
    pub session_id: Option<String>,
    pub profile_id: Option<String>,
    /// Planning runs share the state machine but use plan-only prompts.
    pub is_planning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A persisted conversation item with its per-attempt sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub attempt_id: Id,
    pub seq: i64,
    pub item: ConversationItem,
    pub created_at: DateTime<Utc>,
}

/// A persisted attempt log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub attempt_id: Id,
    pub level: LogLevel,
    pub message: String,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn attempt_status_round_trips_through_str() {
        for status in [
            AttemptStatus::Queued,
            AttemptStatus::Running,
            AttemptStatus::Stopping,
            AttemptStatus::Stopped,
            AttemptStatus::Succeeded,
            AttemptStatus::Failed,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttemptStatus::parse("paused"), None);
    }

    #[test]
    fn stopping_only_follows_running() {
        assert!(AttemptStatus::Running.can_transition_to(AttemptStatus::Stopping));
        assert!(!AttemptStatus::Queued.can_transition_to(AttemptStatus::Stopping));
        assert!(AttemptStatus::Stopping.can_transition_to(AttemptStatus::Stopped));
        assert!(!AttemptStatus::Stopping.can_transition_to(AttemptStatus::Failed));
    }

    #[test]
    fn terminal_statuses_can_be_requeued() {
        assert!(AttemptStatus::Failed.can_transition_to(AttemptStatus::Queued));
        assert!(AttemptStatus::Succeeded.can_transition_to(AttemptStatus::Queued));
        assert!(!AttemptStatus::Running.can_transition_to(AttemptStatus::Queued));
    }

    #[test]
    fn automation_stage_names() {
        assert_eq!(AutomationStage::CopyFiles.as_str(), "copy_files");
        assert_eq!(
            serde_json::to_string(&AutomationStage::Cleanup).unwrap(),
            "\"cleanup\""
        );
    }

    #[test]
    fn conversation_item_is_tagged_by_type() {
        let item = ConversationItem::assistant("hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["format"], "markdown");

        let thinking = ConversationItem::Thinking {
            text: "hmm".to_string(),
        };
        let json = serde_json::to_string(&thinking).unwrap();
        let back: ConversationItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, thinking);
    }

    #[test]
    fn tool_item_omits_empty_fields() {
        let item = ConversationItem::Tool(ToolItem {
            name: "shell".to_string(),
            command: Some("ls".to_string()),
            cwd: None,
            status: RunState::Succeeded,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: Some(12),
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            metadata: None,
        });
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "tool");
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("cwd").is_none());
        assert!(json.get("stdout").is_none());
    }

    #[test]
    fn todo_summary_counts_done_items() {
        let summary = AttemptTodoSummary::from_items(vec![
            TodoItem {
                id: "1".to_string(),
                text: "write tests".to_string(),
                status: TodoStatus::Done,
            },
            TodoItem {
                id: "2".to_string(),
                text: "ship".to_string(),
                status: TodoStatus::Open,
            },
        ]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
    }
}
