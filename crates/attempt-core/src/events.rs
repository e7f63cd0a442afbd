//! Event types for attempt emission and the domain bus.
//!
//! `AttemptEvent` is what adapters hand to the emit channel; `DomainEvent`
//! is what the channel republishes after persisting.

use crate::types::{AttemptStatus, AttemptTodoSummary, ConversationItem, Id, LogLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The emit union passed from adapters and groupers to the emission channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptEvent {
    Log { level: LogLevel, message: String },
    Status { status: AttemptStatus },
    Session { id: String },
    Conversation { item: ConversationItem },
    Todo { summary: AttemptTodoSummary },
}

impl AttemptEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }

    pub fn conversation(item: ConversationItem) -> Self {
        Self::Conversation { item }
    }

    /// Log and conversation events are agent chatter and are dropped after a stop.
    pub fn is_suppressible(&self) -> bool {
        matches!(self, Self::Log { .. } | Self::Conversation { .. })
    }
}

/// Domain event names published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainEventType {
    #[serde(rename = "attempt.log.appended")]
    LogAppended,
    #[serde(rename = "attempt.status.changed")]
    StatusChanged,
    #[serde(rename = "attempt.session.recorded")]
    SessionRecorded,
    #[serde(rename = "attempt.conversation.appended")]
    ConversationAppended,
    #[serde(rename = "attempt.todos.updated")]
    TodosUpdated,
    #[serde(rename = "attempt.completed")]
    Completed,
}

impl DomainEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogAppended => "attempt.log.appended",
            Self::StatusChanged => "attempt.status.changed",
            Self::SessionRecorded => "attempt.session.recorded",
            Self::ConversationAppended => "attempt.conversation.appended",
            Self::TodosUpdated => "attempt.todos.updated",
            Self::Completed => "attempt.completed",
        }
    }
}

/// Payload for `attempt.conversation.appended`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationAppendedPayload {
    pub seq: i64,
    pub item: ConversationItem,
}

/// Payload for `attempt.status.changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusChangedPayload {
    pub status: AttemptStatus,
}

/// Payload for `attempt.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPayload {
    pub status: AttemptStatus,
    pub exit_code: Option<i32>,
}

/// Union of all domain event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainPayload {
    Log { level: LogLevel, message: String },
    Status(StatusChangedPayload),
    Session { session_id: String },
    Conversation(ConversationAppendedPayload),
    Todos(AttemptTodoSummary),
    Completed(CompletedPayload),
}

impl DomainPayload {
    pub fn event_type(&self) -> DomainEventType {
        match self {
            Self::Log { .. } => DomainEventType::LogAppended,
            Self::Status(_) => DomainEventType::StatusChanged,
            Self::Session { .. } => DomainEventType::SessionRecorded,
            Self::Conversation(_) => DomainEventType::ConversationAppended,
            Self::Todos(_) => DomainEventType::TodosUpdated,
            Self::Completed(_) => DomainEventType::Completed,
        }
    }
}

/// An event republished on the domain bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: DomainEventType,
    pub attempt_id: Id,
    pub board_id: Id,
    pub ts: DateTime<Utc>,
    pub payload: DomainPayload,
}

impl DomainEvent {
    pub fn new(attempt_id: &Id, board_id: &Id, payload: DomainPayload) -> Self {
        Self {
            event_type: payload.event_type(),
            attempt_id: attempt_id.clone(),
            board_id: board_id.clone(),
            ts: Utc::now(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
