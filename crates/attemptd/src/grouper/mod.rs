//! Stream normalization.
//!
//! Each agent protocol has a parser that turns raw frames into
//! `NormalizedEvent`s. One shared `Grouper` then applies buffering and
//! correlation and produces the `AttemptEvent`s handed to the emit channel:
//!
//! - reasoning deltas are buffered into one `thinking` item, flushed on the
//!   next non-reasoning event or at stream end
//! - assistant text parts are buffered per (session, message, part) and
//!   emitted once the part or its owning message completes
//! - tool begin/end are correlated by call id, or FIFO when the protocol has
//!   no ids; a result with no begin is logged as a warning
//! - the first session id is latched and later ones are ignored; a run that
//!   continues a known session starts latched

pub mod codex;
pub mod droid;
pub mod opencode;

use attempt_core::{
    AttemptEvent, AttemptTodoSummary, ConversationItem, LogLevel, MessageFormat, MessageRole,
    RunState, TodoItem, ToolItem,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;
use tracing::debug;

/// Identity of one streamed assistant text part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartKey {
    pub session_id: String,
    pub message_id: String,
    pub part_id: String,
}

/// Start of a tool invocation awaiting its result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolStart {
    pub call_id: Option<String>,
    pub name: String,
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolEnd {
    pub call_id: Option<String>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Protocol-independent event produced by the per-agent parsers.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    SessionStarted(String),
    ReasoningDelta(String),
    /// Latest full text of a streamed part; `done` marks it complete.
    TextPart {
        key: PartKey,
        text: String,
        done: bool,
    },
    /// The owning message finished; its buffered parts are complete.
    MessageCompleted {
        session_id: String,
        message_id: String,
    },
    /// A complete message (no part buffering needed).
    Message { role: MessageRole, text: String },
    ToolStarted(ToolStart),
    ToolFinished(ToolEnd),
    /// A tool call reported only once, already complete.
    ToolCall(ToolItem),
    Todos(Vec<TodoItem>),
    Error(String),
    Log { level: LogLevel, message: String },
    /// End of a turn; buffers are flushed.
    TurnCompleted,
}

/// What a session stream does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The turn finished normally.
    Completed,
    /// The session reported a fatal error.
    Failed,
}

#[derive(Debug, Clone)]
struct PendingTool {
    start: ToolStart,
    started_at: DateTime<Utc>,
}

/// Buffers and correlates normalized events for one attempt's stream.
#[derive(Debug, Default)]
pub struct Grouper {
    thinking: String,
    parts: Vec<(PartKey, String)>,
    pending_by_id: HashMap<String, PendingTool>,
    pending_fifo: VecDeque<PendingTool>,
    session_id: Option<String>,
    suppress_conversation: bool,
}

impl Grouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A grouper that drops conversation output (ping runs).
    pub fn suppressing_conversation() -> Self {
        Self {
            suppress_conversation: true,
            ..Self::default()
        }
    }

    /// Treat `id` as already recorded: no `Session` event is emitted for it
    /// and later ids are ignored.
    pub fn latch_session(&mut self, id: impl Into<String>) {
        self.session_id = Some(id.into());
    }

    /// The latched session id, if one was seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn handle(&mut self, event: NormalizedEvent) -> Vec<AttemptEvent> {
        let mut out = Vec::new();

        if let NormalizedEvent::ReasoningDelta(text) = event {
            self.thinking.push_str(&text);
            return out;
        }
        self.flush_thinking(&mut out);

        match event {
            NormalizedEvent::ReasoningDelta(_) => {}
            NormalizedEvent::SessionStarted(id) => {
                if self.session_id.is_none() {
                    self.session_id = Some(id.clone());
                    out.push(AttemptEvent::Session { id });
                } else {
                    debug!(session_id = %id, "ignoring later session id");
                }
            }
            NormalizedEvent::TextPart { key, text, done } => {
                let index = self.parts.iter().position(|(k, _)| *k == key);
                if done {
                    if let Some(index) = index {
                        self.parts.remove(index);
                    }
                    self.push_message(&mut out, MessageRole::Assistant, text);
                } else {
                    match index {
                        Some(index) => self.parts[index].1 = text,
                        None => self.parts.push((key, text)),
                    }
                }
            }
            NormalizedEvent::MessageCompleted {
                session_id,
                message_id,
            } => {
                let (done, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parts)
                    .into_iter()
                    .partition(|(k, _)| k.session_id == session_id && k.message_id == message_id);
                self.parts = open;
                for (_, text) in done {
                    self.push_message(&mut out, MessageRole::Assistant, text);
                }
            }
            NormalizedEvent::Message { role, text } => self.push_message(&mut out, role, text),
            NormalizedEvent::ToolStarted(start) => {
                let pending = PendingTool {
                    start,
                    started_at: Utc::now(),
                };
                match pending.start.call_id.clone() {
                    Some(id) => {
                        self.pending_by_id.insert(id, pending);
                    }
                    None => self.pending_fifo.push_back(pending),
                }
            }
            NormalizedEvent::ToolFinished(end) => {
                let pending = match &end.call_id {
                    Some(id) => self.pending_by_id.remove(id),
                    None => self.pending_fifo.pop_front(),
                };
                match pending {
                    Some(pending) => {
                        let item = finish_tool(pending, end);
                        self.push_conversation(&mut out, ConversationItem::Tool(item));
                    }
                    None => out.push(AttemptEvent::warn(format!(
                        "tool result without a matching call (call_id: {})",
                        end.call_id.as_deref().unwrap_or("none")
                    ))),
                }
            }
            NormalizedEvent::ToolCall(item) => {
                self.push_conversation(&mut out, ConversationItem::Tool(item));
            }
            NormalizedEvent::Todos(items) => {
                let summary = AttemptTodoSummary::from_items(items);
                out.push(AttemptEvent::Todo {
                    summary: summary.clone(),
                });
                self.push_conversation(&mut out, ConversationItem::Todo { summary });
            }
            NormalizedEvent::Error(text) => {
                self.push_conversation(&mut out, ConversationItem::error(text));
            }
            NormalizedEvent::Log { level, message } => out.push(AttemptEvent::log(level, message)),
            NormalizedEvent::TurnCompleted => self.flush_into(&mut out),
        }
        out
    }

    /// Force-emit every buffer: thinking, unfinished text parts, and tool
    /// calls that never got a result (reported as failed).
    pub fn flush(&mut self) -> Vec<AttemptEvent> {
        let mut out = Vec::new();
        self.flush_into(&mut out);
        out
    }

    fn flush_into(&mut self, out: &mut Vec<AttemptEvent>) {
        self.flush_thinking(out);
        for (_, text) in std::mem::take(&mut self.parts) {
            self.push_message(out, MessageRole::Assistant, text);
        }

        let mut unfinished: Vec<PendingTool> = self.pending_fifo.drain(..).collect();
        unfinished.extend(self.pending_by_id.drain().map(|(_, p)| p));
        unfinished.sort_by_key(|p| p.started_at);
        for pending in unfinished {
            let item = finish_tool(
                pending,
                ToolEnd {
                    success: false,
                    ..ToolEnd::default()
                },
            );
            self.push_conversation(out, ConversationItem::Tool(item));
        }
    }

    fn flush_thinking(&mut self, out: &mut Vec<AttemptEvent>) {
        if self.thinking.trim().is_empty() {
            self.thinking.clear();
            return;
        }
        let text = std::mem::take(&mut self.thinking).trim_end().to_string();
        self.push_conversation(out, ConversationItem::Thinking { text });
    }

    fn push_message(&self, out: &mut Vec<AttemptEvent>, role: MessageRole, text: String) {
        if text.trim().is_empty() {
            return;
        }
        self.push_conversation(
            out,
            ConversationItem::Message {
                role,
                text,
                format: MessageFormat::Markdown,
            },
        );
    }

    fn push_conversation(&self, out: &mut Vec<AttemptEvent>, item: ConversationItem) {
        if !self.suppress_conversation {
            out.push(AttemptEvent::conversation(item));
        }
    }
}

fn finish_tool(pending: PendingTool, end: ToolEnd) -> ToolItem {
    let completed_at = Utc::now();
    let duration_ms = (completed_at - pending.started_at).num_milliseconds().max(0) as u64;
    let metadata = match (pending.start.metadata, end.metadata) {
        (Some(mut start), Some(end)) => {
            if let (Some(start), serde_json::Value::Object(end)) = (start.as_object_mut(), end) {
                start.extend(end);
            }
            Some(start)
        }
        (start, end) => end.or(start),
    };
    ToolItem {
        name: pending.start.name,
        command: pending.start.command,
        cwd: pending.start.cwd,
        status: if end.success {
            RunState::Succeeded
        } else {
            RunState::Failed
        },
        started_at: pending.started_at,
        completed_at: Some(completed_at),
        duration_ms: Some(duration_ms),
        exit_code: end.exit_code,
        stdout: end.stdout,
        stderr: end.stderr,
        metadata,
    }
}

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI regex")
});

/// Strip ANSI escape sequences and control characters (tabs are kept).
pub fn sanitize_line(line: &str) -> String {
    ANSI_RE
        .replace_all(line, "")
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect()
}

/// Parse a line as JSON, falling back to one sanitize-and-extract pass.
///
/// The fallback strips escapes, then parses the outermost `{...}` span when
/// the line does not start with `{`. Returns `None` when both fail.
pub fn parse_json_line(line: &str) -> Option<serde_json::Value> {
    let trimmed = line.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let clean = sanitize_line(trimmed);
    let clean = clean.trim();
    let candidate = if clean.starts_with('{') {
        clean
    } else {
        let start = clean.find('{')?;
        let end = clean.rfind('}')?;
        if end <= start {
            return None;
        }
        &clean[start..=end]
    };
    serde_json::from_str::<serde_json::Value>(candidate)
        .ok()
        .filter(serde_json::Value::is_object)
}

/// Read `value[key]` as a string.
pub(crate) fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(serde_json::Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(part: &str) -> PartKey {
        PartKey {
            session_id: "s".to_string(),
            message_id: "m".to_string(),
            part_id: part.to_string(),
        }
    }

    fn conversation(events: &[AttemptEvent]) -> Vec<&ConversationItem> {
        events
            .iter()
            .filter_map(|e| match e {
                AttemptEvent::Conversation { item } => Some(item),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn reasoning_is_flushed_as_one_thinking_item() {
        let mut grouper = Grouper::new();
        assert!(grouper
            .handle(NormalizedEvent::ReasoningDelta("Let me ".to_string()))
            .is_empty());
        assert!(grouper
            .handle(NormalizedEvent::ReasoningDelta("think.".to_string()))
            .is_empty());

        let out = grouper.handle(NormalizedEvent::Message {
            role: MessageRole::Assistant,
            text: "Done".to_string(),
        });
        let items = conversation(&out);
        assert_eq!(items.len(), 2);
        assert_eq!(
            *items[0],
            ConversationItem::Thinking {
                text: "Let me think.".to_string()
            }
        );
        assert_eq!(*items[1], ConversationItem::assistant("Done"));
    }

    #[test]
    fn text_parts_emit_only_when_done() {
        let mut grouper = Grouper::new();
        let partial = grouper.handle(NormalizedEvent::TextPart {
            key: key("p1"),
            text: "Hel".to_string(),
            done: false,
        });
        assert!(partial.is_empty());
        grouper.handle(NormalizedEvent::TextPart {
            key: key("p1"),
            text: "Hello".to_string(),
            done: false,
        });
        let done = grouper.handle(NormalizedEvent::TextPart {
            key: key("p1"),
            text: "Hello world".to_string(),
            done: true,
        });
        assert_eq!(conversation(&done), vec![&ConversationItem::assistant("Hello world")]);
        assert!(grouper.flush().is_empty());
    }

    #[test]
    fn flush_emits_unfinished_parts_in_order() {
        let mut grouper = Grouper::new();
        grouper.handle(NormalizedEvent::TextPart {
            key: key("a"),
            text: "first".to_string(),
            done: false,
        });
        grouper.handle(NormalizedEvent::TextPart {
            key: key("b"),
            text: "second".to_string(),
            done: false,
        });
        let out = grouper.flush();
        assert_eq!(
            conversation(&out),
            vec![
                &ConversationItem::assistant("first"),
                &ConversationItem::assistant("second")
            ]
        );
    }

    #[test]
    fn tools_correlate_by_call_id() {
        let mut grouper = Grouper::new();
        for id in ["c1", "c2"] {
            grouper.handle(NormalizedEvent::ToolStarted(ToolStart {
                call_id: Some(id.to_string()),
                name: "shell".to_string(),
                command: Some(format!("cmd-{id}")),
                cwd: None,
                metadata: None,
            }));
        }
        let out = grouper.handle(NormalizedEvent::ToolFinished(ToolEnd {
            call_id: Some("c2".to_string()),
            success: true,
            exit_code: Some(0),
            ..ToolEnd::default()
        }));
        match conversation(&out).as_slice() {
            [ConversationItem::Tool(tool)] => {
                assert_eq!(tool.command.as_deref(), Some("cmd-c2"));
                assert_eq!(tool.status, RunState::Succeeded);
                assert!(tool.completed_at.is_some());
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn tools_without_ids_correlate_fifo() {
        let mut grouper = Grouper::new();
        for name in ["first", "second"] {
            grouper.handle(NormalizedEvent::ToolStarted(ToolStart {
                call_id: None,
                name: name.to_string(),
                command: None,
                cwd: None,
                metadata: None,
            }));
        }
        let out = grouper.handle(NormalizedEvent::ToolFinished(ToolEnd {
            success: false,
            exit_code: Some(1),
            ..ToolEnd::default()
        }));
        match conversation(&out).as_slice() {
            [ConversationItem::Tool(tool)] => {
                assert_eq!(tool.name, "first");
                assert_eq!(tool.status, RunState::Failed);
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn orphan_tool_result_is_a_warning() {
        let mut grouper = Grouper::new();
        let out = grouper.handle(NormalizedEvent::ToolFinished(ToolEnd {
            call_id: Some("missing".to_string()),
            success: true,
            ..ToolEnd::default()
        }));
        assert_eq!(out.len(), 1);
        match &out[0] {
            AttemptEvent::Log { level, message } => {
                assert_eq!(*level, LogLevel::Warn);
                assert!(message.contains("missing"));
            }
            other => panic!("expected warn log, got {other:?}"),
        }
    }

    #[test]
    fn first_session_id_is_latched() {
        let mut grouper = Grouper::new();
        let first = grouper.handle(NormalizedEvent::SessionStarted("one".to_string()));
        let second = grouper.handle(NormalizedEvent::SessionStarted("two".to_string()));
        assert_eq!(
            first,
            vec![AttemptEvent::Session {
                id: "one".to_string()
            }]
        );
        assert!(second.is_empty());
        assert_eq!(grouper.session_id(), Some("one"));
    }

    #[test]
    fn latched_session_is_not_emitted_again() {
        let mut grouper = Grouper::new();
        grouper.latch_session("known");
        assert!(grouper
            .handle(NormalizedEvent::SessionStarted("known".to_string()))
            .is_empty());
        assert!(grouper
            .handle(NormalizedEvent::SessionStarted("other".to_string()))
            .is_empty());
        assert_eq!(grouper.session_id(), Some("known"));
    }

    #[test]
    fn message_completion_flushes_only_its_parts() {
        let mut grouper = Grouper::new();
        for (message, part, text) in [("m", "a", "first"), ("n", "b", "other"), ("m", "c", "second")] {
            grouper.handle(NormalizedEvent::TextPart {
                key: PartKey {
                    session_id: "s".to_string(),
                    message_id: message.to_string(),
                    part_id: part.to_string(),
                },
                text: text.to_string(),
                done: false,
            });
        }
        let out = grouper.handle(NormalizedEvent::MessageCompleted {
            session_id: "s".to_string(),
            message_id: "m".to_string(),
        });
        assert_eq!(
            conversation(&out),
            vec![
                &ConversationItem::assistant("first"),
                &ConversationItem::assistant("second")
            ]
        );
        assert_eq!(
            conversation(&grouper.flush()),
            vec![&ConversationItem::assistant("other")]
        );
    }

    #[test]
    fn todos_replace_snapshot_and_append_item() {
        let mut grouper = Grouper::new();
        let out = grouper.handle(NormalizedEvent::Todos(vec![TodoItem {
            id: "1".to_string(),
            text: "write tests".to_string(),
            status: attempt_core::TodoStatus::Done,
        }]));
        assert!(matches!(
            &out[0],
            AttemptEvent::Todo { summary } if summary.completed == 1 && summary.total == 1
        ));
        assert!(matches!(
            &out[1],
            AttemptEvent::Conversation {
                item: ConversationItem::Todo { .. }
            }
        ));
    }

    #[test]
    fn suppressing_grouper_keeps_session_only() {
        let mut grouper = Grouper::suppressing_conversation();
        let out = grouper.handle(NormalizedEvent::SessionStarted("s1".to_string()));
        assert_eq!(out.len(), 1);
        let out = grouper.handle(NormalizedEvent::Message {
            role: MessageRole::Assistant,
            text: "pong".to_string(),
        });
        assert!(out.is_empty());
    }

    #[test]
    fn flush_fails_unfinished_tools() {
        let mut grouper = Grouper::new();
        grouper.handle(NormalizedEvent::ToolStarted(ToolStart {
            call_id: Some("c1".to_string()),
            name: "shell".to_string(),
            command: None,
            cwd: None,
            metadata: None,
        }));
        let out = grouper.flush();
        match conversation(&out).as_slice() {
            [ConversationItem::Tool(tool)] => assert_eq!(tool.status, RunState::Failed),
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn sanitize_strips_escapes_and_controls() {
        assert_eq!(sanitize_line("\x1b[32mINFO\x1b[0m ready\x07"), "INFO ready");
        assert_eq!(sanitize_line("a\tb"), "a\tb");
    }

    #[test]
    fn parse_json_line_extracts_embedded_object() {
        let value = parse_json_line("\x1b[2m12:00:01\x1b[0m DEBUG {\"type\":\"x\",\"n\":1} trailing")
            .unwrap();
        assert_eq!(value["type"], "x");

        assert!(parse_json_line("{\"type\":\"y\"}").is_some());
        assert!(parse_json_line("plain text line").is_none());
        assert!(parse_json_line("[1,2,3]").is_none());
        assert!(parse_json_line("broken {\"a\": } line").is_none());
    }
}
