//! `codex exec --json` NDJSON frames.
//!
//! Frames are `{"type": ...}` objects. Work happens in `item.started` /
//! `item.updated` / `item.completed` frames whose `item.type` is one of
//! `command_execution`, `reasoning`, `agent_message`, `todo_list`,
//! `file_change`, `mcp_tool_call`, `web_search` or `error`.

use super::{str_field, NormalizedEvent, ToolEnd, ToolStart};
use attempt_core::{LogLevel, MessageRole, RunState, TodoItem, TodoStatus, ToolItem};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct CodexParser {
    started: HashSet<String>,
}

impl CodexParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, frame: &Value) -> Vec<NormalizedEvent> {
        match str_field(frame, "type").unwrap_or_default() {
            "thread.started" => str_field(frame, "thread_id")
                .map(|id| vec![NormalizedEvent::SessionStarted(id.to_string())])
                .unwrap_or_default(),
            "turn.completed" => vec![NormalizedEvent::TurnCompleted],
            "turn.failed" => {
                let message = frame
                    .get("error")
                    .and_then(|e| str_field(e, "message"))
                    .unwrap_or("turn failed");
                vec![NormalizedEvent::Error(message.to_string())]
            }
            "error" => vec![NormalizedEvent::Log {
                level: LogLevel::Error,
                message: str_field(frame, "message").unwrap_or("error").to_string(),
            }],
            kind @ ("item.started" | "item.updated" | "item.completed") => {
                match frame.get("item") {
                    Some(item) => self.parse_item(kind, item),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn parse_item(&mut self, kind: &str, item: &Value) -> Vec<NormalizedEvent> {
        let completed = kind == "item.completed";
        let id = str_field(item, "id").map(str::to_string);

        match str_field(item, "type").unwrap_or_default() {
            "reasoning" if completed => text_of(item)
                .map(|text| vec![NormalizedEvent::ReasoningDelta(format!("{text}\n\n"))])
                .unwrap_or_default(),
            "agent_message" if completed => text_of(item)
                .map(|text| {
                    vec![NormalizedEvent::Message {
                        role: MessageRole::Assistant,
                        text: text.to_string(),
                    }]
                })
                .unwrap_or_default(),
            "todo_list" => item
                .get("items")
                .and_then(Value::as_array)
                .map(|items| vec![NormalizedEvent::Todos(todo_items(items))])
                .unwrap_or_default(),
            "command_execution" => {
                let start = ToolStart {
                    call_id: id.clone(),
                    name: "shell".to_string(),
                    command: str_field(item, "command").map(str::to_string),
                    cwd: None,
                    metadata: None,
                };
                let end = || {
                    let exit_code = item
                        .get("exit_code")
                        .and_then(Value::as_i64)
                        .and_then(|c| i32::try_from(c).ok());
                    ToolEnd {
                        call_id: id.clone(),
                        success: str_field(item, "status") == Some("completed")
                            && exit_code.unwrap_or(0) == 0,
                        exit_code,
                        stdout: str_field(item, "aggregated_output").map(str::to_string),
                        stderr: None,
                        metadata: None,
                    }
                };
                self.tool_frame(kind, start, end)
            }
            "mcp_tool_call" => {
                let server = str_field(item, "server").unwrap_or("mcp");
                let tool = str_field(item, "tool").unwrap_or("tool");
                let start = ToolStart {
                    call_id: id.clone(),
                    name: format!("{server}.{tool}"),
                    command: None,
                    cwd: None,
                    metadata: item.get("arguments").cloned(),
                };
                let end = || ToolEnd {
                    call_id: id.clone(),
                    success: str_field(item, "status") != Some("failed"),
                    metadata: item.get("result").cloned(),
                    stderr: item
                        .get("error")
                        .and_then(|e| str_field(e, "message"))
                        .map(str::to_string),
                    ..ToolEnd::default()
                };
                self.tool_frame(kind, start, end)
            }
            "file_change" if completed => {
                let paths: Vec<&str> = item
                    .get("changes")
                    .and_then(Value::as_array)
                    .map(|changes| changes.iter().filter_map(|c| str_field(c, "path")).collect())
                    .unwrap_or_default();
                vec![NormalizedEvent::ToolCall(instant_tool(
                    "edit",
                    (!paths.is_empty()).then(|| paths.join("\n")),
                    str_field(item, "status") != Some("failed"),
                    item.get("changes").cloned(),
                ))]
            }
            "web_search" if completed => vec![NormalizedEvent::ToolCall(instant_tool(
                "web_search",
                str_field(item, "query").map(str::to_string),
                true,
                None,
            ))],
            "error" if completed => vec![NormalizedEvent::Log {
                level: LogLevel::Warn,
                message: str_field(item, "message").unwrap_or("error").to_string(),
            }],
            _ => Vec::new(),
        }
    }

    /// Begin on `item.started`; end on `item.completed`, synthesizing the
    /// begin when the start frame was never seen.
    fn tool_frame(
        &mut self,
        kind: &str,
        start: ToolStart,
        end: impl FnOnce() -> ToolEnd,
    ) -> Vec<NormalizedEvent> {
        let key = start.call_id.clone().unwrap_or_default();
        match kind {
            "item.started" => {
                self.started.insert(key);
                vec![NormalizedEvent::ToolStarted(start)]
            }
            "item.completed" => {
                let mut events = Vec::new();
                if !self.started.remove(&key) {
                    events.push(NormalizedEvent::ToolStarted(start));
                }
                events.push(NormalizedEvent::ToolFinished(end()));
                events
            }
            _ => Vec::new(),
        }
    }
}

fn text_of(item: &Value) -> Option<&str> {
    str_field(item, "text").filter(|t| !t.trim().is_empty())
}

fn todo_items(items: &[Value]) -> Vec<TodoItem> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let text = str_field(item, "text")?;
            let done = item
                .get("completed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Some(TodoItem {
                id: (index + 1).to_string(),
                text: text.to_string(),
                status: if done { TodoStatus::Done } else { TodoStatus::Open },
            })
        })
        .collect()
}

fn instant_tool(
    name: &str,
    command: Option<String>,
    success: bool,
    metadata: Option<Value>,
) -> ToolItem {
    let now = Utc::now();
    ToolItem {
        name: name.to_string(),
        command,
        cwd: None,
        status: if success {
            RunState::Succeeded
        } else {
            RunState::Failed
        },
        started_at: now,
        completed_at: Some(now),
        duration_ms: Some(0),
        exit_code: None,
        stdout: None,
        stderr: None,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::Grouper;
    use attempt_core::{AttemptEvent, ConversationItem};
    use serde_json::json;

    fn run(frames: &[Value]) -> Vec<AttemptEvent> {
        let mut parser = CodexParser::new();
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        for frame in frames {
            for event in parser.parse(frame) {
                out.extend(grouper.handle(event));
            }
        }
        out.extend(grouper.flush());
        out
    }

    fn items(events: &[AttemptEvent]) -> Vec<&ConversationItem> {
        events
            .iter()
            .filter_map(|e| match e {
                AttemptEvent::Conversation { item } => Some(item),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn full_turn_is_normalized() {
        let out = run(&[
            json!({"type": "thread.started", "thread_id": "th_1"}),
            json!({"type": "turn.started"}),
            json!({"type": "item.completed", "item": {"id": "i0", "type": "reasoning", "text": "Look at files."}}),
            json!({"type": "item.completed", "item": {"id": "i1", "type": "reasoning", "text": "Then edit."}}),
            json!({"type": "item.started", "item": {"id": "i2", "type": "command_execution", "command": "ls", "status": "in_progress"}}),
            json!({"type": "item.completed", "item": {"id": "i2", "type": "command_execution", "command": "ls", "aggregated_output": "a.rs\n", "exit_code": 0, "status": "completed"}}),
            json!({"type": "item.completed", "item": {"id": "i3", "type": "agent_message", "text": "All done."}}),
            json!({"type": "turn.completed", "usage": {"input_tokens": 10}}),
        ]);

        assert_eq!(
            out[0],
            AttemptEvent::Session {
                id: "th_1".to_string()
            }
        );
        let items = items(&out);
        assert_eq!(items.len(), 3);
        assert_eq!(
            *items[0],
            ConversationItem::Thinking {
                text: "Look at files.\n\nThen edit.".to_string()
            }
        );
        match items[1] {
            ConversationItem::Tool(tool) => {
                assert_eq!(tool.command.as_deref(), Some("ls"));
                assert_eq!(tool.status, RunState::Succeeded);
                assert_eq!(tool.stdout.as_deref(), Some("a.rs\n"));
                assert_eq!(tool.exit_code, Some(0));
            }
            other => panic!("expected tool, got {other:?}"),
        }
        assert_eq!(*items[2], ConversationItem::assistant("All done."));
    }

    #[test]
    fn failed_command_without_start_is_synthesized() {
        let out = run(&[json!({
            "type": "item.completed",
            "item": {"id": "i9", "type": "command_execution", "command": "false", "exit_code": 1, "status": "failed"}
        })]);
        match items(&out).as_slice() {
            [ConversationItem::Tool(tool)] => {
                assert_eq!(tool.status, RunState::Failed);
                assert_eq!(tool.exit_code, Some(1));
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn todo_list_updates_snapshot() {
        let out = run(&[json!({
            "type": "item.updated",
            "item": {"id": "t", "type": "todo_list", "items": [
                {"text": "read code", "completed": true},
                {"text": "write fix", "completed": false}
            ]}
        })]);
        match &out[0] {
            AttemptEvent::Todo { summary } => {
                assert_eq!(summary.total, 2);
                assert_eq!(summary.completed, 1);
                assert_eq!(summary.items[1].text, "write fix");
            }
            other => panic!("expected todo, got {other:?}"),
        }
    }

    #[test]
    fn turn_failure_becomes_error_item() {
        let out = run(&[json!({"type": "turn.failed", "error": {"message": "rate limited"}})]);
        assert_eq!(items(&out), vec![&ConversationItem::error("rate limited")]);
    }

    #[test]
    fn file_change_is_one_complete_tool() {
        let out = run(&[json!({
            "type": "item.completed",
            "item": {"id": "f", "type": "file_change", "status": "completed",
                     "changes": [{"path": "src/lib.rs", "kind": "update"}]}
        })]);
        match items(&out).as_slice() {
            [ConversationItem::Tool(tool)] => {
                assert_eq!(tool.name, "edit");
                assert_eq!(tool.command.as_deref(), Some("src/lib.rs"));
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_are_ignored() {
        assert!(run(&[json!({"type": "turn.started"}), json!({"type": "something.new"})]).is_empty());
    }
}
