//! OpenCode server events (`GET /event`).
//!
//! Every event is `{"type": ..., "properties": {...}}`. Events for other
//! sessions are ignored. Parts belonging to user messages are skipped, so the
//! prompt is not echoed back as assistant output. A text part is complete once
//! it has `time.end` or its assistant message has `time.completed`.

use super::{str_field, Flow, NormalizedEvent, PartKey, ToolEnd, ToolStart};
use attempt_core::{TodoItem, TodoStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct OpencodeParser {
    session_id: String,
    user_messages: HashSet<String>,
    reasoning_len: HashMap<String, usize>,
    started_tools: HashSet<String>,
}

impl OpencodeParser {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_messages: HashSet::new(),
            reasoning_len: HashMap::new(),
            started_tools: HashSet::new(),
        }
    }

    pub fn parse(&mut self, event: &Value) -> (Vec<NormalizedEvent>, Flow) {
        let Some(props) = event.get("properties") else {
            return (Vec::new(), Flow::Continue);
        };
        let kind = str_field(event, "type").unwrap_or_default();

        match kind {
            "message.updated" => match props.get("info").filter(|i| self.is_ours(i)) {
                Some(info) => (self.parse_message(info), Flow::Continue),
                None => (Vec::new(), Flow::Continue),
            },
            "message.part.updated" => match props.get("part").filter(|p| self.is_ours(p)) {
                Some(part) => (self.parse_part(part), Flow::Continue),
                None => (Vec::new(), Flow::Continue),
            },
            "todo.updated" if self.is_ours(props) => {
                let todos = props.get("todos").and_then(Value::as_array);
                (
                    todos
                        .map(|t| vec![NormalizedEvent::Todos(todo_items(t))])
                        .unwrap_or_default(),
                    Flow::Continue,
                )
            }
            "session.idle" if self.is_ours(props) => {
                (vec![NormalizedEvent::TurnCompleted], Flow::Completed)
            }
            "session.error" if self.is_ours(props) || str_field(props, "sessionID").is_none() => {
                let message = props
                    .get("error")
                    .map(|e| {
                        e.get("data")
                            .and_then(|d| str_field(d, "message"))
                            .or_else(|| str_field(e, "name"))
                            .unwrap_or("session error")
                            .to_string()
                    })
                    .unwrap_or_else(|| "session error".to_string());
                (vec![NormalizedEvent::Error(message)], Flow::Failed)
            }
            _ => (Vec::new(), Flow::Continue),
        }
    }

    fn is_ours(&self, value: &Value) -> bool {
        str_field(value, "sessionID") == Some(self.session_id.as_str())
    }

    fn parse_message(&mut self, info: &Value) -> Vec<NormalizedEvent> {
        let Some(id) = str_field(info, "id") else {
            return Vec::new();
        };
        if str_field(info, "role") == Some("user") {
            self.user_messages.insert(id.to_string());
            return Vec::new();
        }
        let completed = info
            .get("time")
            .and_then(|t| t.get("completed"))
            .is_some_and(|c| !c.is_null());
        if completed {
            vec![NormalizedEvent::MessageCompleted {
                session_id: self.session_id.clone(),
                message_id: id.to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    fn parse_part(&mut self, part: &Value) -> Vec<NormalizedEvent> {
        let message_id = str_field(part, "messageID").unwrap_or_default();
        if self.user_messages.contains(message_id) {
            return Vec::new();
        }
        let part_id = str_field(part, "id").unwrap_or_default();

        match str_field(part, "type").unwrap_or_default() {
            "text" => {
                if part.get("synthetic").and_then(Value::as_bool) == Some(true) {
                    return Vec::new();
                }
                let text = str_field(part, "text").unwrap_or_default();
                let done = part
                    .get("time")
                    .and_then(|t| t.get("end"))
                    .is_some_and(|end| !end.is_null());
                vec![NormalizedEvent::TextPart {
                    key: PartKey {
                        session_id: self.session_id.clone(),
                        message_id: message_id.to_string(),
                        part_id: part_id.to_string(),
                    },
                    text: text.to_string(),
                    done,
                }]
            }
            "reasoning" => {
                let text = str_field(part, "text").unwrap_or_default();
                let seen = self.reasoning_len.entry(part_id.to_string()).or_insert(0);
                // Parts carry the full text so far; emit only what is new.
                let delta = text.get(*seen..).unwrap_or_default();
                *seen = text.len();
                if delta.is_empty() {
                    Vec::new()
                } else {
                    vec![NormalizedEvent::ReasoningDelta(delta.to_string())]
                }
            }
            "tool" => self.parse_tool(part),
            _ => Vec::new(),
        }
    }

    fn parse_tool(&mut self, part: &Value) -> Vec<NormalizedEvent> {
        let Some(call_id) = str_field(part, "callID").map(str::to_string) else {
            return Vec::new();
        };
        let tool = str_field(part, "tool").unwrap_or("tool");
        let state = part.get("state").cloned().unwrap_or(Value::Null);
        let status = str_field(&state, "status").unwrap_or("pending");
        let input = state.get("input");

        let start = || ToolStart {
            call_id: Some(call_id.clone()),
            name: tool.to_string(),
            command: input
                .and_then(|i| str_field(i, "command").or_else(|| str_field(i, "filePath")))
                .map(str::to_string),
            cwd: None,
            metadata: input.cloned(),
        };

        let mut events = Vec::new();
        match status {
            "running" => {
                if self.started_tools.insert(call_id.clone()) {
                    events.push(NormalizedEvent::ToolStarted(start()));
                }
            }
            "completed" | "error" => {
                if !self.started_tools.remove(&call_id) {
                    events.push(NormalizedEvent::ToolStarted(start()));
                }
                let success = status == "completed";
                events.push(NormalizedEvent::ToolFinished(ToolEnd {
                    call_id: Some(call_id.clone()),
                    success,
                    exit_code: state
                        .get("metadata")
                        .and_then(|m| m.get("exit"))
                        .and_then(Value::as_i64)
                        .and_then(|c| i32::try_from(c).ok()),
                    stdout: str_field(&state, "output").map(str::to_string),
                    stderr: str_field(&state, "error").map(str::to_string),
                    metadata: state.get("metadata").cloned(),
                }));
                if success && tool == "todowrite" {
                    if let Some(todos) = input.and_then(|i| i.get("todos")).and_then(Value::as_array)
                    {
                        events.push(NormalizedEvent::Todos(todo_items(todos)));
                    }
                }
            }
            _ => {}
        }
        events
    }
}

fn todo_items(todos: &[Value]) -> Vec<TodoItem> {
    todos
        .iter()
        .enumerate()
        .filter_map(|(index, todo)| {
            let text = str_field(todo, "content")?;
            let status = match str_field(todo, "status") {
                Some("completed" | "cancelled") => TodoStatus::Done,
                _ => TodoStatus::Open,
            };
            Some(TodoItem {
                id: str_field(todo, "id").map_or_else(|| (index + 1).to_string(), str::to_string),
                text: text.to_string(),
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::Grouper;
    use attempt_core::{AttemptEvent, ConversationItem, RunState};
    use serde_json::json;

    fn part(kind: &str, message: &str, id: &str, extra: Value) -> Value {
        let mut part = json!({
            "id": id, "sessionID": "ses_1", "messageID": message, "type": kind
        });
        if let (Some(part), Value::Object(extra)) = (part.as_object_mut(), extra) {
            part.extend(extra);
        }
        json!({"type": "message.part.updated", "properties": {"part": part}})
    }

    fn drive(events: &[Value]) -> (Vec<AttemptEvent>, Flow) {
        let mut parser = OpencodeParser::new("ses_1");
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        let mut flow = Flow::Continue;
        for event in events {
            let (normalized, next) = parser.parse(event);
            for event in normalized {
                out.extend(grouper.handle(event));
            }
            flow = next;
            if flow != Flow::Continue {
                break;
            }
        }
        out.extend(grouper.flush());
        (out, flow)
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
    fn streamed_turn_is_grouped() {
        let (out, flow) = drive(&[
            json!({"type": "message.updated", "properties": {"info": {"id": "m_user", "sessionID": "ses_1", "role": "user"}}}),
            part("text", "m_user", "p0", json!({"text": "the prompt", "time": {"start": 1, "end": 2}})),
            part("reasoning", "m1", "r1", json!({"text": "Think"})),
            part("reasoning", "m1", "r1", json!({"text": "Thinking hard"})),
            part("tool", "m1", "t1", json!({"callID": "call_1", "tool": "bash", "state": {"status": "running", "input": {"command": "ls"}}})),
            part("tool", "m1", "t1", json!({"callID": "call_1", "tool": "bash", "state": {"status": "completed", "input": {"command": "ls"}, "output": "src\n", "metadata": {"exit": 0}}})),
            part("text", "m1", "p1", json!({"text": "Do", "time": {"start": 3}})),
            part("text", "m1", "p1", json!({"text": "Done.", "time": {"start": 3, "end": 4}})),
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        ]);
        assert_eq!(flow, Flow::Completed);

        let items = items(&out);
        assert_eq!(items.len(), 3);
        assert_eq!(
            *items[0],
            ConversationItem::Thinking {
                text: "Thinking hard".to_string()
            }
        );
        match items[1] {
            ConversationItem::Tool(tool) => {
                assert_eq!(tool.name, "bash");
                assert_eq!(tool.command.as_deref(), Some("ls"));
                assert_eq!(tool.exit_code, Some(0));
                assert_eq!(tool.status, RunState::Succeeded);
            }
            other => panic!("expected tool, got {other:?}"),
        }
        assert_eq!(*items[2], ConversationItem::assistant("Done."));
    }

    #[test]
    fn completed_message_releases_open_text_parts() {
        let (out, flow) = drive(&[
            part("text", "m1", "p1", json!({"text": "Patched the handler.", "time": {"start": 3}})),
            json!({"type": "message.updated", "properties": {"info": {
                "id": "m1", "sessionID": "ses_1", "role": "assistant", "time": {"created": 3, "completed": 5}
            }}}),
            part("tool", "m2", "t1", json!({"callID": "call_9", "tool": "bash", "state": {"status": "completed", "input": {"command": "cargo test"}, "output": "ok"}})),
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        ]);
        assert_eq!(flow, Flow::Completed);

        let items = items(&out);
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0], ConversationItem::assistant("Patched the handler."));
        assert!(matches!(items[1], ConversationItem::Tool(tool) if tool.name == "bash"));
    }

    #[test]
    fn unfinished_assistant_message_keeps_parts_buffered() {
        let mut parser = OpencodeParser::new("ses_1");
        let (events, _) = parser.parse(&json!({"type": "message.updated", "properties": {"info": {
            "id": "m1", "sessionID": "ses_1", "role": "assistant", "time": {"created": 3}
        }}}));
        assert!(events.is_empty());
    }

    #[test]
    fn other_sessions_are_ignored() {
        let (out, flow) = drive(&[
            json!({"type": "session.idle", "properties": {"sessionID": "ses_other"}}),
            json!({"type": "message.part.updated", "properties": {"part": {
                "id": "p", "sessionID": "ses_other", "messageID": "m", "type": "text",
                "text": "not mine", "time": {"end": 1}
            }}}),
        ]);
        assert_eq!(flow, Flow::Continue);
        assert!(out.is_empty());
    }

    #[test]
    fn session_error_fails_the_stream() {
        let (out, flow) = drive(&[json!({
            "type": "session.error",
            "properties": {"sessionID": "ses_1", "error": {"name": "ProviderAuthError", "data": {"message": "bad key"}}}
        })]);
        assert_eq!(flow, Flow::Failed);
        assert_eq!(items(&out), vec![&ConversationItem::error("bad key")]);
    }

    #[test]
    fn todowrite_updates_todos() {
        let (out, _) = drive(&[part(
            "tool",
            "m1",
            "t2",
            json!({"callID": "call_2", "tool": "todowrite", "state": {"status": "completed", "input": {"todos": [
                {"id": "a", "content": "plan", "status": "completed"},
                {"id": "b", "content": "build", "status": "in_progress"}
            ]}, "output": ""}}),
        )]);
        let summary = out
            .iter()
            .find_map(|e| match e {
                AttemptEvent::Todo { summary } => Some(summary),
                _ => None,
            })
            .unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
    }

    #[test]
    fn failed_tool_reports_error() {
        let (out, _) = drive(&[part(
            "tool",
            "m1",
            "t3",
            json!({"callID": "call_3", "tool": "read", "state": {"status": "error", "input": {"filePath": "/nope"}, "error": "not found"}}),
        )]);
        match items(&out).as_slice() {
            [ConversationItem::Tool(tool)] => {
                assert_eq!(tool.status, RunState::Failed);
                assert_eq!(tool.stderr.as_deref(), Some("not found"));
                assert_eq!(tool.command.as_deref(), Some("/nope"));
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }
}
