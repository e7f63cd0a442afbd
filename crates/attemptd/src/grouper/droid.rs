//! Droid CLI output.
//!
//! In `json` and `ping` mode droid writes one aggregated JSON envelope when it
//! exits, possibly pretty-printed over several lines; stdout is buffered and
//! parsed at close. In `debug` mode stdout is a live stream of frames, often
//! embedded in timestamped, colored log lines, so each line goes through the
//! sanitizer first. `ping` runs only harvest a session id; their conversation
//! output is suppressed by the grouper.

use super::{parse_json_line, sanitize_line, str_field, NormalizedEvent, ToolEnd, ToolStart};
use attempt_core::{LogLevel, MessageRole};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)session[ _-]?id["']?\s*[:=]\s*["']?([A-Za-z0-9_-]{6,})"#)
        .expect("valid session id regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroidMode {
    #[default]
    Json,
    Debug,
    Ping,
}

impl DroidMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Debug => "debug",
            Self::Ping => "ping",
        }
    }

    /// Whether stdout is a single envelope written at exit.
    pub fn is_envelope(self) -> bool {
        !matches!(self, Self::Debug)
    }
}

#[derive(Debug)]
pub struct DroidParser {
    mode: DroidMode,
    envelope: String,
    last_assistant: Option<String>,
    final_seen: bool,
}

impl DroidParser {
    pub fn new(mode: DroidMode) -> Self {
        Self {
            mode,
            envelope: String::new(),
            last_assistant: None,
            final_seen: false,
        }
    }

    pub fn mode(&self) -> DroidMode {
        self.mode
    }

    /// A stdout line that is one JSON object.
    pub fn stdout_json(&mut self, frame: &Value) -> Vec<NormalizedEvent> {
        if self.mode.is_envelope() {
            self.buffer(&frame.to_string());
            return Vec::new();
        }
        self.parse(frame)
    }

    /// Any other stdout line.
    pub fn stdout_text(&mut self, line: &str) -> Vec<NormalizedEvent> {
        if self.mode.is_envelope() {
            self.buffer(line);
            return Vec::new();
        }
        match parse_json_line(line) {
            Some(frame) => self.parse(&frame),
            None => self.parse_text(line, LogLevel::Info),
        }
    }

    /// Stdout closed: parse the buffered envelope.
    ///
    /// Output that is not one JSON document is replayed line by line, frames
    /// first through the sanitizer and the rest as logs.
    pub fn finish(&mut self) -> Vec<NormalizedEvent> {
        let buffered = std::mem::take(&mut self.envelope);
        if buffered.trim().is_empty() {
            return Vec::new();
        }
        if let Some(envelope) = serde_json::from_str::<Value>(buffered.trim())
            .ok()
            .filter(Value::is_object)
        {
            return self.parse(&envelope);
        }
        let mut events = Vec::new();
        for line in buffered.lines() {
            match parse_json_line(line) {
                Some(frame) => events.extend(self.parse(&frame)),
                None => events.extend(self.parse_text(line, LogLevel::Info)),
            }
        }
        events
    }

    fn buffer(&mut self, line: &str) {
        self.envelope.push_str(line);
        self.envelope.push('\n');
    }

    pub fn parse(&mut self, frame: &Value) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();
        if let Some(id) = session_field(frame) {
            events.push(NormalizedEvent::SessionStarted(id.to_string()));
        }

        match str_field(frame, "type").unwrap_or_default() {
            "message" => {
                let role = match str_field(frame, "role") {
                    Some("user") => MessageRole::User,
                    Some("system") => MessageRole::System,
                    _ => MessageRole::Assistant,
                };
                if let Some(text) = str_field(frame, "text").or_else(|| str_field(frame, "content"))
                {
                    if role == MessageRole::Assistant {
                        self.last_assistant = Some(text.to_string());
                    }
                    if role != MessageRole::User {
                        events.push(NormalizedEvent::Message {
                            role,
                            text: text.to_string(),
                        });
                    }
                }
            }
            "tool_call" => events.push(NormalizedEvent::ToolStarted(ToolStart {
                call_id: call_id(frame),
                name: str_field(frame, "toolName")
                    .or_else(|| str_field(frame, "name"))
                    .unwrap_or("tool")
                    .to_string(),
                command: frame
                    .get("parameters")
                    .and_then(|p| str_field(p, "command"))
                    .map(str::to_string),
                cwd: None,
                metadata: frame.get("parameters").cloned(),
            })),
            "tool_result" => {
                let is_error = frame
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let value = frame.get("value").map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                events.push(NormalizedEvent::ToolFinished(ToolEnd {
                    call_id: call_id(frame),
                    success: !is_error,
                    stdout: if is_error { None } else { value.clone() },
                    stderr: if is_error { value } else { None },
                    ..ToolEnd::default()
                }));
            }
            "completion" | "result" => {
                let text = str_field(frame, "finalText").or_else(|| str_field(frame, "result"));
                let failed = frame
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(text) = text {
                    if failed {
                        events.push(NormalizedEvent::Error(text.to_string()));
                    } else if !self.final_seen && self.last_assistant.as_deref() != Some(text) {
                        events.push(NormalizedEvent::Message {
                            role: MessageRole::Assistant,
                            text: text.to_string(),
                        });
                        self.last_assistant = Some(text.to_string());
                    }
                }
                self.final_seen = true;
                events.push(NormalizedEvent::TurnCompleted);
            }
            "error" => {
                let message = str_field(frame, "message")
                    .or_else(|| frame.get("error").and_then(|e| str_field(e, "message")))
                    .unwrap_or("droid reported an error");
                events.push(NormalizedEvent::Error(message.to_string()));
            }
            _ => {}
        }
        events
    }

    /// A stdout or stderr line that is not a JSON frame.
    pub fn parse_text(&mut self, line: &str, level: LogLevel) -> Vec<NormalizedEvent> {
        let clean = sanitize_line(line);
        if clean.trim().is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        if let Some(id) = session_from_text(&clean) {
            events.push(NormalizedEvent::SessionStarted(id));
        }
        if self.mode != DroidMode::Ping {
            events.push(NormalizedEvent::Log {
                level,
                message: clean,
            });
        }
        events
    }
}

fn session_field(frame: &Value) -> Option<&str> {
    str_field(frame, "session_id")
        .or_else(|| str_field(frame, "sessionId"))
        .filter(|id| !id.is_empty())
}

fn call_id(frame: &Value) -> Option<String> {
    str_field(frame, "id")
        .or_else(|| str_field(frame, "toolCallId"))
        .map(str::to_string)
}

/// Session id announced in free text, e.g. `Session ID: abc123`.
pub fn session_from_text(line: &str) -> Option<String> {
    SESSION_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
