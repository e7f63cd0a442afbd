//! OpenCode agent, driven over the `opencode serve` HTTP API.
//!
//! A run creates (or reuses) a session, subscribes to `GET /event` (SSE),
//! then posts the prompt. Events are fed to the parser until the session
//! goes idle or reports an error.

use super::session::{SessionAdapter, SessionHooks, SessionStart};
use super::{AgentError, AgentProfile, Invocation, Result};
use crate::grouper::opencode::OpencodeParser;
use crate::grouper::{Flow, NormalizedEvent};
use async_trait::async_trait;
use attempt_core::Config;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const KEY: &str = "opencode";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpencodeProfile {
    /// `provider/model`, e.g. `anthropic/claude-sonnet-4`.
    pub model: Option<String>,
    /// OpenCode agent name, e.g. `build` or `plan`.
    pub agent: Option<String>,
}

/// Thin client for the OpenCode server.
#[derive(Debug, Clone)]
pub struct OpencodeClient {
    http: reqwest::Client,
    base_url: String,
    directory: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
}

impl OpencodeClient {
    pub fn new(base_url: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn query(&self) -> [(&'static str, String); 1] {
        [("directory", self.directory.to_string_lossy().into_owned())]
    }

    /// POST /session
    pub async fn create_session(&self) -> Result<String> {
        let response = self
            .http
            .post(self.url("/session"))
            .query(&self.query())
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?;
        let info: SessionInfo = response.json().await?;
        Ok(info.id)
    }

    /// POST /session/{id}/message. Resolves when the turn ends.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        profile: &OpencodeProfile,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "parts": [{ "type": "text", "text": prompt }],
        });
        if let Some((provider, model)) = profile.model.as_deref().and_then(|m| m.split_once('/')) {
            body["model"] = serde_json::json!({ "providerID": provider, "modelID": model });
        }
        if let Some(agent) = &profile.agent {
            body["agent"] = Value::String(agent.clone());
        }
        self.http
            .post(self.url(&format!("/session/{session_id}/message")))
            .query(&self.query())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// POST /session/{id}/abort
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        self.http
            .post(self.url(&format!("/session/{session_id}/abort")))
            .query(&self.query())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// GET /event as a stream of JSON events.
    pub async fn events(&self) -> Result<BoxStream<'static, Result<Value>>> {
        let response = self
            .http
            .get(self.url("/event"))
            .query(&self.query())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        Ok(sse_json_stream(response.bytes_stream().boxed()))
    }
}

struct SseState<S> {
    bytes: S,
    buffer: String,
    done: bool,
}

/// Split an SSE byte stream on blank lines and parse each frame's data.
fn sse_json_stream<S, B>(bytes: S) -> BoxStream<'static, Result<Value>>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
{
    let state = SseState {
        bytes,
        buffer: String::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(end) = state.buffer.find("\n\n") {
                let frame: String = state.buffer.drain(..end + 2).collect();
                if let Some(value) = parse_sse_frame(&frame) {
                    return Some((Ok(value), state));
                }
                continue;
            }
            if state.done {
                let rest = std::mem::take(&mut state.buffer);
                return parse_sse_frame(&rest).map(|value| (Ok(value), state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(chunk.as_ref()).replace("\r\n", "\n");
                    state.buffer.push_str(&text);
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(AgentError::Http(e)), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

/// JSON payload of one SSE frame (`data:` lines joined).
fn parse_sse_frame(frame: &str) -> Option<Value> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(&data.join("\n")) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "skipping malformed event frame");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpencodeHooks {
    base_url: String,
}

impl OpencodeHooks {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn open(
        &self,
        client: &OpencodeClient,
        profile: &AgentProfile,
        invocation: &Invocation,
        session_id: String,
    ) -> Result<SessionStart<Value>> {
        let profile: OpencodeProfile = profile.parse()?;
        // Subscribe before prompting so no event is missed.
        let events = client.events().await?;

        let client = client.clone();
        let prompt = invocation.prompt.clone();
        let id = session_id.clone();
        let prompt_errors = stream::once(async move {
            client.send_prompt(&id, &prompt, &profile).await
        })
        .filter_map(|result| async move { result.err().map(Err) });

        Ok(SessionStart {
            stream: stream::select(events, prompt_errors).boxed(),
            session_id: Some(session_id),
        })
    }
}

/// The opencode agent configured from `config`.
pub fn opencode_agent(config: &Config) -> SessionAdapter<OpencodeHooks> {
    SessionAdapter::new(OpencodeHooks::new(config.opencode_url.clone()))
}

#[async_trait]
impl SessionHooks for OpencodeHooks {
    type Client = OpencodeClient;
    type Event = Value;
    type State = OpencodeParser;

    fn key(&self) -> &str {
        KEY
    }

    fn default_profile(&self) -> AgentProfile {
        AgentProfile::new("default", &OpencodeProfile::default())
    }

    fn profile_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "model": { "type": ["string", "null"], "description": "provider/model" },
                "agent": { "type": ["string", "null"] }
            }
        })
    }

    fn supports_resume(&self) -> bool {
        true
    }

    async fn create_client(
        &self,
        _profile: &AgentProfile,
        invocation: &Invocation,
    ) -> Result<OpencodeClient> {
        Ok(OpencodeClient::new(&self.base_url, &invocation.cwd))
    }

    async fn start_session(
        &self,
        client: &OpencodeClient,
        profile: &AgentProfile,
        invocation: &Invocation,
    ) -> Result<SessionStart<Value>> {
        let session_id = client.create_session().await?;
        self.open(client, profile, invocation, session_id).await
    }

    async fn resume_session(
        &self,
        client: &OpencodeClient,
        profile: &AgentProfile,
        invocation: &Invocation,
    ) -> Result<SessionStart<Value>> {
        let session_id = invocation
            .session_id
            .clone()
            .ok_or(AgentError::MissingSession)?;
        self.open(client, profile, invocation, session_id).await
    }

    fn new_state(&self, session_id: Option<&str>) -> OpencodeParser {
        OpencodeParser::new(session_id.unwrap_or_default())
    }

    fn handle_event(
        &self,
        state: &mut OpencodeParser,
        event: Value,
    ) -> (Vec<NormalizedEvent>, Flow) {
        state.parse(&event)
    }

    async fn abort(&self, client: &OpencodeClient, session_id: &str) {
        if let Err(e) = client.abort(session_id).await {
            warn!(session_id, error = %e, "failed to abort opencode session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(
        parts: &[&'static str],
    ) -> impl futures::Stream<Item = reqwest::Result<&'static [u8]>> + Send + Unpin {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn sse_frames_split_across_chunks() {
        let stream = sse_json_stream(chunks(&[
            "data: {\"type\":\"server.connected\",",
            "\"properties\":{}}\n\ndata: {\"type\":\"session.idle\"",
            ",\"properties\":{\"sessionID\":\"s\"}}\r\n\r\n",
            ": keepalive\n\n",
            "data: {\"type\":\"tail\",\"properties\":{}}",
        ]));
        let events: Vec<Value> = stream.map(|r| r.unwrap()).collect().await;
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["server.connected", "session.idle", "tail"]);
    }

    #[test]
    fn sse_frame_joins_data_lines() {
        let value = parse_sse_frame("event: message\ndata: {\"a\":\ndata: 1}\n").unwrap();
        assert_eq!(value["a"], 1);
        assert!(parse_sse_frame("data: not json").is_none());
        assert!(parse_sse_frame("id: 7").is_none());
    }

    #[test]
    fn client_normalizes_base_url() {
        let client = OpencodeClient::new("http://127.0.0.1:4096/", "/work");
        assert_eq!(client.url("/session"), "http://127.0.0.1:4096/session");
        assert_eq!(client.directory(), Path::new("/work"));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_http_error() {
        // Port 9 (discard) is closed on test hosts.
        let client = OpencodeClient::new("http://127.0.0.1:9", "/work");
        assert!(matches!(
            client.create_session().await,
            Err(AgentError::Http(_))
        ));
    }

    #[test]
    fn handle_event_delegates_to_parser() {
        let hooks = OpencodeHooks::new("http://localhost:4096");
        let mut state = hooks.new_state(Some("ses_1"));
        let (events, flow) = hooks.handle_event(
            &mut state,
            serde_json::json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        );
        assert_eq!(events, vec![NormalizedEvent::TurnCompleted]);
        assert_eq!(flow, Flow::Completed);
    }
}
