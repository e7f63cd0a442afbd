//! Agent adapter layer.
//!
//! Every coding agent is exposed through the object-safe [`Agent`] trait.
//! Concrete agents are built from one of two drivers:
//!
//! - [`process::ProcessAdapter`] spawns a CLI and parses its stdout/stderr lines
//! - [`session::SessionAdapter`] talks to an in-process client that yields an
//!   event stream
//!
//! Both drivers are generic over a hooks trait that carries the
//! agent-specific parts (command line, protocol parsing).

pub mod codex;
pub mod droid;
pub mod opencode;
pub mod process;
pub mod session;

use crate::emit::Emitter;
use crate::grouper::{Grouper, NormalizedEvent};
use async_trait::async_trait;
use attempt_core::prompt::{build_attempt_prompt, build_followup_prompt};
use attempt_core::{AttemptEvent, Config, ConversationItem, Id, MessageRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("unknown profile {profile} for agent {agent}")]
    UnknownProfile { agent: String, profile: String },
    #[error("invalid profile: {0}")]
    InvalidProfile(#[from] serde_json::Error),
    #[error("agent {0} does not support resume")]
    ResumeUnsupported(String),
    #[error("agent {0} does not support inline prompts")]
    InlineUnsupported(String),
    #[error("resume requires a session id and a follow-up prompt")]
    MissingSession,
    #[error("agent binary not found: {0}")]
    NotFound(String),
    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),
    #[error("session error: {0}")]
    Session(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("agent returned no text")]
    EmptyResponse,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent-specific settings as a JSON object, parsed by each agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub settings: serde_json::Value,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, settings: &impl Serialize) -> Self {
        Self {
            id: id.into(),
            settings: serde_json::to_value(settings).unwrap_or_default(),
        }
    }

    /// Parse settings into an agent's typed profile.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.settings.clone())?)
    }

    /// Set a top-level setting, replacing any previous value.
    pub fn with_setting(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(map) = self.settings.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Ephemeral per-run context handed to an agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub attempt_id: Id,
    pub board_id: Id,
    pub card_id: Id,
    pub worktree_path: PathBuf,
    pub repository_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
    pub card_title: String,
    pub card_description: Option<String>,
    pub profile_id: Option<String>,
    pub session_id: Option<String>,
    pub followup_prompt: Option<String>,
    pub is_planning: bool,
    pub cancel: CancellationToken,
    pub emitter: Emitter,
}

impl AgentContext {
    /// Invocation for a fresh run.
    pub fn start_invocation(&self) -> Invocation {
        Invocation {
            cwd: self.worktree_path.clone(),
            prompt: build_attempt_prompt(
                &self.card_title,
                self.card_description.as_deref(),
                self.is_planning,
            ),
            session_id: None,
        }
    }

    /// Invocation continuing the recorded session with the follow-up prompt.
    pub fn resume_invocation(&self) -> Result<Invocation> {
        match (&self.session_id, &self.followup_prompt) {
            (Some(session_id), Some(followup)) if !followup.trim().is_empty() => Ok(Invocation {
                cwd: self.worktree_path.clone(),
                prompt: build_followup_prompt(followup),
                session_id: Some(session_id.clone()),
            }),
            _ => Err(AgentError::MissingSession),
        }
    }
}

/// What to run: prompt, working directory and (for resume) the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub cwd: PathBuf,
    pub prompt: String,
    pub session_id: Option<String>,
}

impl Invocation {
    pub fn is_resume(&self) -> bool {
        self.session_id.is_some()
    }
}

/// A one-shot prompt whose final text is returned instead of persisted.
#[derive(Debug, Clone)]
pub struct InlineRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub cancel: CancellationToken,
}

/// Where a driver delivers events: the attempt's emit channel, or a buffer
/// for inline prompts.
#[derive(Debug)]
pub enum EventSink<'a> {
    Emit(&'a Emitter),
    Collect(&'a mut Vec<AttemptEvent>),
}

impl EventSink<'_> {
    pub async fn push(&mut self, events: Vec<AttemptEvent>) {
        match self {
            Self::Emit(emitter) => emitter.emit_all(events).await,
            Self::Collect(buf) => buf.extend(events),
        }
    }
}

/// Feed parser output through the grouper into the sink.
pub(crate) async fn push_grouped(
    grouper: &mut Grouper,
    events: Vec<NormalizedEvent>,
    sink: &mut EventSink<'_>,
) {
    for event in events {
        let out = grouper.handle(event);
        if !out.is_empty() {
            sink.push(out).await;
        }
    }
}

/// Quote a value for `sh -c`.
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Last assistant message in a collected event buffer.
pub fn final_assistant_text(events: &[AttemptEvent]) -> Option<String> {
    events.iter().rev().find_map(|event| match event {
        AttemptEvent::Conversation {
            item:
                ConversationItem::Message {
                    role: MessageRole::Assistant,
                    text,
                    ..
                },
        } => Some(text.clone()),
        _ => None,
    })
}

/// A coding agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry key, e.g. `codex`.
    fn key(&self) -> &str;

    fn default_profile(&self) -> AgentProfile;

    /// JSON schema describing the profile settings.
    fn profile_schema(&self) -> serde_json::Value;

    fn supports_resume(&self) -> bool {
        false
    }

    /// Run the attempt's prompt. Returns the exit code (0 on success).
    async fn run(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<i32>;

    /// Continue the recorded session with the follow-up prompt.
    async fn resume(&self, _profile: &AgentProfile, _ctx: &AgentContext) -> Result<i32> {
        Err(AgentError::ResumeUnsupported(self.key().to_string()))
    }

    /// Run a one-shot prompt and return the agent's final text.
    async fn inline(&self, _profile: &AgentProfile, _request: &InlineRequest) -> Result<String> {
        Err(AgentError::InlineUnsupported(self.key().to_string()))
    }
}

/// Agents by key, plus any named profiles.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    profiles: HashMap<(String, String), AgentProfile>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.agents.keys().collect();
        keys.sort();
        f.debug_struct("AgentRegistry")
            .field("agents", &keys)
            .field("profiles", &self.profiles.len())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in agents configured from `config`.
    pub fn with_builtin(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(codex::codex_agent(config)));
        registry.register(Arc::new(droid::DroidAgent::new(config)));
        registry.register(Arc::new(opencode::opencode_agent(config)));
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.key().to_string(), agent);
    }

    pub fn register_profile(&mut self, agent_key: &str, profile: AgentProfile) {
        self.profiles
            .insert((agent_key.to_string(), profile.id.clone()), profile);
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(key)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.agents.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve the profile for a run: a named profile when `profile_id` is set,
    /// else the agent default with the configured model applied.
    pub fn resolve_profile(
        &self,
        agent: &dyn Agent,
        profile_id: Option<&str>,
        config: &Config,
    ) -> Result<AgentProfile> {
        let default = agent.default_profile();
        let profile = match profile_id {
            Some(id) if id != default.id => self
                .profiles
                .get(&(agent.key().to_string(), id.to_string()))
                .cloned()
                .ok_or_else(|| AgentError::UnknownProfile {
                    agent: agent.key().to_string(),
                    profile: id.to_string(),
                })?,
            _ => default,
        };
        Ok(match &config.model {
            Some(model) => profile.with_setting("model", serde_json::Value::String(model.clone())),
            None => profile,
        })
    }
}
