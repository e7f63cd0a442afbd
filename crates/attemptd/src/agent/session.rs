//! Driver for agents reached through an in-process client that yields an
//! event stream (an HTTP server, an SDK).

use super::{
    final_assistant_text, push_grouped, Agent, AgentContext, AgentError, AgentProfile,
    EventSink, InlineRequest, Invocation, Result,
};
use super::process::RunOutcome;
use crate::grouper::{Flow, Grouper, NormalizedEvent};
use async_trait::async_trait;
use attempt_core::AttemptEvent;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code reported when a session ends in failure.
const SESSION_FAILED: i32 = 1;

/// An opened session: its event stream plus the id, when known up front.
pub struct SessionStart<E> {
    pub stream: BoxStream<'static, Result<E>>,
    pub session_id: Option<String>,
}

impl<E> std::fmt::Debug for SessionStart<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStart")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Agent-specific parts of a session-backed agent.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    type Client: Send + Sync;
    type Event: Send + 'static;
    /// Per-run parser state.
    type State: Send;

    fn key(&self) -> &str;

    fn default_profile(&self) -> AgentProfile;

    fn profile_schema(&self) -> serde_json::Value;

    fn supports_resume(&self) -> bool {
        false
    }

    async fn create_client(&self, profile: &AgentProfile, invocation: &Invocation)
        -> Result<Self::Client>;

    async fn start_session(
        &self,
        client: &Self::Client,
        profile: &AgentProfile,
        invocation: &Invocation,
    ) -> Result<SessionStart<Self::Event>>;

    async fn resume_session(
        &self,
        _client: &Self::Client,
        _profile: &AgentProfile,
        _invocation: &Invocation,
    ) -> Result<SessionStart<Self::Event>> {
        Err(AgentError::ResumeUnsupported(self.key().to_string()))
    }

    fn new_state(&self, session_id: Option<&str>) -> Self::State;

    fn handle_event(
        &self,
        state: &mut Self::State,
        event: Self::Event,
    ) -> (Vec<NormalizedEvent>, Flow);

    /// Ask the remote side to stop the session. Best-effort.
    async fn abort(&self, _client: &Self::Client, _session_id: &str) {}
}

/// Drives a [`SessionHooks`] implementation to completion.
#[derive(Debug)]
pub struct SessionAdapter<H> {
    hooks: H,
}

impl<H: SessionHooks> SessionAdapter<H> {
    pub fn new(hooks: H) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Open (or resume) a session and feed its events until the turn ends,
    /// the stream closes, or `cancel` fires.
    pub async fn execute(
        &self,
        profile: &AgentProfile,
        invocation: &Invocation,
        cancel: &CancellationToken,
        sink: &mut EventSink<'_>,
    ) -> Result<RunOutcome> {
        let token = cancel.child_token();
        if token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        sink.push(vec![AttemptEvent::info(format!(
            "{} session running",
            self.hooks.key()
        ))])
        .await;

        let client = self.hooks.create_client(profile, invocation).await?;
        let start = tokio::select! {
            start = async {
                if invocation.is_resume() {
                    self.hooks.resume_session(&client, profile, invocation).await
                } else {
                    self.hooks.start_session(&client, profile, invocation).await
                }
            } => start?,
            () = token.cancelled() => return Err(AgentError::Cancelled),
        };

        let mut grouper = Grouper::new();
        if let Some(id) = &invocation.session_id {
            grouper.latch_session(id.clone());
        }
        if let Some(id) = &start.session_id {
            push_grouped(&mut grouper, vec![NormalizedEvent::SessionStarted(id.clone())], sink)
                .await;
        }
        info!(agent = self.hooks.key(), session_id = ?start.session_id, "session started");

        let mut state = self.hooks.new_state(start.session_id.as_deref());
        let mut stream = start.stream;
        let mut flow = Flow::Continue;

        while flow == Flow::Continue {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        let (events, next_flow) = self.hooks.handle_event(&mut state, event);
                        push_grouped(&mut grouper, events, sink).await;
                        flow = next_flow;
                    }
                    Some(Err(e)) => {
                        sink.push(grouper.flush()).await;
                        return Err(e);
                    }
                    None => {
                        warn!(agent = self.hooks.key(), "session stream closed before the turn ended");
                        flow = Flow::Failed;
                    }
                },
                () = token.cancelled() => {
                    info!(agent = self.hooks.key(), "session cancelled; aborting");
                    if let Some(id) = grouper.session_id() {
                        self.hooks.abort(&client, id).await;
                    }
                    return Err(AgentError::Cancelled);
                }
            }
        }

        sink.push(grouper.flush()).await;
        let exit_code = if flow == Flow::Completed {
            0
        } else {
            SESSION_FAILED
        };
        info!(agent = self.hooks.key(), exit_code, "session finished");
        Ok(RunOutcome {
            exit_code,
            session_id: grouper.session_id().map(str::to_string),
        })
    }
}

#[async_trait]
impl<H: SessionHooks> Agent for SessionAdapter<H> {
    fn key(&self) -> &str {
        self.hooks.key()
    }

    fn default_profile(&self) -> AgentProfile {
        self.hooks.default_profile()
    }

    fn profile_schema(&self) -> serde_json::Value {
        self.hooks.profile_schema()
    }

    fn supports_resume(&self) -> bool {
        self.hooks.supports_resume()
    }

    async fn run(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<i32> {
        let invocation = ctx.start_invocation();
        let mut sink = EventSink::Emit(&ctx.emitter);
        let outcome = self
            .execute(profile, &invocation, &ctx.cancel, &mut sink)
            .await?;
        Ok(outcome.exit_code)
    }

    async fn resume(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<i32> {
        if !self.hooks.supports_resume() {
            return Err(AgentError::ResumeUnsupported(self.key().to_string()));
        }
        let invocation = ctx.resume_invocation()?;
        let mut sink = EventSink::Emit(&ctx.emitter);
        let outcome = self
            .execute(profile, &invocation, &ctx.cancel, &mut sink)
            .await?;
        Ok(outcome.exit_code)
    }

    async fn inline(&self, profile: &AgentProfile, request: &InlineRequest) -> Result<String> {
        let invocation = Invocation {
            cwd: request.cwd.clone(),
            prompt: request.prompt.clone(),
            session_id: None,
        };
        let mut events = Vec::new();
        let outcome = self
            .execute(
                profile,
                &invocation,
                &request.cancel,
                &mut EventSink::Collect(&mut events),
            )
            .await?;
        if outcome.exit_code != 0 {
            return Err(AgentError::Session(format!("{} session failed", self.key())));
        }
        final_assistant_text(&events).ok_or(AgentError::EmptyResponse)
    }
}
