//! Driver for CLI agents that stream their output on stdout/stderr.

use super::{
    final_assistant_text, push_grouped, Agent, AgentContext, AgentError, AgentProfile,
    EventSink, InlineRequest, Invocation, Result,
};
use crate::grouper::{sanitize_line, Grouper, NormalizedEvent};
use crate::proc::{shell_command, terminate_group};
use async_trait::async_trait;
use attempt_core::LogLevel;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// Exit code `sh` reports when the command is not found.
const COMMAND_NOT_FOUND: i32 = 127;

/// Shell line plus extra environment for one agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub line: String,
    pub env: Vec<(String, String)>,
}

/// Result of one agent process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub session_id: Option<String>,
}

/// Agent-specific parts of a process-backed agent.
pub trait ProcessHooks: Send + Sync + 'static {
    /// Per-run parser state.
    type State: Send;

    fn key(&self) -> &str;

    fn default_profile(&self) -> AgentProfile;

    fn profile_schema(&self) -> serde_json::Value;

    fn supports_resume(&self) -> bool {
        false
    }

    fn build_command(&self, profile: &AgentProfile, invocation: &Invocation)
        -> Result<CommandSpec>;

    /// Text written to the child's stdin, which is then closed.
    fn build_stdin(&self, _profile: &AgentProfile, _invocation: &Invocation) -> Option<String> {
        None
    }

    fn new_state(&self, profile: &AgentProfile, invocation: &Invocation) -> Result<Self::State>;

    fn grouper(&self, _state: &Self::State) -> Grouper {
        Grouper::new()
    }

    fn on_stdout_json(
        &self,
        state: &mut Self::State,
        value: serde_json::Value,
    ) -> Vec<NormalizedEvent>;

    fn on_stdout_text(&self, _state: &mut Self::State, line: &str) -> Vec<NormalizedEvent> {
        raw_log(LogLevel::Info, line)
    }

    fn on_stderr_text(&self, _state: &mut Self::State, line: &str) -> Vec<NormalizedEvent> {
        raw_log(LogLevel::Warn, line)
    }

    fn after_close(&self, _state: &mut Self::State, _exit_code: i32) -> Vec<NormalizedEvent> {
        Vec::new()
    }
}

/// A raw output line forwarded as a log, or nothing when it is blank.
pub fn raw_log(level: LogLevel, line: &str) -> Vec<NormalizedEvent> {
    let clean = sanitize_line(line);
    if clean.trim().is_empty() {
        return Vec::new();
    }
    vec![NormalizedEvent::Log {
        level,
        message: clean,
    }]
}

/// Runs `sh -c <line>` and feeds its output through the hooks.
#[derive(Debug)]
pub struct ProcessAdapter<H> {
    hooks: H,
    kill_grace: Duration,
}

impl<H: ProcessHooks> ProcessAdapter<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Run one process to completion or cancellation.
    ///
    /// Stdout lines that are a JSON object go to `on_stdout_json`, everything
    /// else to the text hooks. A run continuing a known session starts with
    /// that session latched, so it is not recorded twice. A trailing line without `\n` is still
    /// delivered. On cancel the process group gets SIGTERM, then one SIGKILL
    /// after the grace period.
    pub async fn execute(
        &self,
        profile: &AgentProfile,
        invocation: &Invocation,
        cancel: &CancellationToken,
        sink: &mut EventSink<'_>,
    ) -> Result<RunOutcome> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let spec = self.hooks.build_command(profile, invocation)?;
        let stdin = self.hooks.build_stdin(profile, invocation);
        let mut state = self.hooks.new_state(profile, invocation)?;
        let mut grouper = self.hooks.grouper(&state);
        if let Some(session_id) = &invocation.session_id {
            grouper.latch_session(session_id.clone());
        }

        let mut command = shell_command(&spec.line);
        command
            .current_dir(&invocation.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            agent = self.hooks.key(),
            cwd = %invocation.cwd.display(),
            resume = invocation.is_resume(),
            "spawning agent process"
        );
        let mut child = command.spawn().map_err(AgentError::Spawn)?;

        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(text.as_bytes()).await {
                    warn!(error = %e, "failed to write agent stdin");
                }
                // Dropping the pipe closes stdin.
            });
        }

        let mut stdout = child.stdout.take().map(line_reader);
        let mut stderr = child.stderr.take().map(line_reader);

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        let events = match parse_object(&line) {
                            Some(value) => self.hooks.on_stdout_json(&mut state, value),
                            None => self.hooks.on_stdout_text(&mut state, &line),
                        };
                        push_grouped(&mut grouper, events, sink).await;
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        let events = self.hooks.on_stderr_text(&mut state, &line);
                        push_grouped(&mut grouper, events, sink).await;
                    }
                    None => stderr = None,
                },
                () = cancel.cancelled() => {
                    info!(agent = self.hooks.key(), "agent cancelled; terminating process group");
                    let outcome = terminate_group(&mut child, self.kill_grace).await;
                    debug!(agent = self.hooks.key(), ?outcome, "agent process terminated");
                    return Err(AgentError::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                terminate_group(&mut child, self.kill_grace).await;
                return Err(AgentError::Cancelled);
            }
        };
        let exit_code = status.code().unwrap_or(0);

        let events = self.hooks.after_close(&mut state, exit_code);
        push_grouped(&mut grouper, events, sink).await;
        sink.push(grouper.flush()).await;

        info!(agent = self.hooks.key(), exit_code, "agent process exited");
        if exit_code == COMMAND_NOT_FOUND {
            let program = spec.line.split_whitespace().next().unwrap_or_default();
            return Err(AgentError::NotFound(program.to_string()));
        }

        Ok(RunOutcome {
            exit_code,
            session_id: grouper.session_id().map(str::to_string),
        })
    }
}

/// A line that is exactly one JSON object.
fn parse_object(line: &str) -> Option<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(line.trim())
        .ok()
        .filter(serde_json::Value::is_object)
}

type LineReader = tokio::io::Split<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

fn line_reader(pipe: impl AsyncRead + Send + Unpin + 'static) -> LineReader {
    let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(pipe);
    BufReader::new(boxed).split(b'\n')
}

/// Next line from an open reader; `None` at EOF or on a read error.
async fn next_line(reader: &mut Option<LineReader>) -> Option<String> {
    let reader = reader.as_mut()?;
    match reader.next_segment().await {
        Ok(Some(bytes)) => {
            let mut line = String::from_utf8_lossy(&bytes).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            Some(line)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "failed to read agent output");
            None
        }
    }
}

#[async_trait]
impl<H: ProcessHooks> Agent for ProcessAdapter<H> {
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
            return Err(AgentError::Session(format!(
                "{} exited with code {}",
                self.key(),
                outcome.exit_code
            )));
        }
        final_assistant_text(&events).ok_or(AgentError::EmptyResponse)
    }
}
