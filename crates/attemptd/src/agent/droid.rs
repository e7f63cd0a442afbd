//! Factory Droid CLI agent (`droid exec`).
//!
//! When `droid_ping_first` is set, a short `ping` run opens the session first
//! so its id is recorded before the real prompt starts; the real run then
//! continues that session.

use super::process::{CommandSpec, ProcessAdapter, ProcessHooks};
use super::{
    shell_quote, Agent, AgentContext, AgentProfile, EventSink, InlineRequest, Invocation, Result,
};
use crate::grouper::droid::{DroidMode, DroidParser};
use crate::grouper::{Grouper, NormalizedEvent};
use async_trait::async_trait;
use attempt_core::{Config, LogLevel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const KEY: &str = "droid";

const PING_PROMPT: &str = "Reply with the single word: pong";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidProfile {
    pub model: Option<String>,
    /// `low`, `medium` or `high`.
    pub autonomy: Option<String>,
    pub mode: DroidMode,
}

#[derive(Debug, Clone)]
pub struct DroidHooks {
    bin: PathBuf,
}

impl DroidHooks {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

fn output_format(mode: DroidMode) -> &'static str {
    match mode {
        DroidMode::Json | DroidMode::Ping => "json",
        DroidMode::Debug => "debug",
    }
}

impl ProcessHooks for DroidHooks {
    type State = DroidParser;

    fn key(&self) -> &str {
        KEY
    }

    fn default_profile(&self) -> AgentProfile {
        AgentProfile::new("default", &DroidProfile::default())
    }

    fn profile_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "model": { "type": ["string", "null"] },
                "autonomy": { "type": ["string", "null"], "enum": ["low", "medium", "high", null] },
                "mode": { "type": "string", "enum": ["json", "debug", "ping"] }
            }
        })
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn build_command(
        &self,
        profile: &AgentProfile,
        invocation: &Invocation,
    ) -> Result<CommandSpec> {
        let profile: DroidProfile = profile.parse()?;

        let mut args = vec![
            shell_quote(&self.bin.to_string_lossy()),
            "exec".to_string(),
            "--output-format".to_string(),
            output_format(profile.mode).to_string(),
        ];
        if let Some(autonomy) = &profile.autonomy {
            args.push("--auto".to_string());
            args.push(shell_quote(autonomy));
        }
        if let Some(model) = &profile.model {
            args.push("--model".to_string());
            args.push(shell_quote(model));
        }
        if let Some(session_id) = &invocation.session_id {
            args.push("--session-id".to_string());
            args.push(shell_quote(session_id));
        }
        args.push("--cwd".to_string());
        args.push(shell_quote(&invocation.cwd.to_string_lossy()));

        Ok(CommandSpec {
            line: args.join(" "),
            env: vec![("NO_COLOR".to_string(), "1".to_string())],
        })
    }

    fn build_stdin(&self, _profile: &AgentProfile, invocation: &Invocation) -> Option<String> {
        Some(invocation.prompt.clone())
    }

    fn new_state(&self, profile: &AgentProfile, _invocation: &Invocation) -> Result<DroidParser> {
        let profile: DroidProfile = profile.parse()?;
        Ok(DroidParser::new(profile.mode))
    }

    fn grouper(&self, state: &DroidParser) -> Grouper {
        if state.mode() == DroidMode::Ping {
            Grouper::suppressing_conversation()
        } else {
            Grouper::new()
        }
    }

    fn on_stdout_json(
        &self,
        state: &mut DroidParser,
        value: serde_json::Value,
    ) -> Vec<NormalizedEvent> {
        state.stdout_json(&value)
    }

    fn on_stdout_text(&self, state: &mut DroidParser, line: &str) -> Vec<NormalizedEvent> {
        state.stdout_text(line)
    }

    fn on_stderr_text(&self, state: &mut DroidParser, line: &str) -> Vec<NormalizedEvent> {
        state.parse_text(line, LogLevel::Warn)
    }

    fn after_close(&self, state: &mut DroidParser, exit_code: i32) -> Vec<NormalizedEvent> {
        let events = state.finish();
        if events.is_empty() && state.mode().is_envelope() && exit_code == 0 {
            warn!(mode = state.mode().as_str(), "droid exited without an envelope");
        }
        events
    }
}

/// Droid agent: a process adapter plus the optional ping-first handshake.
#[derive(Debug)]
pub struct DroidAgent {
    adapter: ProcessAdapter<DroidHooks>,
    ping_first: bool,
}

impl DroidAgent {
    pub fn new(config: &Config) -> Self {
        Self {
            adapter: ProcessAdapter::new(DroidHooks::new(&config.droid_bin))
                .with_kill_grace(Duration::from_millis(config.kill_grace_ms)),
            ping_first: config.droid_ping_first,
        }
    }

    /// Open a session with a throwaway prompt and return its id.
    async fn ping(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<Option<String>> {
        let profile = profile.clone().with_setting("mode", serde_json::json!("ping"));
        let invocation = Invocation {
            cwd: ctx.worktree_path.clone(),
            prompt: PING_PROMPT.to_string(),
            session_id: None,
        };
        let mut sink = EventSink::Emit(&ctx.emitter);
        let outcome = self
            .adapter
            .execute(&profile, &invocation, &ctx.cancel, &mut sink)
            .await?;
        if outcome.exit_code != 0 {
            warn!(attempt_id = %ctx.attempt_id, exit_code = outcome.exit_code, "droid ping failed");
        }
        Ok(outcome.session_id)
    }
}

#[async_trait]
impl Agent for DroidAgent {
    fn key(&self) -> &str {
        KEY
    }

    fn default_profile(&self) -> AgentProfile {
        self.adapter.hooks().default_profile()
    }

    fn profile_schema(&self) -> serde_json::Value {
        self.adapter.hooks().profile_schema()
    }

    fn supports_resume(&self) -> bool {
        true
    }

    async fn run(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<i32> {
        let mut invocation = ctx.start_invocation();
        if self.ping_first {
            match self.ping(profile, ctx).await? {
                Some(session_id) => invocation.session_id = Some(session_id),
                None => {
                    ctx.emitter
                        .log(LogLevel::Warn, "droid ping returned no session id")
                        .await;
                }
            }
        }
        let mut sink = EventSink::Emit(&ctx.emitter);
        let outcome = self
            .adapter
            .execute(profile, &invocation, &ctx.cancel, &mut sink)
            .await?;
        Ok(outcome.exit_code)
    }

    async fn resume(&self, profile: &AgentProfile, ctx: &AgentContext) -> Result<i32> {
        self.adapter.resume(profile, ctx).await
    }

    async fn inline(&self, profile: &AgentProfile, request: &InlineRequest) -> Result<String> {
        self.adapter.inline(profile, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(session_id: Option<&str>) -> Invocation {
        Invocation {
            cwd: PathBuf::from("/work/repo"),
            prompt: "do it".to_string(),
            session_id: session_id.map(str::to_string),
        }
    }

    #[test]
    fn command_reflects_profile_and_session() {
        let hooks = DroidHooks::new("droid");
        let profile = AgentProfile::new(
            "auto",
            &DroidProfile {
                model: Some("claude-sonnet".to_string()),
                autonomy: Some("medium".to_string()),
                mode: DroidMode::Debug,
            },
        );
        let spec = hooks
            .build_command(&profile, &invocation(Some("sess-1")))
            .unwrap();
        assert_eq!(
            spec.line,
            "droid exec --output-format debug --auto medium --model claude-sonnet --session-id sess-1 --cwd /work/repo"
        );
    }

    #[test]
    fn ping_mode_suppresses_conversation() {
        let hooks = DroidHooks::new("droid");
        let profile = hooks
            .default_profile()
            .with_setting("mode", serde_json::json!("ping"));
        let state = hooks.new_state(&profile, &invocation(None)).unwrap();
        assert_eq!(state.mode(), DroidMode::Ping);

        let spec = hooks.build_command(&profile, &invocation(None)).unwrap();
        assert!(spec.line.contains("--output-format json"));

        let mut grouper = hooks.grouper(&state);
        let out = grouper.handle(NormalizedEvent::Message {
            role: attempt_core::MessageRole::Assistant,
            text: "pong".to_string(),
        });
        assert!(out.is_empty());
    }

    #[test]
    fn default_profile_is_envelope_mode() {
        let hooks = DroidHooks::new("droid");
        let profile: DroidProfile = hooks.default_profile().parse().unwrap();
        assert_eq!(profile.mode, DroidMode::Json);
        assert_eq!(output_format(profile.mode), "json");
    }
}
