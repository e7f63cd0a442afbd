//! Codex CLI agent (`codex exec --json`).

use super::process::{CommandSpec, ProcessAdapter, ProcessHooks};
use super::{shell_quote, AgentProfile, Invocation, Result};
use crate::grouper::codex::CodexParser;
use crate::grouper::NormalizedEvent;
use attempt_core::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const KEY: &str = "codex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodexProfile {
    pub model: Option<String>,
    /// `read-only`, `workspace-write` or `danger-full-access`.
    pub sandbox: String,
    pub full_auto: bool,
    pub extra_args: Vec<String>,
}

impl Default for CodexProfile {
    fn default() -> Self {
        Self {
            model: None,
            sandbox: "workspace-write".to_string(),
            full_auto: true,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodexHooks {
    bin: PathBuf,
}

impl CodexHooks {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

/// The codex agent configured from `config`.
pub fn codex_agent(config: &Config) -> ProcessAdapter<CodexHooks> {
    ProcessAdapter::new(CodexHooks::new(&config.codex_bin))
        .with_kill_grace(Duration::from_millis(config.kill_grace_ms))
}

impl ProcessHooks for CodexHooks {
    type State = CodexParser;

    fn key(&self) -> &str {
        KEY
    }

    fn default_profile(&self) -> AgentProfile {
        AgentProfile::new("default", &CodexProfile::default())
    }

    fn profile_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "model": { "type": ["string", "null"] },
                "sandbox": {
                    "type": "string",
                    "enum": ["read-only", "workspace-write", "danger-full-access"]
                },
                "full_auto": { "type": "boolean" },
                "extra_args": { "type": "array", "items": { "type": "string" } }
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
        let profile: CodexProfile = profile.parse()?;

        let mut args = vec![
            shell_quote(&self.bin.to_string_lossy()),
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
        ];
        if let Some(model) = &profile.model {
            args.push("--model".to_string());
            args.push(shell_quote(model));
        }
        if profile.full_auto {
            args.push("--full-auto".to_string());
        } else {
            args.push("--sandbox".to_string());
            args.push(shell_quote(&profile.sandbox));
        }
        args.push("--cd".to_string());
        args.push(shell_quote(&invocation.cwd.to_string_lossy()));
        args.extend(profile.extra_args.iter().map(|a| shell_quote(a)));
        if let Some(session_id) = &invocation.session_id {
            args.push("resume".to_string());
            args.push(shell_quote(session_id));
        }
        // Prompt comes from stdin.
        args.push("-".to_string());

        Ok(CommandSpec {
            line: args.join(" "),
            env: vec![("NO_COLOR".to_string(), "1".to_string())],
        })
    }

    fn build_stdin(&self, _profile: &AgentProfile, invocation: &Invocation) -> Option<String> {
        Some(invocation.prompt.clone())
    }

    fn new_state(&self, _profile: &AgentProfile, _invocation: &Invocation) -> Result<CodexParser> {
        Ok(CodexParser::new())
    }

    fn on_stdout_json(
        &self,
        state: &mut CodexParser,
        value: serde_json::Value,
    ) -> Vec<NormalizedEvent> {
        state.parse(&value)
    }
}
