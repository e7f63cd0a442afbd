//! Configuration parsing for the attempt orchestrator.
//!
//! `key=value` format read from `.attempt/config` in the repository.
//! Precedence: CLI flags > `--config` file > `.attempt/config` > defaults.

use crate::types::AutomationStage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Repository-relative location of the default config file.
pub const DEFAULT_CONFIG_PATH: &str = ".attempt/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Orchestrator and per-attempt configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Agent selection
    pub agent: String,
    pub model: Option<String>,
    pub profile_id: Option<String>,

    // Branches and worktrees
    pub base_branch: Option<String>,
    pub branch_prefix: String,
    pub worktree_root: PathBuf,

    // Automation scripts
    pub copy_files_script: Option<String>,
    pub setup_script: Option<String>,
    pub dev_script: Option<String>,
    pub cleanup_script: Option<String>,
    /// Global allowed-to-fail switch for every stage.
    pub automation_allow_failure: bool,
    pub copy_files_allow_failure: bool,
    pub setup_allow_failure: bool,
    pub dev_allow_failure: bool,
    pub cleanup_allow_failure: bool,
    /// Per-stream tail budget for captured automation output.
    pub automation_output_limit_bytes: usize,
    pub dev_ready_timeout_ms: u64,

    // Process adapters
    pub kill_grace_ms: u64,
    pub codex_bin: PathBuf,
    pub droid_bin: PathBuf,
    /// Run droid once in ping mode to harvest a session id before the real run.
    pub droid_ping_first: bool,

    // Session adapters
    pub opencode_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: "codex".to_string(),
            model: None,
            profile_id: None,
            base_branch: None,
            branch_prefix: "attempt/".to_string(),
            worktree_root: dirs::data_local_dir().map_or_else(
                || PathBuf::from("~/.local/share/attemptd/worktrees"),
                |d| d.join("attemptd/worktrees"),
            ),
            copy_files_script: None,
            setup_script: None,
            dev_script: None,
            cleanup_script: None,
            automation_allow_failure: false,
            copy_files_allow_failure: false,
            setup_allow_failure: false,
            dev_allow_failure: false,
            cleanup_allow_failure: true,
            automation_output_limit_bytes: 64 * 1024,
            dev_ready_timeout_ms: 5_000,
            kill_grace_ms: 3_000,
            codex_bin: PathBuf::from("codex"),
            droid_bin: PathBuf::from("droid"),
            droid_ping_first: true,
            opencode_url: "http://127.0.0.1:4096".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `<repo>/.attempt/config` if it exists, else defaults.
    pub fn for_repository(repo_path: &Path) -> Result<Self, ConfigError> {
        let path = repo_path.join(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Script configured for a stage, if any.
    pub fn automation_script(&self, stage: AutomationStage) -> Option<&str> {
        let script = match stage {
            AutomationStage::CopyFiles => self.copy_files_script.as_deref(),
            AutomationStage::Setup => self.setup_script.as_deref(),
            AutomationStage::Dev => self.dev_script.as_deref(),
            AutomationStage::Cleanup => self.cleanup_script.as_deref(),
        };
        script.filter(|s| !s.trim().is_empty())
    }

    /// Whether a failing stage downgrades to a warning.
    pub fn allows_failure(&self, stage: AutomationStage) -> bool {
        self.automation_allow_failure
            || match stage {
                AutomationStage::CopyFiles => self.copy_files_allow_failure,
                AutomationStage::Setup => self.setup_allow_failure,
                AutomationStage::Dev => self.dev_allow_failure,
                AutomationStage::Cleanup => self.cleanup_allow_failure,
            }
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "agent" => self.agent = value.to_string(),
            "model" => self.model = Self::optional(value),
            "profile_id" => self.profile_id = Self::optional(value),
            "base_branch" => self.base_branch = Self::optional(value),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "worktree_root" => self.worktree_root = PathBuf::from(value),
            "copy_files_script" => self.copy_files_script = Self::optional(value),
            "setup_script" => self.setup_script = Self::optional(value),
            "dev_script" => self.dev_script = Self::optional(value),
            "cleanup_script" => self.cleanup_script = Self::optional(value),
            "automation_allow_failure" => {
                self.automation_allow_failure = Self::parse_bool(key, value)?;
            }
            "copy_files_allow_failure" => {
                self.copy_files_allow_failure = Self::parse_bool(key, value)?;
            }
            "setup_allow_failure" => self.setup_allow_failure = Self::parse_bool(key, value)?,
            "dev_allow_failure" => self.dev_allow_failure = Self::parse_bool(key, value)?,
            "cleanup_allow_failure" => self.cleanup_allow_failure = Self::parse_bool(key, value)?,
            "automation_output_limit_bytes" => {
                self.automation_output_limit_bytes = Self::parse_int(key, value)?;
            }
            "dev_ready_timeout_ms" => self.dev_ready_timeout_ms = Self::parse_int(key, value)?,
            "kill_grace_ms" => self.kill_grace_ms = Self::parse_int(key, value)?,
            "codex_bin" => self.codex_bin = PathBuf::from(value),
            "droid_bin" => self.droid_bin = PathBuf::from(value),
            "droid_ping_first" => self.droid_ping_first = Self::parse_bool(key, value)?,
            "opencode_url" => self.opencode_url = value.trim_end_matches('/').to_string(),
            _ => {
                // Unknown keys warn but do not fail.
                warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve a relative worktree root against the repository.
    pub fn resolve_paths(&mut self, repo_path: &Path) {
        if self.worktree_root.is_relative() {
            self.worktree_root = repo_path.join(&self.worktree_root);
        }
    }
}
