//! Attempt lifecycle controller.
//!
//! Owns the running registry and drives one attempt at a time per card:
//! worktree, automation stages, agent invocation, cleanup, terminal status.
//! Every run ends with exactly one terminal status and one
//! `attempt.completed` event.

use crate::agent::{AgentContext, AgentError, AgentRegistry, InlineRequest};
use crate::automation::{check_stage, AutomationConfig, AutomationError, AutomationRunner, StageEnv};
use crate::bus::EventBus;
use crate::emit::Emitter;
use crate::git::{self, GitError};
use crate::registry::{RunHandle, RunningRegistry};
use crate::storage::{AttemptsRepository, StorageError};
use crate::worktree::{WorktreeError, WorktreeMeta, WorktreeProvider};
use attempt_core::prompt::{build_enhance_prompt, slugify};
use attempt_core::{
    split_ticket, Attempt, AttemptStatus, AutomationStage, Config, ConversationItem, Id,
    LogLevel, RunState, TicketParts,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Automation(#[from] AutomationError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("attempt {0} already has a run in flight")]
    AlreadyRunning(Id),
    #[error("attempt {id} is {status}, expected queued")]
    NotQueued { id: Id, status: AttemptStatus },
    #[error("background task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// The card an attempt works on. Cards themselves live outside this crate.
#[derive(Debug, Clone)]
pub struct CardRef {
    pub board_id: Id,
    pub card_id: Id,
    pub title: String,
    pub description: Option<String>,
    pub repository_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub card: CardRef,
    /// Defaults to the configured agent.
    pub agent_key: Option<String>,
    pub profile_id: Option<String>,
    /// Defaults to the configured base branch, then the repository default.
    pub base_branch: Option<String>,
    pub is_planning: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The in-flight run was told to stop.
    Signalled,
    /// No run in flight but the stored status was active; forced to `stopped`.
    ForceStopped,
    /// Nothing to stop.
    NotRunning(AttemptStatus),
}

#[derive(Debug, Clone)]
enum RunMode {
    Start,
    Resume { followup: String },
}

/// Drives attempts from `queued` to a terminal status.
#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn AttemptsRepository>,
    bus: EventBus,
    registry: Arc<RunningRegistry>,
    agents: Arc<AgentRegistry>,
    worktrees: Arc<dyn WorktreeProvider>,
    automation: AutomationRunner,
    config: Arc<Config>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("running", &self.registry.len())
            .field("agents", &self.agents)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn AttemptsRepository>,
        bus: EventBus,
        agents: AgentRegistry,
        worktrees: Arc<dyn WorktreeProvider>,
        config: Config,
    ) -> Self {
        Self {
            repo,
            bus,
            registry: Arc::new(RunningRegistry::new()),
            agents: Arc::new(agents),
            worktrees,
            automation: AutomationRunner::new(AutomationConfig::from_config(&config)),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &RunningRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn attempt(&self, attempt_id: &Id) -> Result<Attempt> {
        Ok(self.repo.get_attempt(attempt_id).await?)
    }

    /// Create the card's attempt, or re-queue the existing one.
    ///
    /// A card has at most one attempt; re-queueing keeps its branch, worktree
    /// and session so the attempt can be resumed.
    pub async fn queue(&self, request: &QueueRequest) -> Result<Attempt> {
        let card = &request.card;
        let agent_key = request
            .agent_key
            .clone()
            .unwrap_or_else(|| self.config.agent.clone());
        self.agents.get(&agent_key)?;
        let profile_id = request
            .profile_id
            .clone()
            .or_else(|| self.config.profile_id.clone());
        let base_branch = self.base_branch(request).await?;

        if let Some(existing) = self
            .repo
            .find_attempt_by_card(&card.board_id, &card.card_id)
            .await?
        {
            if self.registry.contains(&existing.id) {
                return Err(LifecycleError::AlreadyRunning(existing.id));
            }
            let mut attempt = self.repo.requeue_attempt(&existing.id).await?;
            attempt.agent_key = agent_key;
            attempt.profile_id = profile_id;
            attempt.base_branch = base_branch;
            attempt.is_planning = request.is_planning;
            self.repo.update_attempt(&attempt).await?;
            info!(attempt_id = %attempt.id, card_id = %card.card_id, "attempt re-queued");
            return Ok(attempt);
        }

        let id = Id::new();
        let now = Utc::now();
        let attempt = Attempt {
            branch_name: branch_name(&self.config.branch_prefix, &card.title, &id),
            id,
            board_id: card.board_id.clone(),
            card_id: card.card_id.clone(),
            agent_key,
            status: AttemptStatus::Queued,
            base_branch,
            worktree_path: None,
            session_id: None,
            profile_id,
            is_planning: request.is_planning,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };
        self.repo.insert_attempt(&attempt).await?;
        info!(
            attempt_id = %attempt.id,
            card_id = %card.card_id,
            agent = %attempt.agent_key,
            branch = %attempt.branch_name,
            "attempt queued"
        );
        Ok(attempt)
    }

    /// Run a queued attempt to completion.
    pub async fn start(&self, attempt_id: &Id, card: &CardRef) -> Result<AttemptOutcome> {
        self.run(attempt_id, card, RunMode::Start).await
    }

    /// Continue the attempt's recorded agent session with a follow-up prompt.
    pub async fn resume(
        &self,
        attempt_id: &Id,
        card: &CardRef,
        followup_prompt: &str,
    ) -> Result<AttemptOutcome> {
        self.run(
            attempt_id,
            card,
            RunMode::Resume {
                followup: followup_prompt.to_string(),
            },
        )
        .await
    }

    pub fn spawn_start(&self, attempt_id: Id, card: CardRef) -> JoinHandle<Result<AttemptOutcome>> {
        let this = self.clone();
        tokio::spawn(async move { this.start(&attempt_id, &card).await })
    }

    pub fn spawn_resume(
        &self,
        attempt_id: Id,
        card: CardRef,
        followup_prompt: String,
    ) -> JoinHandle<Result<AttemptOutcome>> {
        let this = self.clone();
        tokio::spawn(async move { this.resume(&attempt_id, &card, &followup_prompt).await })
    }

    /// Stop an attempt.
    ///
    /// With a run in flight: mark it `stopping`, then flag it aborted and
    /// cancel it; the run itself records `stopped`. With no run in flight but an
    /// active stored status (a crashed daemon), force `stopped` directly.
    pub async fn stop(&self, attempt_id: &Id) -> Result<StopOutcome> {
        if let Some(handle) = self.registry.get(attempt_id) {
            let emitter = self.emitter(&handle);
            // Record `stopping` before cancelling so it cannot land after `stopped`.
            match emitter.transition(AttemptStatus::Stopping).await {
                Ok(()) | Err(StorageError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            handle.abort();
            info!(attempt_id = %attempt_id, "stop requested");
            return Ok(StopOutcome::Signalled);
        }

        let attempt = self.repo.get_attempt(attempt_id).await?;
        if !attempt.status.is_active() {
            debug!(attempt_id = %attempt_id, status = %attempt.status, "nothing to stop");
            return Ok(StopOutcome::NotRunning(attempt.status));
        }

        warn!(attempt_id = %attempt_id, status = %attempt.status, "no run in flight; forcing stopped");
        let handle = Arc::new(RunHandle::new(
            attempt.id.clone(),
            attempt.board_id.clone(),
            PathBuf::new(),
        ));
        let emitter = self.emitter(&handle);
        emitter.transition(AttemptStatus::Stopped).await?;
        emitter.completed(AttemptStatus::Stopped, None);
        Ok(StopOutcome::ForceStopped)
    }

    /// Stop every run in flight.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for attempt_id in self.registry.ids() {
            match self.stop(&attempt_id).await {
                Ok(StopOutcome::Signalled) => stopped += 1,
                Ok(_) => {}
                Err(e) => warn!(attempt_id = %attempt_id, error = %e, "failed to stop attempt"),
            }
        }
        stopped
    }

    /// Ask an agent to rewrite a ticket and split its answer into title and
    /// description. Falls back to the originals when the answer has no
    /// `# Title` heading.
    pub async fn enhance_ticket(
        &self,
        agent_key: &str,
        title: &str,
        description: Option<&str>,
        cwd: &Path,
        cancel: CancellationToken,
    ) -> Result<TicketParts> {
        let agent = self.agents.get(agent_key)?;
        let profile =
            self.agents
                .resolve_profile(agent.as_ref(), self.config.profile_id.as_deref(), &self.config)?;
        let request = InlineRequest {
            prompt: build_enhance_prompt(title, description),
            cwd: cwd.to_path_buf(),
            cancel,
        };
        let text = agent.inline(&profile, &request).await?;
        debug!(agent = agent_key, chars = text.len(), "ticket enhanced");
        Ok(split_ticket(&text, title, description.unwrap_or_default()))
    }

    async fn base_branch(&self, request: &QueueRequest) -> Result<String> {
        if let Some(branch) = request
            .base_branch
            .clone()
            .or_else(|| self.config.base_branch.clone())
        {
            return Ok(branch);
        }
        let repo = request.card.repository_path.clone();
        let branch = tokio::task::spawn_blocking(move || git::detect_default_branch(&repo))
            .await
            .map_err(|e| LifecycleError::Join(e.to_string()))??;
        Ok(branch)
    }

    async fn run(&self, attempt_id: &Id, card: &CardRef, mode: RunMode) -> Result<AttemptOutcome> {
        let attempt = self.repo.get_attempt(attempt_id).await?;
        let agent = self.agents.get(&attempt.agent_key)?;

        match &mode {
            RunMode::Start if attempt.status != AttemptStatus::Queued => {
                return Err(LifecycleError::NotQueued {
                    id: attempt.id,
                    status: attempt.status,
                });
            }
            RunMode::Start => {}
            RunMode::Resume { followup } => {
                if !agent.supports_resume() {
                    return Err(AgentError::ResumeUnsupported(attempt.agent_key).into());
                }
                if attempt.session_id.is_none() || followup.trim().is_empty() {
                    return Err(AgentError::MissingSession.into());
                }
            }
        }

        let handle = self
            .registry
            .insert(RunHandle::new(
                attempt.id.clone(),
                attempt.board_id.clone(),
                card.repository_path.clone(),
            ))
            .ok_or_else(|| LifecycleError::AlreadyRunning(attempt.id.clone()))?;

        let attempt = match mode {
            RunMode::Resume { .. } => match self.repo.requeue_attempt(&attempt.id).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    self.registry.remove(&attempt.id);
                    return Err(e.into());
                }
            },
            RunMode::Start => attempt,
        };

        let emitter = self.emitter(&handle);
        let outcome = self
            .drive(&attempt, card, &mode, &handle, &emitter)
            .await;
        self.registry.remove(&attempt.id);
        Ok(outcome)
    }

    /// The run body. Failures become a terminal status, never an `Err`.
    async fn drive(
        &self,
        attempt: &Attempt,
        card: &CardRef,
        mode: &RunMode,
        handle: &Arc<RunHandle>,
        emitter: &Emitter,
    ) -> AttemptOutcome {
        if handle.is_aborted() {
            return self.finish(emitter, AttemptStatus::Stopped, None).await;
        }
        emitter.status(AttemptStatus::Running).await;
        info!(attempt_id = %attempt.id, agent = %attempt.agent_key, "attempt running");

        let result = self.invoke(attempt, card, mode, handle, emitter).await;

        let (status, exit_code) = if handle.is_aborted() {
            (AttemptStatus::Stopped, result.ok())
        } else {
            match result {
                Ok(0) => (AttemptStatus::Succeeded, Some(0)),
                Ok(code) => (AttemptStatus::Failed, Some(code)),
                Err(
                    LifecycleError::Agent(AgentError::Cancelled)
                    | LifecycleError::Automation(AutomationError::Cancelled(_)),
                ) => (AttemptStatus::Stopped, None),
                Err(e) => {
                    warn!(attempt_id = %attempt.id, error = %e, "attempt failed");
                    emitter.conversation(ConversationItem::error(e.to_string())).await;
                    (AttemptStatus::Failed, None)
                }
            }
        };

        self.cleanup(attempt, card, handle, emitter).await;
        self.finish(emitter, status, exit_code).await
    }

    /// Worktree, pre-agent stages, profile, agent. Returns the agent's exit code.
    async fn invoke(
        &self,
        attempt: &Attempt,
        card: &CardRef,
        mode: &RunMode,
        handle: &Arc<RunHandle>,
        emitter: &Emitter,
    ) -> Result<i32> {
        let cancel = handle.cancel_token();
        let worktree_path = self.ensure_worktree(attempt, card, handle).await?;
        let env = StageEnv {
            attempt_id: attempt.id.to_string(),
            worktree_path: worktree_path.clone(),
            repository_path: card.repository_path.clone(),
        };

        for stage in [
            AutomationStage::CopyFiles,
            AutomationStage::Setup,
            AutomationStage::Dev,
        ] {
            self.run_stage(stage, &env, &cancel, emitter).await?;
        }

        let agent = self.agents.get(&attempt.agent_key)?;
        let profile = self.agents.resolve_profile(
            agent.as_ref(),
            attempt.profile_id.as_deref(),
            &self.config,
        )?;

        let ctx = AgentContext {
            attempt_id: attempt.id.clone(),
            board_id: attempt.board_id.clone(),
            card_id: attempt.card_id.clone(),
            worktree_path,
            repository_path: card.repository_path.clone(),
            branch_name: attempt.branch_name.clone(),
            base_branch: attempt.base_branch.clone(),
            card_title: card.title.clone(),
            card_description: card.description.clone(),
            profile_id: Some(profile.id.clone()),
            session_id: attempt.session_id.clone(),
            followup_prompt: match mode {
                RunMode::Resume { followup } => Some(followup.clone()),
                RunMode::Start => None,
            },
            is_planning: attempt.is_planning,
            cancel,
            emitter: emitter.clone(),
        };

        let exit_code = match mode {
            RunMode::Start => agent.run(&profile, &ctx).await?,
            RunMode::Resume { .. } => agent.resume(&profile, &ctx).await?,
        };
        info!(attempt_id = %attempt.id, exit_code, "agent finished");
        Ok(exit_code)
    }

    async fn ensure_worktree(
        &self,
        attempt: &Attempt,
        card: &CardRef,
        handle: &RunHandle,
    ) -> Result<PathBuf> {
        let out_dir = attempt.worktree_path.as_ref().map_or_else(
            || self.worktrees.worktree_path(&attempt.board_id, &attempt.id),
            PathBuf::from,
        );
        let provider = Arc::clone(&self.worktrees);
        let repo = card.repository_path.clone();
        let base = attempt.base_branch.clone();
        let branch = attempt.branch_name.clone();
        let meta = WorktreeMeta {
            attempt_id: attempt.id.clone(),
            board_id: attempt.board_id.clone(),
            card_id: attempt.card_id.clone(),
        };

        let path = tokio::task::spawn_blocking(move || {
            provider.create_worktree(&repo, &base, &branch, &out_dir, &meta)
        })
        .await
        .map_err(|e| WorktreeError::Join(e.to_string()))??;

        handle.set_worktree_path(&path);
        self.repo
            .set_worktree_path(&attempt.id, &path.to_string_lossy())
            .await?;
        Ok(path)
    }

    async fn run_stage(
        &self,
        stage: AutomationStage,
        env: &StageEnv,
        cancel: &CancellationToken,
        emitter: &Emitter,
    ) -> Result<()> {
        let Some(script) = self.config.automation_script(stage) else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(AutomationError::Cancelled(stage).into());
        }

        let item = self
            .automation
            .run_stage(stage, script, &env.worktree_path, env, cancel)
            .await;
        let failed = item.status == RunState::Failed;
        let check = check_stage(&item, self.config.allows_failure(stage));
        emitter.conversation(ConversationItem::Automation(item)).await;

        if cancel.is_cancelled() {
            return Err(AutomationError::Cancelled(stage).into());
        }
        check?;
        if failed {
            emitter
                .log(
                    LogLevel::Warn,
                    format!("automation stage {stage} failed; continuing"),
                )
                .await;
        }
        Ok(())
    }

    /// Best-effort `cleanup` stage. Runs even after a stop; never fails the run.
    async fn cleanup(&self, attempt: &Attempt, card: &CardRef, handle: &RunHandle, emitter: &Emitter) {
        let Some(script) = self.config.automation_script(AutomationStage::Cleanup) else {
            return;
        };
        let Some(worktree_path) = handle.worktree_path() else {
            debug!(attempt_id = %attempt.id, "no worktree; skipping cleanup");
            return;
        };
        let env = StageEnv {
            attempt_id: attempt.id.to_string(),
            worktree_path,
            repository_path: card.repository_path.clone(),
        };
        let item = self
            .automation
            .run_stage(
                AutomationStage::Cleanup,
                script,
                &env.worktree_path,
                &env,
                &CancellationToken::new(),
            )
            .await;
        if item.status == RunState::Failed {
            warn!(attempt_id = %attempt.id, exit_code = ?item.exit_code, "cleanup failed");
            emitter
                .log(LogLevel::Warn, "automation stage cleanup failed")
                .await;
        }
        emitter.conversation(ConversationItem::Automation(item)).await;
    }

    async fn finish(
        &self,
        emitter: &Emitter,
        status: AttemptStatus,
        exit_code: Option<i32>,
    ) -> AttemptOutcome {
        let status = match emitter.transition(status).await {
            Ok(()) => status,
            // A stop landed after the outcome was decided; `stopping` resolves to `stopped`.
            Err(StorageError::IllegalTransition {
                from: AttemptStatus::Stopping,
                ..
            }) => {
                emitter.status(AttemptStatus::Stopped).await;
                AttemptStatus::Stopped
            }
            Err(e) => {
                warn!(attempt_id = %emitter.attempt_id(), error = %e, "failed to record terminal status");
                status
            }
        };
        emitter.completed(status, exit_code);
        info!(attempt_id = %emitter.attempt_id(), status = %status, exit_code = ?exit_code, "attempt finished");
        AttemptOutcome { status, exit_code }
    }

    fn emitter(&self, handle: &Arc<RunHandle>) -> Emitter {
        Emitter::new(Arc::clone(&self.repo), self.bus.clone(), Arc::clone(handle))
    }
}

/// `<prefix><title-slug>-<id suffix>`, e.g. `attempt/fix-login-3f2a9c1d`.
pub fn branch_name(prefix: &str, title: &str, id: &Id) -> String {
    let id = id.as_ref();
    let suffix = &id[id.len().saturating_sub(8)..];
    let mut slug = slugify(title);
    slug.truncate(48);
    let slug = slug.trim_end_matches('-');
    format!("{prefix}{slug}-{suffix}")
}
