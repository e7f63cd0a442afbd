//! attemptd - Attempt Orchestration Daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use attempt_core::prompt::slugify;
use attempt_core::{AttemptStatus, Config, Id};
use attemptd::lifecycle::{self, AttemptOutcome, CardRef, Orchestrator, QueueRequest};
use attemptd::{open_orchestrator, DaemonConfig};
use clap::{Args, Parser, Subcommand};
use eyre::{bail, WrapErr};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "attemptd", about = "Attempt Orchestration Daemon", version)]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "ATTEMPTD_DB", global = true)]
    db: Option<PathBuf>,

    /// Config file (overrides <repo>/.attempt/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue and run an attempt for a card
    Run(RunArgs),
    /// Send a follow-up prompt to an attempt's agent session
    Resume(ResumeArgs),
    /// Rewrite a ticket with an agent and print the result
    Enhance(EnhanceArgs),
    /// Stop an attempt left active by a previous process
    Stop {
        /// Attempt ID
        attempt_id: String,
    },
}

#[derive(Args)]
struct AgentArgs {
    /// Agent key (codex, droid, opencode)
    #[arg(long)]
    agent: Option<String>,

    /// Agent profile
    #[arg(long)]
    profile: Option<String>,

    /// Model override
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Repository to work in
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Card title
    #[arg(long)]
    title: String,

    /// Card description
    #[arg(long)]
    description: Option<String>,

    #[arg(long, default_value = "local")]
    board_id: String,

    /// Card ID (defaults to the title slug)
    #[arg(long)]
    card_id: Option<String>,

    /// Branch to base the worktree on
    #[arg(long)]
    base_branch: Option<String>,

    /// Plan only; do not modify files
    #[arg(long)]
    plan: bool,

    #[command(flatten)]
    agent: AgentArgs,
}

#[derive(Args)]
struct ResumeArgs {
    /// Attempt ID
    attempt_id: String,

    /// Follow-up prompt
    #[arg(long)]
    prompt: String,

    /// Repository the attempt runs in
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Card title
    #[arg(long, default_value = "")]
    title: String,
}

#[derive(Args)]
struct EnhanceArgs {
    /// Repository to run the agent in
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    #[arg(long)]
    title: String,

    #[arg(long)]
    description: Option<String>,

    #[command(flatten)]
    agent: AgentArgs,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> eyre::Result<()> {
    let daemon = DaemonConfig {
        db_path: cli.db.clone().unwrap_or_else(attemptd::default_db_path),
        ..DaemonConfig::default()
    };

    match cli.command {
        Command::Run(args) => {
            let config = load_config(&args.repo, cli.config.as_deref(), &args.agent)?;
            let orchestrator = open_orchestrator(&daemon, config).await?;
            run_attempt(&orchestrator, args).await
        }
        Command::Resume(args) => {
            let config = load_config(&args.repo, cli.config.as_deref(), &AgentArgs::none())?;
            let orchestrator = open_orchestrator(&daemon, config).await?;
            resume_attempt(&orchestrator, args).await
        }
        Command::Enhance(args) => {
            let config = load_config(&args.repo, cli.config.as_deref(), &args.agent)?;
            let agent_key = config.agent.clone();
            let orchestrator = open_orchestrator(&daemon, config).await?;
            let cancel = CancellationToken::new();
            let ticket = tokio::select! {
                result = orchestrator.enhance_ticket(
                    &agent_key,
                    &args.title,
                    args.description.as_deref(),
                    &args.repo,
                    cancel.clone(),
                ) => result?,
                signal = shutdown_signal() => {
                    cancel.cancel();
                    bail!("interrupted by {}", signal?);
                }
            };
            println!("# {}\n\n{}", ticket.title, ticket.description);
            Ok(())
        }
        Command::Stop { attempt_id } => {
            let orchestrator = open_orchestrator(&daemon, Config::default()).await?;
            let outcome = orchestrator.stop(&Id::from_string(attempt_id)).await?;
            println!("{outcome:?}");
            Ok(())
        }
    }
}

impl AgentArgs {
    fn none() -> Self {
        Self {
            agent: None,
            profile: None,
            model: None,
        }
    }
}

/// Defaults, then `<repo>/.attempt/config`, then `--config`, then flags.
fn load_config(repo: &Path, path: Option<&Path>, agent: &AgentArgs) -> eyre::Result<Config> {
    let mut config = Config::for_repository(repo)
        .wrap_err_with(|| format!("failed to load config for {}", repo.display()))?;
    if let Some(path) = path {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?;
    }
    if let Some(key) = &agent.agent {
        config.agent.clone_from(key);
    }
    if agent.profile.is_some() {
        config.profile_id.clone_from(&agent.profile);
    }
    if agent.model.is_some() {
        config.model.clone_from(&agent.model);
    }
    config.resolve_paths(repo);
    Ok(config)
}

async fn run_attempt(orchestrator: &Orchestrator, args: RunArgs) -> eyre::Result<()> {
    let repository_path = args
        .repo
        .canonicalize()
        .wrap_err_with(|| format!("repository not found: {}", args.repo.display()))?;
    let card = CardRef {
        board_id: Id::from_string(args.board_id),
        card_id: Id::from_string(args.card_id.unwrap_or_else(|| slugify(&args.title))),
        title: args.title,
        description: args.description,
        repository_path,
    };
    let attempt = orchestrator
        .queue(&QueueRequest {
            card: card.clone(),
            agent_key: args.agent.agent,
            profile_id: args.agent.profile,
            base_branch: args.base_branch,
            is_planning: args.plan,
        })
        .await?;
    info!(attempt_id = %attempt.id, branch = %attempt.branch_name, "running attempt");

    let events = log_events(orchestrator);
    let outcome = wait_with_signals(orchestrator, orchestrator.spawn_start(attempt.id, card)).await;
    events.abort();
    report(outcome?)
}

async fn resume_attempt(orchestrator: &Orchestrator, args: ResumeArgs) -> eyre::Result<()> {
    let attempt = orchestrator
        .attempt(&Id::from_string(args.attempt_id))
        .await?;
    let card = CardRef {
        board_id: attempt.board_id,
        card_id: attempt.card_id,
        title: args.title,
        description: None,
        repository_path: args.repo.canonicalize()?,
    };

    let events = log_events(orchestrator);
    let run = orchestrator.spawn_resume(attempt.id, card, args.prompt);
    let outcome = wait_with_signals(orchestrator, run).await;
    events.abort();
    report(outcome?)
}

/// Wait for a run; on SIGINT/SIGTERM stop it and wait for its terminal status.
async fn wait_with_signals(
    orchestrator: &Orchestrator,
    mut run: JoinHandle<lifecycle::Result<AttemptOutcome>>,
) -> eyre::Result<AttemptOutcome> {
    tokio::select! {
        joined = &mut run => return Ok(joined??),
        signal = shutdown_signal() => {
            info!(signal = signal?, "initiating graceful shutdown");
            let stopped = orchestrator.stop_all().await;
            debug!(stopped, "stop requested for running attempts");
        }
    }
    Ok(run.await??)
}

fn report(outcome: AttemptOutcome) -> eyre::Result<()> {
    info!(status = %outcome.status, exit_code = ?outcome.exit_code, "attempt finished");
    if outcome.status != AttemptStatus::Succeeded {
        bail!("attempt {}", outcome.status);
    }
    Ok(())
}

/// Mirror domain events into the log.
fn log_events(orchestrator: &Orchestrator) -> JoinHandle<()> {
    let mut rx = orchestrator.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.to_json() {
                    Ok(json) => info!(target: "attemptd::events", "{json}"),
                    Err(e) => warn!(error = %e, "failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT")
}
