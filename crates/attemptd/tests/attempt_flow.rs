//! Integration tests for the attempt lifecycle.
//!
//! Drives real `sh` processes speaking the Codex NDJSON protocol through the
//! process adapter, grouper, emitter and SQLite storage.

use attempt_core::{AttemptStatus, Config, ConversationItem, DomainEventType, Id, RunState};
use attemptd::agent::process::{CommandSpec, ProcessAdapter, ProcessHooks};
use attemptd::agent::droid::DroidAgent;
use attemptd::agent::{Agent, AgentProfile, AgentRegistry, Invocation, Result as AgentResult};
use attemptd::bus::EventBus;
use attemptd::grouper::codex::CodexParser;
use attemptd::grouper::NormalizedEvent;
use attemptd::lifecycle::{CardRef, Orchestrator, QueueRequest, StopOutcome};
use attemptd::storage::{AttemptsRepository, SqliteRepository};
use attemptd::worktree::GitWorktreeProvider;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Prints a canned Codex transcript; `resume` runs answer with the session id.
struct ScriptedCodex {
    script: String,
}

impl ProcessHooks for ScriptedCodex {
    type State = CodexParser;

    fn key(&self) -> &str {
        "scripted"
    }

    fn default_profile(&self) -> AgentProfile {
        AgentProfile {
            id: "default".to_string(),
            settings: serde_json::json!({}),
        }
    }

    fn profile_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn build_command(
        &self,
        _profile: &AgentProfile,
        invocation: &Invocation,
    ) -> AgentResult<CommandSpec> {
        let line = match &invocation.session_id {
            Some(session_id) => format!(
                "cat > /dev/null; printf '%s\\n' '{{\"type\":\"item.completed\",\"item\":{{\"id\":\"r1\",\"type\":\"agent_message\",\"text\":\"resumed {session_id}\"}}}}'"
            ),
            None => format!("cat > /dev/null; {}", self.script),
        };
        Ok(CommandSpec {
            line,
            env: Vec::new(),
        })
    }

    fn build_stdin(&self, _profile: &AgentProfile, invocation: &Invocation) -> Option<String> {
        Some(invocation.prompt.clone())
    }

    fn new_state(&self, _profile: &AgentProfile, _invocation: &Invocation) -> AgentResult<CodexParser> {
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

const TRANSCRIPT: &[&str] = &[
    r#"{"type":"thread.started","thread_id":"th_1"}"#,
    r#"{"type":"turn.started"}"#,
    r#"{"type":"item.completed","item":{"id":"i0","type":"reasoning","text":"Look at the login handler."}}"#,
    r#"{"type":"item.updated","item":{"id":"t","type":"todo_list","items":[{"text":"read code","completed":true},{"text":"write fix","completed":false}]}}"#,
    r#"{"type":"item.started","item":{"id":"i1","type":"command_execution","command":"ls","status":"in_progress"}}"#,
    r#"{"type":"item.completed","item":{"id":"i1","type":"command_execution","command":"ls","aggregated_output":"README.md\n","exit_code":0,"status":"completed"}}"#,
    r#"{"type":"item.completed","item":{"id":"i2","type":"agent_message","text":"Fixed the login handler."}}"#,
    r#"{"type":"turn.completed","usage":{"input_tokens":10}}"#,
];

fn transcript_script(exit_code: i32) -> String {
    let lines: Vec<String> = TRANSCRIPT.iter().map(|l| format!("'{l}'")).collect();
    format!("printf '%s\\n' {}; exit {exit_code}", lines.join(" "))
}

fn init_repo(dir: &Path) {
    let git = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
    };
    git(&["init", "-b", "main"]);
    git(&["config", "user.email", "test@test.com"]);
    git(&["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# Test").unwrap();
    git(&["add", "."]);
    git(&["commit", "-m", "Initial commit"]);
}

struct TestDaemon {
    orchestrator: Orchestrator,
    repo: Arc<SqliteRepository>,
    card: CardRef,
    _dirs: (TempDir, TempDir, TempDir),
}

async fn create_test_daemon(script: String, config: Config) -> TestDaemon {
    let agent = ProcessAdapter::new(ScriptedCodex { script }).with_kill_grace(Duration::from_millis(200));
    create_daemon(Arc::new(agent), config).await
}

async fn create_daemon(agent: Arc<dyn Agent>, config: Config) -> TestDaemon {
    let db_dir = TempDir::new().unwrap();
    let repo = SqliteRepository::new(&db_dir.path().join("test.db"))
        .await
        .unwrap();
    repo.migrate_embedded().await.unwrap();
    let repo = Arc::new(repo);

    let git_dir = TempDir::new().unwrap();
    init_repo(git_dir.path());
    let worktree_root = TempDir::new().unwrap();

    let config = Config {
        agent: agent.key().to_string(),
        worktree_root: worktree_root.path().to_path_buf(),
        ..config
    };
    let mut agents = AgentRegistry::new();
    agents.register(agent);

    let orchestrator = Orchestrator::new(
        repo.clone(),
        EventBus::default(),
        agents,
        Arc::new(GitWorktreeProvider::new(worktree_root.path())),
        config,
    );
    let card = CardRef {
        board_id: Id::from_string("board-1"),
        card_id: Id::from_string("card-1"),
        title: "Fix login".to_string(),
        description: Some("Users cannot log in.".to_string()),
        repository_path: git_dir.path().to_path_buf(),
    };
    TestDaemon {
        orchestrator,
        repo,
        card,
        _dirs: (db_dir, git_dir, worktree_root),
    }
}

/// Write an executable fake `droid` that logs its arguments next to itself
/// and prints a pretty-printed result envelope.
fn fake_droid(dir: &Path) -> PathBuf {
    let bin = dir.join("droid");
    let script = r#"#!/bin/sh
cat > /dev/null
echo "$*" >> "$(dirname "$0")/calls.log"
printf '%s\n' '{' '  "type": "result",' '  "is_error": false,' '  "result": "Login fixed.",' '  "session_id": "sess-abcdef"' '}'
"#;
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
    bin
}

fn queue_request(card: &CardRef) -> QueueRequest {
    QueueRequest {
        card: card.clone(),
        agent_key: None,
        profile_id: None,
        base_branch: None,
        is_planning: false,
    }
}

#[tokio::test]
async fn codex_transcript_is_persisted_in_order() {
    let daemon = create_test_daemon(transcript_script(0), Config::default()).await;
    let mut events = daemon.orchestrator.bus().subscribe();

    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    let outcome = daemon
        .orchestrator
        .start(&attempt.id, &daemon.card)
        .await
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Succeeded);

    let stored = daemon.repo.get_attempt(&attempt.id).await.unwrap();
    assert_eq!(stored.status, AttemptStatus::Succeeded);
    assert_eq!(stored.session_id.as_deref(), Some("th_1"));
    assert!(stored.started_at.is_some());
    assert!(stored.ended_at.is_some());

    let items = daemon.repo.list_conversation(&attempt.id).await.unwrap();
    let seqs: Vec<i64> = items.iter().map(|r| r.seq).collect();
    let expected: Vec<i64> = (1..=items.len() as i64).collect();
    assert_eq!(seqs, expected);

    assert!(items.iter().any(|r| matches!(
        &r.item,
        ConversationItem::Thinking { text } if text.contains("login handler")
    )));
    let tool = items
        .iter()
        .find_map(|r| match &r.item {
            ConversationItem::Tool(tool) => Some(tool),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool.command.as_deref(), Some("ls"));
    assert_eq!(tool.status, RunState::Succeeded);
    assert_eq!(tool.exit_code, Some(0));
    assert!(matches!(
        &items.last().unwrap().item,
        ConversationItem::Message { text, .. } if text == "Fixed the login handler."
    ));

    let todos = daemon.repo.get_todos(&attempt.id).await.unwrap().unwrap();
    assert_eq!(todos.total, 2);
    assert_eq!(todos.completed, 1);

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == DomainEventType::Completed {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn nonzero_exit_fails_after_output() {
    let daemon = create_test_daemon(transcript_script(3), Config::default()).await;
    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    let outcome = daemon
        .orchestrator
        .start(&attempt.id, &daemon.card)
        .await
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));

    let items = daemon.repo.list_conversation(&attempt.id).await.unwrap();
    assert!(!items.is_empty());
    assert!(!items
        .iter()
        .any(|r| matches!(r.item, ConversationItem::Error { .. })));
}

#[tokio::test]
async fn stop_kills_a_stubborn_agent() {
    let script = "trap '' TERM; while :; do sleep 1; done".to_string();
    let daemon = create_test_daemon(script, Config::default()).await;
    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    let run = daemon
        .orchestrator
        .spawn_start(attempt.id.clone(), daemon.card.clone());

    for _ in 0..100 {
        if daemon.repo.get_attempt(&attempt.id).await.unwrap().status == AttemptStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Let the agent process start.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        daemon.orchestrator.stop(&attempt.id).await.unwrap(),
        StopOutcome::Signalled
    );
    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Stopped);
    assert_eq!(
        daemon.repo.get_attempt(&attempt.id).await.unwrap().status,
        AttemptStatus::Stopped
    );
}

#[tokio::test]
async fn resume_continues_recorded_session() {
    let daemon = create_test_daemon(transcript_script(0), Config::default()).await;
    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    daemon
        .orchestrator
        .start(&attempt.id, &daemon.card)
        .await
        .unwrap();

    let outcome = daemon
        .orchestrator
        .spawn_resume(attempt.id.clone(), daemon.card.clone(), "Add a test".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Succeeded);

    let items = daemon.repo.list_conversation(&attempt.id).await.unwrap();
    assert!(matches!(
        &items.last().unwrap().item,
        ConversationItem::Message { text, .. } if text == "resumed th_1"
    ));
}

#[tokio::test]
async fn setup_stage_runs_in_worktree_before_agent() {
    let config = Config {
        setup_script: Some("touch .setup-done && echo \"$AUTOMATION_STAGE\"".to_string()),
        ..Config::default()
    };
    let daemon = create_test_daemon(
        "test -f .setup-done || exit 9; exit 0".to_string(),
        config,
    )
    .await;
    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    let outcome = daemon
        .orchestrator
        .start(&attempt.id, &daemon.card)
        .await
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Succeeded);

    let items = daemon.repo.list_conversation(&attempt.id).await.unwrap();
    match &items[0].item {
        ConversationItem::Automation(item) => {
            assert_eq!(item.status, RunState::Succeeded);
            assert_eq!(item.stdout.trim(), "setup");
        }
        other => panic!("expected automation item, got {other:?}"),
    }
}

#[tokio::test]
async fn droid_ping_records_the_session_once() {
    let bin_dir = TempDir::new().unwrap();
    let config = Config {
        droid_bin: fake_droid(bin_dir.path()),
        droid_ping_first: true,
        kill_grace_ms: 200,
        ..Config::default()
    };
    let daemon = create_daemon(Arc::new(DroidAgent::new(&config)), config).await;
    let mut events = daemon.orchestrator.bus().subscribe();

    let attempt = daemon
        .orchestrator
        .queue(&queue_request(&daemon.card))
        .await
        .unwrap();
    let outcome = daemon
        .orchestrator
        .start(&attempt.id, &daemon.card)
        .await
        .unwrap();
    assert_eq!(outcome.status, AttemptStatus::Succeeded);

    let mut sessions = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == DomainEventType::SessionRecorded {
            sessions += 1;
        }
    }
    assert_eq!(sessions, 1);

    let stored = daemon.repo.get_attempt(&attempt.id).await.unwrap();
    assert_eq!(stored.session_id.as_deref(), Some("sess-abcdef"));

    let calls = std::fs::read_to_string(bin_dir.path().join("calls.log")).unwrap();
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].contains("--session-id"));
    assert!(calls[1].contains("--session-id sess-abcdef"));

    // The ping answer is suppressed; only the real run's envelope is kept.
    let items = daemon.repo.list_conversation(&attempt.id).await.unwrap();
    let answers: Vec<&ConversationItem> = items
        .iter()
        .map(|r| &r.item)
        .filter(|item| matches!(item, ConversationItem::Message { .. }))
        .collect();
    assert_eq!(answers.len(), 1);
    assert!(matches!(
        answers[0],
        ConversationItem::Message { text, .. } if text == "Login fixed."
    ));
}
