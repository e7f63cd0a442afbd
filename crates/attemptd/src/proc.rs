//! Process-group signalling for spawned shells.
//!
//! Agent and automation commands run as `sh -c` in their own process group so
//! a stop reaches every descendant, not only the shell.

use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How a terminated process group went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace period after SIGTERM.
    Exited,
    /// Still alive after the grace period; SIGKILL was sent once.
    Killed,
    /// Had already exited before any signal was sent.
    AlreadyExited,
}

/// Build `sh -c <line>` placed in a fresh process group.
pub fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// SIGTERM the child's process group, then SIGKILL exactly once if it outlives `grace`.
///
/// The child is reaped before returning.
pub async fn terminate_group(child: &mut Child, grace: Duration) -> TerminateOutcome {
    if let Ok(Some(_)) = child.try_wait() {
        return TerminateOutcome::AlreadyExited;
    }
    let Some(pid) = child.id() else {
        return TerminateOutcome::AlreadyExited;
    };

    send_term(child, pid);

    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        if let Err(e) = result {
            warn!(pid, error = %e, "failed to reap process after SIGTERM");
        }
        return TerminateOutcome::Exited;
    }

    debug!(pid, grace_ms = grace.as_millis() as u64, "grace elapsed; sending SIGKILL");
    send_kill(child, pid);
    if let Err(e) = child.wait().await {
        warn!(pid, error = %e, "failed to reap process after SIGKILL");
    }
    TerminateOutcome::Killed
}

#[cfg(unix)]
fn send_term(_child: &mut Child, pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(_child: &mut Child, pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_term(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}

/// Signal a process group. Returns false when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, signal = ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Whether a process with this pid is still running.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
