//! Server process shutdown.
//!
//! Stop writes, give the server a bounded grace period to exit on its own,
//! then terminate the whole process tree.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, trace, warn};

/// Steps of the shutdown sequence. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    InputClosing,
    WaitingExit,
    Exited,
    Escalating,
    Terminated,
}

/// How the server ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own within the grace period.
    Exited(Option<i32>),
    /// Was already gone when we went to wait for it.
    AlreadyGone,
    /// Did not exit in time; the process tree was terminated.
    Escalated,
}

/// Terminates a process and every descendant it spawned.
#[async_trait]
pub trait ProcessTreeTerminator: Send + Sync {
    /// Signal the whole tree rooted at `child` and reap `child`.
    ///
    /// `timeout` bounds the wait between the polite and the forced signal.
    async fn terminate_tree(&self, child: &mut Child, timeout: Duration) -> std::io::Result<()>;
}

/// Process-tree termination for the host platform.
///
/// Relies on the child having been started as the leader of its own process
/// group (Unix) or with a new process group (Windows).
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformTerminator;

#[cfg(unix)]
#[async_trait]
impl ProcessTreeTerminator for PlatformTerminator {
    async fn terminate_tree(&self, child: &mut Child, timeout: Duration) -> std::io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };
        let group = Pid::from_raw(pid as i32);

        info!(pid, "Sending SIGTERM to server process group");
        match killpg(group, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "killpg SIGTERM failed"),
        }

        if tokio::time::timeout(timeout, child.wait()).await.is_err() {
            warn!(pid, "Server ignored SIGTERM, sending SIGKILL");
        }

        // Descendants may outlive the leader, so the group always gets SIGKILL.
        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "killpg SIGKILL failed"),
        }

        child.wait().await?;
        Ok(())
    }
}

#[cfg(windows)]
#[async_trait]
impl ProcessTreeTerminator for PlatformTerminator {
    async fn terminate_tree(&self, child: &mut Child, timeout: Duration) -> std::io::Result<()> {
        let Some(pid) = child.id() else {
            return Ok(());
        };

        info!(pid, "Terminating server process tree");
        let status = tokio::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;

        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!(pid, code = ?s.code(), "taskkill failed, killing process directly");
                child.start_kill()?;
            }
            Err(e) => {
                warn!(pid, error = %e, "taskkill unavailable, killing process directly");
                child.start_kill()?;
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Drives one server process through [`ShutdownPhase`] exactly once.
pub struct ShutdownCoordinator<'a> {
    grace: Duration,
    terminator: &'a dyn ProcessTreeTerminator,
    phase: ShutdownPhase,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(grace: Duration, terminator: &'a dyn ProcessTreeTerminator) -> Self {
        Self {
            grace,
            terminator,
            phase: ShutdownPhase::Running,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    fn advance(&mut self, next: ShutdownPhase) {
        debug_assert!(next > self.phase, "shutdown went from {:?} to {:?}", self.phase, next);
        trace!(from = ?self.phase, to = ?next, "Shutdown phase");
        self.phase = next;
    }

    /// Run the sequence.
    ///
    /// `close_input` closes the server's stdin; its failure is ignored since
    /// the server may already be gone. Never fails: a server that will not
    /// exit is terminated, and termination errors are only logged.
    pub async fn run<F>(mut self, child: &mut Child, close_input: F) -> ShutdownOutcome
    where
        F: Future<Output = std::io::Result<()>>,
    {
        self.advance(ShutdownPhase::InputClosing);
        if let Err(e) = close_input.await {
            debug!(error = %e, "Closing server input failed");
        }

        self.advance(ShutdownPhase::WaitingExit);
        let outcome = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                self.advance(ShutdownPhase::Exited);
                debug!(code = ?status.code(), "Server exited");
                ShutdownOutcome::Exited(status.code())
            }
            Ok(Err(e)) => {
                self.advance(ShutdownPhase::Exited);
                debug!(error = %e, "Server process already gone");
                ShutdownOutcome::AlreadyGone
            }
            Err(_) => {
                self.advance(ShutdownPhase::Escalating);
                warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "Server did not exit in time, terminating process tree"
                );
                if let Err(e) = self.terminator.terminate_tree(child, self.grace).await {
                    warn!(error = %e, "Process tree termination failed");
                }
                ShutdownOutcome::Escalated
            }
        };

        self.advance(ShutdownPhase::Terminated);
        outcome
    }
}
