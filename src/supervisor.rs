//! Lifecycle owner for the child language-server process.
//!
//! The supervisor holds the child and its three pipes until
//! [`Supervisor::detach_pipes`] hands them to the LSP client. From that
//! point the pipes have exactly one owner; the supervisor never touches
//! a detached handle again, so a double close cannot happen.

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// How many times [`Supervisor::restart`] may recycle the child before
/// giving up.
pub const DEFAULT_RESTART_BUDGET: u32 = 5;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("restart budget of {0} exhausted")]
    RestartExhausted(u32),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Supervisor {
    command: PathBuf,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    restarts: u32,
    restart_budget: u32,
}

impl Supervisor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            restarts: 0,
            restart_budget: DEFAULT_RESTART_BUDGET,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    #[must_use]
    pub const fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = budget;
        self
    }

    /// Start the child with all three streams piped. At most one child
    /// runs at a time; a live one is killed first.
    pub async fn spawn(&mut self) -> Result<(), SupervisorError> {
        if self.child.is_some() {
            self.kill().await;
        }
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: self.command.display().to_string(),
            source,
        })?;
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.stderr = child.stderr.take();
        self.child = Some(child);
        tracing::info!("spawned {} (restarts so far: {})", self.command.display(), self.restarts);
        Ok(())
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Hand all three pipes to the caller, or `None` unless every one
    /// is still owned here. Afterwards the supervisor will not close
    /// them; only the new owner may.
    pub fn detach_pipes(&mut self) -> Option<(ChildStdin, ChildStdout, ChildStderr)> {
        if self.stdin.is_none() || self.stdout.is_none() || self.stderr.is_none() {
            return None;
        }
        match (self.stdin.take(), self.stdout.take(), self.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => Some((stdin, stdout, stderr)),
            _ => None,
        }
    }

    /// Close any still-owned pipes (unblocking readers and signalling
    /// the child to exit), reap the child, and forget it.
    pub async fn kill(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill language server child: {e}");
            }
            match child.wait().await {
                Ok(status) => tracing::debug!("language server child exited with {status}"),
                Err(e) => tracing::warn!("failed to reap language server child: {e}"),
            }
        }
    }

    /// Kill and respawn, charging one unit of the restart budget.
    pub async fn restart(&mut self) -> Result<(), SupervisorError> {
        if self.restarts >= self.restart_budget {
            return Err(SupervisorError::RestartExhausted(self.restart_budget));
        }
        self.kill().await;
        self.restarts += 1;
        self.spawn().await
    }

    pub const fn restarts(&self) -> u32 {
        self.restarts
    }

    pub const fn is_spawned(&self) -> bool {
        self.child.is_some()
    }
}
