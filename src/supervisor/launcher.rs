//! Child process launcher.
//!
//! `start` spawns the executable and returns its PID (the entry
//! transition, `running`) or the spawn error (`start_failed`). A
//! background waiter then reports exactly one terminal transition
//! (`exited`, `exit_failed`, `killed` or `crashed`) as a [`LaunchEvent`]
//! on the supervisor's event channel.

use std::process::{ExitStatus, Stdio};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;

/// Lifecycle transitions of a launched child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    StartFailed,
    Running,
    /// exit code 0
    Exited,
    /// non-zero exit code
    ExitFailed,
    /// terminated by a signal
    Killed,
    /// anything outside the exit/signal taxonomy
    Crashed,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartFailed => "start_failed",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::ExitFailed => "exit_failed",
            Self::Killed => "killed",
            Self::Crashed => "crashed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::ExitFailed | Self::Killed | Self::Crashed)
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition of the child started under `launch_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEvent {
    pub launch_id: u64,
    /// 0 for `start_failed`
    pub pid: u32,
    pub transition: Transition,
    pub cause: Option<String>,
}

impl LaunchEvent {
    pub fn running(launch_id: u64, pid: u32) -> Self {
        Self {
            launch_id,
            pid,
            transition: Transition::Running,
            cause: None,
        }
    }

    pub fn start_failed(launch_id: u64, cause: impl Into<String>) -> Self {
        Self {
            launch_id,
            pid: 0,
            transition: Transition::StartFailed,
            cause: Some(cause.into()),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to spawn '{path}': {reason}")]
pub struct LaunchError {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Launcher;

impl Launcher {
    pub fn new() -> Self {
        Self
    }

    /// Spawn `path args...`. Must be called inside a tokio runtime.
    ///
    /// The child inherits stdout/stderr so its console output stays
    /// visible next to the service log; stdin is closed.
    pub fn start(
        &self,
        path: &str,
        args: &[String],
        launch_id: u64,
        events: mpsc::UnboundedSender<LaunchEvent>,
    ) -> Result<u32, LaunchError> {
        let mut cmd = TokioCommand::new(path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| LaunchError {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| LaunchError {
            path: path.to_string(),
            reason: "spawned process has no pid".into(),
        })?;
        tracing::info!("Started '{}' {:?} (PID {}, launch #{})", path, args, pid, launch_id);

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let (transition, cause) = match child.wait().await {
                Ok(status) => (classify(&status), describe(&status)),
                Err(e) => (Transition::Crashed, Some(format!("failed to wait for process: {}", e))),
            };
            tracing::info!(
                "Process {} (launch #{}) {}{}",
                pid,
                launch_id,
                transition,
                cause.as_deref().map(|c| format!(": {}", c)).unwrap_or_default()
            );
            let _ = events.send(LaunchEvent {
                launch_id,
                pid,
                transition,
                cause,
            });
        });

        Ok(pid)
    }
}

/// Map an exit status onto the terminal transitions.
pub fn classify(status: &ExitStatus) -> Transition {
    if status.success() {
        return Transition::Exited;
    }
    if status.code().is_some() {
        return Transition::ExitFailed;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal().is_some() {
            return Transition::Killed;
        }
    }
    Transition::Crashed
}

fn describe(status: &ExitStatus) -> Option<String> {
    (!status.success()).then(|| status.to_string())
}
