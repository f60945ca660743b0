use std::time::SystemTime;
use thiserror::Error;

use super::launcher::{LaunchEvent, Transition};

/// Coarse supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// no child owned
    Idle,
    Starting,
    Running,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(Phase, Phase),
}

pub struct StateMachine {
    pub phase: Phase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        matches!(
            (self.phase, to),
            (Phase::Idle, Phase::Starting)
                | (Phase::Idle, Phase::Running) // adopting a discovered instance
                | (Phase::Starting, Phase::Running)
                | (Phase::Starting, Phase::Idle)
                | (Phase::Running, Phase::Idle)
        )
    }

    pub fn transition(&mut self, to: Phase) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Phase transition: {:?} -> {:?}", self.phase, to);
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.phase, to))
        }
    }
}

/// User-visible status of the proxied app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLabel {
    NotStarted,
    Running(u32),
    Exited(u32),
    ExitedWithError(u32),
    Killed(u32),
    Crashed(u32),
    StartFailed,
}

impl std::fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running(pid) => write!(f, "running (PID={})", pid),
            Self::Exited(pid) => write!(f, "exited (PID={})", pid),
            Self::ExitedWithError(pid) => write!(f, "exited with error (PID={})", pid),
            Self::Killed(pid) => write!(f, "killed (PID={})", pid),
            Self::Crashed(pid) => write!(f, "crashed (PID={})", pid),
            Self::StartFailed => write!(f, "start failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub label: StatusLabel,
    pub since: SystemTime,
}

impl Status {
    fn now(label: StatusLabel) -> Self {
        Self {
            label,
            since: SystemTime::now(),
        }
    }
}

/// The supervisor's single piece of mutable state.
///
/// Invariant: `child_pid != 0` implies `status.label == Running(child_pid)`.
pub struct SupervisorState {
    pub active_app: String,
    /// PID of the owned child (started by us or adopted); 0 = none
    pub child_pid: u32,
    pub status: Status,
    /// args of the instance found running at startup; kept for the session
    pub discovered_args: Option<Vec<String>>,
    /// args the service was started with; sticky for the process lifetime
    pub extra_args: Option<Vec<String>>,
    machine: StateMachine,
    launch_id: u64,
}

impl SupervisorState {
    pub fn new(active_app: impl Into<String>, extra_args: Option<Vec<String>>) -> Self {
        Self {
            active_app: active_app.into(),
            child_pid: 0,
            status: Status::now(StatusLabel::NotStarted),
            discovered_args: None,
            extra_args: extra_args.filter(|a| !a.is_empty()),
            machine: StateMachine::new(),
            launch_id: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase
    }

    /// Enter `Starting` and hand out the id for the next launch.
    pub fn begin_launch(&mut self) -> Result<u64, TransitionError> {
        self.machine.transition(Phase::Starting)?;
        self.launch_id += 1;
        Ok(self.launch_id)
    }

    /// Take ownership of an instance that was already running.
    pub fn adopt(&mut self, pid: u32, args: Vec<String>) -> Result<u64, TransitionError> {
        self.machine.transition(Phase::Running)?;
        self.launch_id += 1;
        self.child_pid = pid;
        self.discovered_args = Some(args).filter(|a| !a.is_empty());
        self.status = Status::now(StatusLabel::Running(pid));
        tracing::info!("Adopted running instance PID {} (launch #{})", pid, self.launch_id);
        Ok(self.launch_id)
    }

    /// Apply a launcher transition. Returns `false` for stale events, i.e.
    /// terminal transitions of a child we no longer own.
    pub fn apply(&mut self, event: &LaunchEvent) -> bool {
        if event.launch_id != self.launch_id {
            tracing::debug!(
                "Ignoring {} for launch #{} (current #{})",
                event.transition,
                event.launch_id,
                self.launch_id
            );
            return false;
        }

        match event.transition {
            Transition::Running => {
                if self.machine.transition(Phase::Running).is_err() {
                    return false;
                }
                self.child_pid = event.pid;
                self.status = Status::now(StatusLabel::Running(event.pid));
            }
            Transition::StartFailed => {
                if self.machine.transition(Phase::Idle).is_err() {
                    return false;
                }
                self.child_pid = 0;
                self.status = Status::now(StatusLabel::StartFailed);
            }
            terminal => {
                if self.child_pid == 0 || self.child_pid != event.pid {
                    return false;
                }
                let label = match terminal {
                    Transition::Exited => StatusLabel::Exited(event.pid),
                    Transition::ExitFailed => StatusLabel::ExitedWithError(event.pid),
                    Transition::Killed => StatusLabel::Killed(event.pid),
                    _ => StatusLabel::Crashed(event.pid),
                };
                if self.machine.transition(Phase::Idle).is_err() {
                    return false;
                }
                self.child_pid = 0;
                self.status = Status::now(label);
            }
        }
        tracing::info!("Status: {}", self.status.label);
        true
    }

    /// Record a confirmed kill of `pid`. No-op if we no longer own it.
    pub fn mark_killed(&mut self, pid: u32) -> bool {
        if pid == 0 || self.child_pid != pid {
            return false;
        }
        if self.machine.transition(Phase::Idle).is_err() {
            return false;
        }
        self.child_pid = 0;
        self.status = Status::now(StatusLabel::Killed(pid));
        tracing::info!("Status: {}", self.status.label);
        true
    }
}
