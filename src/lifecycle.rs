//! Sandbox lifecycle state machine
//!
//! `Idle -> Spawning -> Running -> Terminated`, never backwards. The
//! transitions here are pure; the sandbox applies them under its dispatch
//! lock and takes care of emitting events.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SandboxError, SandboxResult};

/// How a sandboxed child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum Termination {
    /// Child exited with the given status
    Exited(i32),
    /// Child was terminated by the given signal
    Signaled(i32),
    /// Engine could not start the child
    SpawnFailed,
}

impl Termination {
    /// Conventional shell exit code for this termination
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited(status) => *status,
            Termination::Signaled(signal) => 128 + signal,
            Termination::SpawnFailed => 127,
        }
    }

    /// Lifecycle event announcing this termination, if the child ever ran
    pub fn event(&self) -> Option<LifecycleEvent> {
        match self {
            Termination::Exited(status) => Some(LifecycleEvent::Exit(*status)),
            Termination::Signaled(signal) => Some(LifecycleEvent::Signal(*signal)),
            Termination::SpawnFailed => None,
        }
    }
}

/// Current lifecycle state of a sandbox
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "termination")]
pub enum LifecycleState {
    #[default]
    Idle,
    /// Engine spawn call in progress
    Spawning,
    Running,
    Terminated(Termination),
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Spawning => "spawning",
            LifecycleState::Running => "running",
            LifecycleState::Terminated(_) => "terminated",
        };
        write!(f, "{}", s)
    }
}

impl LifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, LifecycleState::Terminated(_))
    }

    /// How the child ended, once terminated
    pub fn termination(&self) -> Option<Termination> {
        match self {
            LifecycleState::Terminated(t) => Some(*t),
            _ => None,
        }
    }

    /// `Idle -> Spawning`
    pub(crate) fn begin_spawn(&mut self) -> SandboxResult<()> {
        match self {
            LifecycleState::Idle => {
                *self = LifecycleState::Spawning;
                Ok(())
            }
            state => Err(SandboxError::InvalidState {
                operation: "spawn",
                state: *state,
            }),
        }
    }

    /// `Spawning -> Running`
    pub(crate) fn finish_spawn(&mut self) {
        debug_assert_eq!(*self, LifecycleState::Spawning);
        *self = LifecycleState::Running;
    }

    /// `Spawning -> Terminated(SpawnFailed)`
    pub(crate) fn fail_spawn(&mut self) {
        debug_assert_eq!(*self, LifecycleState::Spawning);
        *self = LifecycleState::Terminated(Termination::SpawnFailed);
    }

    /// `Running -> Terminated`. Returns false (and changes nothing) unless
    /// the sandbox was running, so only the first exit or signal counts.
    pub(crate) fn terminate(&mut self, termination: Termination) -> bool {
        if self.is_running() {
            *self = LifecycleState::Terminated(termination);
            true
        } else {
            false
        }
    }

    /// Whether a kill request should reach the engine.
    ///
    /// Killing a terminated sandbox is a no-op since termination may race
    /// with the caller; killing one that never started is an error.
    pub(crate) fn check_kill(&self) -> SandboxResult<bool> {
        match self {
            LifecycleState::Running => Ok(true),
            LifecycleState::Terminated(_) => Ok(false),
            state => Err(SandboxError::InvalidState {
                operation: "kill",
                state: *state,
            }),
        }
    }
}

/// Lifecycle event delivered to the embedder, in engine-report order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "value")]
pub enum LifecycleEvent {
    Started,
    /// Child announced a socket at this path
    NewSocket(String),
    Exit(i32),
    Signal(i32),
}
