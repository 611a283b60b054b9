//! Error types for the sandbox control plane
//!
//! `SandboxError` is what the embedder sees; `EngineError` is what an
//! enforcement engine reports back when it cannot do what it was asked.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Result alias for control-plane operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors surfaced by the sandbox control plane
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Operation not valid in the current lifecycle state (e.g. double spawn)
    #[error("cannot {operation} while sandbox is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Engine reported I/O on a descriptor that has no reader
    #[error("engine reported data on unknown descriptor {0}")]
    UnknownDescriptor(i32),

    /// Write to a channel whose child end is gone
    #[error("channel is closed")]
    ClosedChannel,

    /// Engine failed to start the child
    #[error("failed to spawn sandboxed program: {0}")]
    Spawn(#[source] EngineError),
}

/// Errors reported by an enforcement engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Spawn(String),

    #[error("no child process is running")]
    NotRunning,

    #[error("engine requires a tokio runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = SandboxError::InvalidState {
            operation: "spawn",
            state: LifecycleState::Running,
        };
        assert_eq!(err.to_string(), "cannot spawn while sandbox is running");
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = SandboxError::Spawn(EngineError::Spawn("no such file".into()));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no such file"));
    }
}
