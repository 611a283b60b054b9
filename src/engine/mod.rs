//! Engine module - Enforcement engine interface
//!
//! The enforcement engine owns the real OS process and applies isolation.
//! This module defines what the control plane needs from it:
//! - `Engine`: spawn / kill / stdin operations driven by the sandbox
//! - `SpawnRequest`: program, arguments and the policy handed over at spawn
//! - `EngineEvent`: raw callbacks, delivered through an `EngineSink`
//!
//! The engine module does NOT:
//! - Define which syscalls or resources are restricted
//! - Buffer child output (the sandbox's readers do that)
//! - Decide what a lifecycle event means for the sandbox state

pub mod native;

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::mapping::FilenameMapping;
use crate::sandbox::EngineSink;

pub use native::NativeEngine;

/// Program specification for a spawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment for the child; None inherits the host environment
    pub env: Option<HashMap<String, String>>,
    /// Working directory, before filename mapping
    pub work_dir: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = Some(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Everything the engine receives at spawn time
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub options: SpawnOptions,
    /// Hook to call for every path the child touches
    pub mapping: FilenameMapping,
    /// Keep crashed children inspectable by a debugger
    pub debug_on_crash: bool,
}

/// Raw event reported by an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Child wrote `bytes` to descriptor `fd`
    Data { fd: i32, bytes: Bytes },
    /// Child exited with `status`
    Exit(i32),
    /// Child was terminated by signal `num`
    Signal(i32),
    /// Child created a socket at `path`
    NewSocket(String),
}

/// Enforcement engine driven by one sandbox.
///
/// Implementations report events through the `EngineSink` passed to
/// `spawn`, from any thread, including from inside `spawn` itself. None of
/// these methods may block on child activity. The sandbox releases the
/// engine while applying the terminating event, so `Drop` must not call
/// back into the sink.
pub trait Engine: Send + Sync {
    /// Start the child. Called at most once per engine.
    fn spawn(&self, request: SpawnRequest, sink: EngineSink) -> Result<(), EngineError>;

    /// Request termination. Must be idempotent.
    fn kill(&self);

    /// Queue bytes for the child's stdin
    fn write_stdin(&self, bytes: Bytes) -> Result<(), EngineError>;

    /// Close the child's stdin
    fn close_stdin(&self);
}
