//! Sandbox module - Control plane for one isolated child
//!
//! This module is responsible for:
//! - Driving the engine through spawn and kill
//! - Tracking the lifecycle state and publishing lifecycle events
//! - Routing engine output to the stdout/stderr readers
//! - Handing the filename mapping and crash-debug flag to the engine
//!
//! The sandbox module does NOT:
//! - Own the OS process (the engine does)
//! - Interpret child output
//! - Retry a failed spawn

mod dispatch;

pub use dispatch::EngineSink;
pub(crate) use dispatch::Shared;

use std::sync::Arc;
use tracing::{debug, info};

use crate::channel::{OutputReader, StdinWriter};
use crate::config::{get_config, SandboxConfig};
use crate::engine::{Engine, SpawnOptions, SpawnRequest};
use crate::error::{EngineError, SandboxError, SandboxResult};
use crate::events::EventHub;
use crate::lifecycle::{LifecycleEvent, LifecycleState, Termination};

/// One sandboxed child and its channels
pub struct Sandbox {
    shared: Arc<Shared>,
    stdin: StdinWriter,
    working_dir: Option<std::path::PathBuf>,
}

impl Sandbox {
    /// Create an idle sandbox using the process-wide configuration
    pub fn new(engine: impl Engine + 'static) -> Self {
        Self::with_config(engine, get_config())
    }

    pub fn with_config(engine: impl Engine + 'static, config: &SandboxConfig) -> Self {
        let shared = Arc::new(Shared::new(Arc::new(engine), config));
        let stdin = StdinWriter::new(Arc::downgrade(&shared));
        Self {
            shared,
            stdin,
            working_dir: config.working_dir.clone(),
        }
    }

    /// Writer for fd 0
    pub fn stdin(&self) -> &StdinWriter {
        &self.stdin
    }

    /// Reader for fd 1
    pub fn stdout(&self) -> &OutputReader {
        &self.shared.stdout
    }

    /// Reader for fd 2
    pub fn stderr(&self) -> &OutputReader {
        &self.shared.stderr
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Start `program` with `args` in the sandbox
    pub fn spawn<I, S>(&self, program: impl Into<String>, args: I) -> SandboxResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spawn_with(SpawnOptions::new(program).with_args(args))
    }

    /// Start a program described by `options`.
    ///
    /// Valid only while idle. Events the engine reports before this returns
    /// are delivered after `Started`.
    pub fn spawn_with(&self, mut options: SpawnOptions) -> SandboxResult<()> {
        self.shared.core.lock().state.begin_spawn()?;
        self.shared.publish(LifecycleState::Spawning);

        if options.work_dir.is_none() {
            options.work_dir = self.working_dir.clone();
        }
        info!("Spawning sandboxed program: {:?}", options.to_vec());

        let request = SpawnRequest {
            options,
            mapping: self.shared.mapping.clone(),
            debug_on_crash: self.shared.debug_on_crash(),
        };
        let result = match self.shared.engine() {
            Some(engine) => engine.spawn(request, EngineSink::new(&self.shared)),
            None => Err(EngineError::NotRunning),
        };

        let mut core = self.shared.core.lock();
        match result {
            Ok(()) => {
                core.state.finish_spawn();
                self.shared.publish(core.state);
                self.shared.events.emit(LifecycleEvent::Started);

                let pending = std::mem::take(&mut core.pending);
                if !pending.is_empty() {
                    debug!("Replaying {} events reported during spawn", pending.len());
                }
                for event in pending {
                    // Descriptors were checked when the events were queued
                    let _ = self.shared.apply(&mut core, event);
                }
                Ok(())
            }
            Err(e) => {
                core.state.fail_spawn();
                core.pending.clear();
                self.shared.publish(core.state);
                drop(core);

                info!("Failed to spawn sandboxed program: {}", e);
                self.shared.release();
                Err(SandboxError::Spawn(e))
            }
        }
    }

    /// Ask the engine to terminate the child.
    ///
    /// No-op once terminated; `InvalidState` before the child is running.
    pub fn kill(&self) -> SandboxResult<()> {
        if !self.shared.state().check_kill()? {
            debug!("Kill requested after termination, ignoring");
            return Ok(());
        }

        if let Some(engine) = self.shared.engine() {
            debug!("Forwarding kill to engine");
            engine.kill();
        }
        Ok(())
    }

    /// Install a new filename mapping, used from the engine's next lookup on
    pub fn set_filename_mapping(&self, f: impl Fn(&str) -> String + Send + Sync + 'static) {
        self.shared.mapping.replace(f);
    }

    pub fn reset_filename_mapping(&self) {
        self.shared.mapping.reset();
    }

    /// Takes effect on the next spawn
    pub fn set_debug_on_crash(&self, value: bool) {
        self.shared.set_debug_on_crash(value);
    }

    pub fn debug_on_crash(&self) -> bool {
        self.shared.debug_on_crash()
    }

    /// Wait until the sandbox has terminated. Never resolves for a sandbox
    /// that is never spawned.
    pub async fn wait(&self) -> Termination {
        let mut rx = self.shared.subscribe_state();
        let termination = match rx.wait_for(LifecycleState::is_terminated).await {
            Ok(state) => state.termination(),
            // Sender lives in `self.shared`
            Err(_) => self.state().termination(),
        };
        termination.unwrap_or(Termination::SpawnFailed)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("state", &self.state())
            .field("stdout", &self.shared.stdout)
            .field("stderr", &self.shared.stderr)
            .finish()
    }
}
