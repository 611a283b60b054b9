//! Engine event dispatch
//!
//! Every engine callback enters through an `EngineSink` and is applied under
//! the sandbox's dispatch lock, one event at a time, in arrival order.
//! Events that arrive while `spawn` is still talking to the engine are
//! queued and replayed right after `Started`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{OutputReader, PushOutcome, STDERR_FD, STDOUT_FD};
use crate::config::SandboxConfig;
use crate::engine::{Engine, EngineEvent};
use crate::error::{SandboxError, SandboxResult};
use crate::events::{DataNotice, EngineFault, EventHub};
use crate::lifecycle::{LifecycleEvent, LifecycleState, Termination};
use crate::mapping::FilenameMapping;

/// State guarded by the dispatch lock
pub(crate) struct Core {
    pub(crate) state: LifecycleState,
    /// Engine events received while spawning
    pub(crate) pending: Vec<EngineEvent>,
}

/// State shared between the embedder-facing sandbox and the engine sink
pub(crate) struct Shared {
    pub(crate) core: Mutex<Core>,
    state_tx: watch::Sender<LifecycleState>,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    pub(crate) stdout: OutputReader,
    pub(crate) stderr: OutputReader,
    pub(crate) events: EventHub,
    pub(crate) mapping: FilenameMapping,
    debug_on_crash: AtomicBool,
}

impl Shared {
    pub(crate) fn new(engine: Arc<dyn Engine>, config: &SandboxConfig) -> Self {
        Self {
            core: Mutex::new(Core {
                state: LifecycleState::Idle,
                pending: Vec::new(),
            }),
            state_tx: watch::Sender::new(LifecycleState::Idle),
            engine: Mutex::new(Some(engine)),
            stdout: OutputReader::new(STDOUT_FD, config.output_buffer, config.high_water_mark),
            stderr: OutputReader::new(STDERR_FD, config.output_buffer, config.high_water_mark),
            events: EventHub::new(config.event_capacity),
            mapping: FilenameMapping::identity(),
            debug_on_crash: AtomicBool::new(config.debug_on_crash),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.core.lock().state
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn debug_on_crash(&self) -> bool {
        self.debug_on_crash.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug_on_crash(&self, value: bool) {
        self.debug_on_crash.store(value, Ordering::Relaxed);
    }

    /// Engine handle, while it has not been released
    pub(crate) fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine.lock().clone()
    }

    /// Engine handle for an operation that needs a running child.
    ///
    /// `ClosedChannel` after termination, `InvalidState` before the child runs.
    pub(crate) fn running_engine(&self, operation: &'static str) -> SandboxResult<Arc<dyn Engine>> {
        let core = self.core.lock();
        match core.state {
            LifecycleState::Running => self.engine().ok_or(SandboxError::ClosedChannel),
            LifecycleState::Terminated(_) => Err(SandboxError::ClosedChannel),
            state => Err(SandboxError::InvalidState { operation, state }),
        }
    }

    pub(crate) fn publish(&self, state: LifecycleState) {
        self.state_tx.send_replace(state);
    }

    fn reader(&self, fd: i32) -> SandboxResult<&OutputReader> {
        match fd {
            STDOUT_FD => Ok(&self.stdout),
            STDERR_FD => Ok(&self.stderr),
            other => {
                warn!("Engine reported data on unknown descriptor {}", other);
                self.events.fault(EngineFault::UnknownDescriptor { fd: other });
                Err(SandboxError::UnknownDescriptor(other))
            }
        }
    }

    /// Close both readers and drop the engine handle. Runs once per sandbox,
    /// from whichever transition reached `Terminated`.
    pub(crate) fn release(&self) {
        self.stdout.close();
        self.stderr.close();
        let released = self.engine.lock().take();
        if released.is_some() {
            debug!("Released engine handle");
        }
    }

    /// Route one event. Queues while spawning; applies otherwise.
    pub(crate) fn dispatch(&self, event: EngineEvent) -> SandboxResult<bool> {
        let mut core = self.core.lock();
        if core.state == LifecycleState::Spawning {
            if let EngineEvent::Data { fd, .. } = &event {
                self.reader(*fd)?;
            }
            core.pending.push(event);
            return Ok(true);
        }
        self.apply(&mut core, event)
    }

    /// Apply one event with the dispatch lock held
    pub(crate) fn apply(&self, core: &mut Core, event: EngineEvent) -> SandboxResult<bool> {
        match event {
            EngineEvent::Data { fd, bytes } => self.route_data(fd, bytes),
            EngineEvent::Exit(status) => {
                self.terminate(core, Termination::Exited(status));
                Ok(false)
            }
            EngineEvent::Signal(signal) => {
                self.terminate(core, Termination::Signaled(signal));
                Ok(false)
            }
            EngineEvent::NewSocket(path) => {
                if core.state.is_running() {
                    self.events.emit(LifecycleEvent::NewSocket(path));
                } else {
                    debug!("Dropping socket announcement {:?}: sandbox is {}", path, core.state);
                }
                Ok(false)
            }
        }
    }

    fn route_data(&self, fd: i32, bytes: Bytes) -> SandboxResult<bool> {
        let reader = self.reader(fd)?;
        let len = bytes.len();

        match reader.push(bytes) {
            PushOutcome::Buffered { ready_for_more } => {
                if len > 0 {
                    self.events.data(DataNotice { fd, len });
                }
                Ok(ready_for_more)
            }
            PushOutcome::Truncated { accepted, dropped } => {
                warn!("Reader for fd {} is full, dropped {} bytes", fd, dropped);
                self.events.fault(EngineFault::BytesDropped { fd, count: dropped });
                if accepted > 0 {
                    self.events.data(DataNotice { fd, len: accepted });
                }
                Ok(false)
            }
            PushOutcome::Closed => {
                debug!("Dropping {} bytes for fd {}: reader closed", len, fd);
                Ok(false)
            }
        }
    }

    fn terminate(&self, core: &mut Core, termination: Termination) {
        if !core.state.terminate(termination) {
            debug!("Dropping {:?}: sandbox is {}", termination, core.state);
            return;
        }

        info!("Sandboxed program terminated: {:?}", termination);
        self.publish(core.state);
        if let Some(event) = termination.event() {
            self.events.emit(event);
        }
        self.release();
    }
}

/// Handle through which an engine reports events into a sandbox.
///
/// Holds the sandbox weakly: once the sandbox is dropped, reports are
/// discarded.
#[derive(Clone)]
pub struct EngineSink {
    shared: Weak<Shared>,
}

impl EngineSink {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// Report child output on `fd`.
    ///
    /// Returns whether the reader wants more (advisory), or
    /// `UnknownDescriptor` if `fd` is not 1 or 2.
    pub fn data(&self, fd: i32, bytes: impl Into<Bytes>) -> SandboxResult<bool> {
        self.deliver(EngineEvent::Data {
            fd,
            bytes: bytes.into(),
        })
    }

    pub fn exit(&self, status: i32) {
        let _ = self.deliver(EngineEvent::Exit(status));
    }

    pub fn signal(&self, signal: i32) {
        let _ = self.deliver(EngineEvent::Signal(signal));
    }

    pub fn new_socket(&self, path: impl Into<String>) {
        let _ = self.deliver(EngineEvent::NewSocket(path.into()));
    }

    /// Apply a raw event
    pub fn deliver(&self, event: EngineEvent) -> SandboxResult<bool> {
        match self.shared.upgrade() {
            Some(shared) => shared.dispatch(event),
            None => {
                debug!("Dropping {:?}: sandbox is gone", event);
                Ok(false)
            }
        }
    }

    /// Wait until the reader for `fd` accepts more data. Only a `Suspend`
    /// buffer policy ever makes this wait.
    pub async fn wait_writable(&self, fd: i32) -> SandboxResult<()> {
        let reader = match self.shared.upgrade() {
            Some(shared) => shared.reader(fd)?.clone(),
            None => return Ok(()),
        };
        reader.wait_writable().await;
        Ok(())
    }

    /// Whether the sandbox still exists
    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }
}
