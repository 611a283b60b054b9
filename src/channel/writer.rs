//! Stdin writer channel
//!
//! Pass-through to the engine's stdin. No buffering: every write is handed
//! to the engine immediately, which queues it for the child.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::Shared;

/// Writable end of the child's stdin
#[derive(Clone)]
pub struct StdinWriter {
    shared: Weak<Shared>,
    ended: Arc<AtomicBool>,
}

impl StdinWriter {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self {
            shared,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Forward bytes to the child's stdin.
    ///
    /// Fails with `ClosedChannel` once the sandbox has terminated or the
    /// writer was ended, and with `InvalidState` before the child is running.
    pub fn write(&self, bytes: impl Into<Bytes>) -> SandboxResult<usize> {
        if self.ended.load(Ordering::Acquire) {
            return Err(SandboxError::ClosedChannel);
        }

        let shared = self.shared.upgrade().ok_or(SandboxError::ClosedChannel)?;
        let engine = shared.running_engine("write to stdin")?;

        let bytes = bytes.into();
        let len = bytes.len();
        engine.write_stdin(bytes).map_err(|e| {
            debug!("Engine refused stdin write: {}", e);
            SandboxError::ClosedChannel
        })?;

        Ok(len)
    }

    /// Close the child's stdin. Idempotent; a no-op after termination.
    pub fn end(&self) -> SandboxResult<()> {
        if self.ended.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(shared) = self.shared.upgrade() else {
            self.ended.store(true, Ordering::Release);
            return Ok(());
        };

        match shared.running_engine("close stdin") {
            Ok(engine) => {
                self.ended.store(true, Ordering::Release);
                engine.close_stdin();
                Ok(())
            }
            Err(SandboxError::ClosedChannel) => {
                self.ended.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// True once `end` succeeded or the sandbox is gone
    pub fn is_closed(&self) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return true;
        }
        match self.shared.upgrade() {
            Some(shared) => shared.state().is_terminated(),
            None => true,
        }
    }
}
