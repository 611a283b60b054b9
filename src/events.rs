//! Typed event channels
//!
//! Lifecycle events go to per-subscriber unbounded queues, so a subscriber
//! that falls behind still sees every event in engine-report order. Data
//! notices and faults are advisory and use bounded broadcast channels; a
//! slow subscriber there gets `Lagged`. Sending with no subscribers is not
//! an error: an embedder that never listens is simply never told.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::lifecycle::LifecycleEvent;

/// "Child wrote `len` bytes to descriptor `fd`"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNotice {
    pub fd: i32,
    pub len: usize,
}

/// Engine-side contract violations and lossy conditions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "fault")]
pub enum EngineFault {
    /// Data reported on a descriptor with no reader
    UnknownDescriptor { fd: i32 },
    /// Bytes discarded by a `DropNewest` reader
    BytesDropped { fd: i32, count: usize },
}

/// Lossless fan-out: one unbounded queue per subscriber
struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Subscribers<T> {
    fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting the dropped ones
    fn send(&self, value: &T) {
        self.senders.lock().retain(|tx| tx.send(value.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.senders.lock().len()
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.senders.lock().len())
            .finish()
    }
}

/// Event hub for one sandbox
#[derive(Debug)]
pub struct EventHub {
    lifecycle: Subscribers<LifecycleEvent>,
    started: Subscribers<()>,
    exit: Subscribers<i32>,
    signal: Subscribers<i32>,
    new_socket: Subscribers<String>,
    data: broadcast::Sender<DataNotice>,
    faults: broadcast::Sender<EngineFault>,
}

impl EventHub {
    /// `capacity` bounds the advisory data and fault channels only
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lifecycle: Subscribers::new(),
            started: Subscribers::new(),
            exit: Subscribers::new(),
            signal: Subscribers::new(),
            new_socket: Subscribers::new(),
            data: broadcast::channel(capacity).0,
            faults: broadcast::channel(capacity).0,
        }
    }

    /// All lifecycle events, in engine-report order
    pub fn subscribe_lifecycle(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_started(&self) -> mpsc::UnboundedReceiver<()> {
        self.started.subscribe()
    }

    /// Exit statuses
    pub fn subscribe_exit(&self) -> mpsc::UnboundedReceiver<i32> {
        self.exit.subscribe()
    }

    /// Terminating signal numbers
    pub fn subscribe_signal(&self) -> mpsc::UnboundedReceiver<i32> {
        self.signal.subscribe()
    }

    /// Socket paths announced by the child
    pub fn subscribe_new_socket(&self) -> mpsc::UnboundedReceiver<String> {
        self.new_socket.subscribe()
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<DataNotice> {
        self.data.subscribe()
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<EngineFault> {
        self.faults.subscribe()
    }

    /// Live lifecycle subscribers
    pub fn lifecycle_subscribers(&self) -> usize {
        self.lifecycle.len()
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        debug!("Lifecycle event: {:?}", event);
        // Typed channel first so a subscriber woken by the ordered stream
        // can already find the typed event.
        match &event {
            LifecycleEvent::Started => self.started.send(&()),
            LifecycleEvent::NewSocket(path) => self.new_socket.send(path),
            LifecycleEvent::Exit(status) => self.exit.send(status),
            LifecycleEvent::Signal(signal) => self.signal.send(signal),
        }
        self.lifecycle.send(&event);
    }

    pub(crate) fn data(&self, notice: DataNotice) {
        let _ = self.data.send(notice);
    }

    pub(crate) fn fault(&self, fault: EngineFault) {
        let _ = self.faults.send(fault);
    }
}
