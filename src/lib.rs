//! Control plane for a sandboxed child process
//!
//! A [`Sandbox`] drives an enforcement [`Engine`] that owns the real OS
//! process. The sandbox tracks the child's lifecycle, exposes its standard
//! I/O as channels, publishes lifecycle events in the order the engine
//! reported them, and lets the embedder remap every path the child sees.
//!
//! Module layout:
//! - `lifecycle`: state machine and lifecycle events
//! - `channel`: stdin writer and stdout/stderr readers
//! - `events`: typed broadcast channels
//! - `mapping`: filename mapping hook
//! - `engine`: engine trait and the native reference engine
//! - `sandbox`: the control plane tying them together
//! - `config`: configuration from env, TOML or code

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod mapping;
pub mod sandbox;

pub use channel::{OutputReader, ReadOutcome, StdinWriter};
pub use config::{get_config, init_config, BufferPolicy, Limits, SandboxConfig};
pub use engine::{Engine, EngineEvent, NativeEngine, SpawnOptions, SpawnRequest};
pub use error::{EngineError, SandboxError, SandboxResult};
pub use events::{DataNotice, EngineFault, EventHub};
pub use lifecycle::{LifecycleEvent, LifecycleState, Termination};
pub use mapping::FilenameMapping;
pub use sandbox::{EngineSink, Sandbox};
