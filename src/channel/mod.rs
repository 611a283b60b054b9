//! I/O channels owned by a sandbox
//!
//! Descriptor 0 is the stdin writer, 1 and 2 are output readers. The
//! mapping is fixed and the channels exist from the moment the sandbox is
//! built, so the embedder can hold them before `spawn`.

pub mod reader;
pub mod writer;

pub use reader::{OutputReader, PushOutcome, ReadOutcome};
pub use writer::StdinWriter;

pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;
