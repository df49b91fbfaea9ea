//! Adapters for the remoting engine.
//!
//! Infrastructure the engine runs on: worker pools, the reference frame codec
//! and an in-process transport.

pub mod codec;
pub mod executor;
pub mod memory;

pub use codec::{CodecError, FrameCodec};
pub use executor::{ExecutorError, WorkerPool};
pub use memory::{MemoryNetwork, MemoryTransport};
