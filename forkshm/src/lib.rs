//! Fork-aware shared-memory channels and process workers.
//!
//! A [`Channel`] is created in a parent process, survives `fork()` through the
//! [`Registry`], and then carries bytes or serde values between the processes
//! that hold it. [`Thread`] and [`Generator`] build one-shot and step-wise
//! workers on top of it.

#[cfg(not(unix))]
compile_error!("forkshm only supports unix targets");

#[cfg(not(target_has_atomic = "32"))]
compile_error!("forkshm needs native 32-bit atomics for its cross-process reference counts");

pub mod channel;
pub mod codec;
pub mod config;
pub mod core;
pub mod errors;
pub mod registry;
pub mod ring;
pub mod worker;

#[cfg(test)]
mod tests;

pub use crate::channel::Channel;
pub use crate::codec::{Codec, PostcardCodec, WIRE_VERSION};
pub use crate::config::{ChannelConfig, ChannelConfigBuilder, WorkerConfig};
pub use crate::core::buffer::{BufferKind, ScopedBuffer};
pub use crate::core::region::SharedRegion;
pub use crate::core::{timestamp, timestamp_serialized};
pub use crate::errors::{Result, ShmemError};
pub use crate::registry::{fork_with, Fork, Forkable, Pid, Registry};
pub use crate::ring::{LockKind, RingBuffer, RingStatus};
pub use crate::worker::{Generator, Globals, RemoteError, Thread};
