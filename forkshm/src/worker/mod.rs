//! Work run in a forked child, with its result, failure, or state changes
//! shipped back over a [`Channel`](crate::Channel).

mod generator;
mod outcome;
pub(crate) mod process;
mod thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::generator::Generator;
pub use self::outcome::{RemoteError, PANIC_CATEGORY};
pub use self::thread::Thread;
use crate::codec::{Codec, PostcardCodec};
use crate::errors::{Result, ShmemError};
use crate::registry::Pid;

/// Hooks that copy part of a worker's state out of the child and fold it
/// into the parent's copy after the join.
pub struct Globals<S> {
    extract: Box<dyn Fn(&S) -> Result<Vec<u8>>>,
    merge: Box<dyn FnMut(&mut S, &[u8]) -> Result<()>>,
}

impl<S> Globals<S> {
    pub fn new<G, X, M>(extract: X, mut merge: M) -> Self
    where
        G: Serialize + DeserializeOwned,
        X: Fn(&S) -> G + 'static,
        M: FnMut(&mut S, G) + 'static,
    {
        Globals {
            extract: Box::new(move |state: &S| PostcardCodec.encode(&extract(state))),
            merge: Box::new(move |state: &mut S, bytes: &[u8]| {
                merge(state, PostcardCodec.decode(bytes)?);
                Ok(())
            }),
        }
    }

    pub(crate) fn extract(&self, state: &S) -> Result<Vec<u8>> {
        (self.extract)(state)
    }

    pub(crate) fn merge(&mut self, state: &mut S, bytes: &[u8]) -> Result<()> {
        (self.merge)(state, bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Running(Pid),
    /// Inside the forked child.
    Child,
    Joined { pid: Pid, status: i32 },
}

impl Phase {
    pub(crate) fn ensure_created(&self) -> Result<()> {
        match self {
            Phase::Created => Ok(()),
            Phase::Child => Err(ShmemError::Lifecycle("called from the worker process")),
            _ => Err(ShmemError::Lifecycle("worker already started")),
        }
    }

    pub(crate) fn running(&self) -> Result<Pid> {
        match self {
            Phase::Running(pid) => Ok(*pid),
            Phase::Created => Err(ShmemError::Lifecycle("worker not started")),
            Phase::Child => Err(ShmemError::Lifecycle("called from the worker process")),
            Phase::Joined { .. } => Err(ShmemError::Lifecycle("worker already joined")),
        }
    }

    pub(crate) fn joined(&self) -> Result<(Pid, i32)> {
        match self {
            Phase::Joined { pid, status } => Ok((*pid, *status)),
            Phase::Created => Err(ShmemError::Lifecycle("worker not started")),
            Phase::Running(_) => Err(ShmemError::Lifecycle("worker not joined")),
            Phase::Child => Err(ShmemError::Lifecycle("called from the worker process")),
        }
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        match self {
            Phase::Running(pid) | Phase::Joined { pid, .. } => Some(*pid),
            Phase::Created | Phase::Child => None,
        }
    }
}
