//! Tracks every live region handle of a process so that `fork()` and fast
//! process exit keep the shared reference counts right.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::region::{RawRegion, SharedRegion};
use crate::errors::{Result, ShmemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(libc::pid_t);

impl Pid {
    pub fn as_raw(&self) -> libc::pid_t {
        self.0
    }

    pub fn current() -> Self {
        // SAFETY: getpid has no preconditions.
        Pid(unsafe { libc::getpid() })
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(Pid),
    Child,
}

pub(crate) mod sealed {
    pub trait Sealed {}

    /// Only this crate can name the token, so only this crate can reach the
    /// region behind a [`super::Forkable`].
    pub struct Token(pub(crate) ());
}

/// Handles that [`fork_with`] can prepare for a fork.
pub trait Forkable: sealed::Sealed {
    #[doc(hidden)]
    fn shared_region(&self, token: sealed::Token) -> &SharedRegion;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    live: HashMap<HandleId, RawRegion>,
    disposed: HashSet<HandleId>,
}

/// The set of live handles of one process.
///
/// Cloning a registry shares it. Independent registries may coexist; each
/// only forks and disposes the handles created through it.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Handle bookkeeping must keep working while the process unwinds, so a
    // poisoned registry is still used.
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, raw: RawRegion, retain: bool) -> HandleId {
        let mut inner = self.inner();
        if retain {
            // SAFETY: the caller holds a live handle to the same region.
            unsafe { raw.retain() };
        }
        inner.next_id += 1;
        let id = HandleId(inner.next_id);
        inner.live.insert(id, raw);
        id
    }

    pub(crate) fn detach(&self, id: HandleId) {
        let mut inner = self.inner();
        match inner.live.remove(&id) {
            // SAFETY: removal from `live` guarantees one release per handle.
            Some(raw) => unsafe { raw.release() },
            None => {
                inner.disposed.remove(&id);
            }
        }
    }

    /// Number of handles not yet released.
    pub fn live_handles(&self) -> usize {
        self.inner().live.len()
    }

    /// Number of distinct regions behind the live handles.
    pub fn live_regions(&self) -> usize {
        let inner = self.inner();
        let keys: HashSet<usize> = inner.live.values().map(RawRegion::key).collect();
        keys.len()
    }

    /// Forks the process after counting every live handle into the global
    /// counts of their regions.
    ///
    /// The registry stays locked across the fork, so no handle can be created
    /// or released halfway through.
    pub fn fork(&self) -> Result<Fork> {
        let inner = self.inner.lock()?;
        let mut seen = HashSet::new();
        let regions: Vec<RawRegion> = inner
            .live
            .values()
            .filter(|raw| seen.insert(raw.key()))
            .copied()
            .collect();
        let fork = fork_regions(&regions)?;
        drop(inner);
        if let Fork::Parent(child) = fork {
            tracing::debug!(%child, regions = regions.len(), "forked");
        }
        Ok(fork)
    }

    /// Releases every live handle and remembers them, so that dropping one of
    /// them later does nothing. Returns the number released.
    pub(crate) fn dispose_all(&self) -> usize {
        let mut inner = self.inner();
        let live: Vec<(HandleId, RawRegion)> = inner.live.drain().collect();
        for (id, raw) in &live {
            // SAFETY: drained from `live`, so released exactly once.
            unsafe { raw.release() };
            inner.disposed.insert(*id);
        }
        live.len()
    }

    /// Releases every live handle, then ends the process without running
    /// destructors or `atexit` handlers.
    pub fn exit(&self, status: i32) -> ! {
        let released = self.dispose_all();
        tracing::debug!(pid = %Pid::current(), status, released, "exiting");
        // SAFETY: _exit never returns and touches no Rust state.
        unsafe { libc::_exit(status) }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Registry")
            .field("live", &inner.live.len())
            .field("disposed", &inner.disposed.len())
            .finish()
    }
}

/// Forks after preparing only the given handles.
///
/// Other handles the process holds are not counted for the child, so the
/// child must not release them; exiting through [`Registry::exit`] of a
/// registry that owns them would.
pub fn fork_with(handles: &[&dyn Forkable]) -> Result<Fork> {
    let mut seen = HashSet::new();
    let regions: Vec<RawRegion> = handles
        .iter()
        .map(|h| h.shared_region(sealed::Token(())))
        .filter(|region| !region.is_disposed())
        .map(|region| *region.raw())
        .filter(|raw| seen.insert(raw.key()))
        .collect();
    fork_regions(&regions)
}

fn fork_regions(regions: &[RawRegion]) -> Result<Fork> {
    // SAFETY: every region is held by a live handle, and the counts added
    // here are either inherited by the child or undone below.
    let added: Vec<u32> = regions.iter().map(|raw| unsafe { raw.prepare_fork() }).collect();
    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            for (raw, n) in regions.iter().zip(added) {
                unsafe { raw.cancel_fork(n) };
            }
            Err(ShmemError::Io(err))
        }
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(Pid(pid))),
    }
}
