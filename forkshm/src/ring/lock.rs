use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemError};

/// How a ring buffer serializes access between processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Test-and-set on a flag in shared memory.
    #[default]
    Spin,
    /// A process-shared pthread mutex.
    Mutex,
}

pub(crate) enum RingLock {
    Spin,
    Mutex(Box<dyn LockImpl>),
}

pub(crate) enum RingGuard<'a> {
    Spin(&'a AtomicBool),
    Mutex(LockGuard<'a>),
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        if let RingGuard::Spin(flag) = self {
            flag.store(false, Ordering::Release);
        }
    }
}

impl RingLock {
    /// Bytes the mutex needs in the control area.
    pub(crate) fn mutex_len() -> usize {
        Mutex::size_of(None)
    }

    /// Initializes the lock in fresh shared memory at `mem`.
    ///
    /// # Safety
    /// `mem` must point at [`RingLock::mutex_len`] writable shared bytes.
    pub(crate) unsafe fn init(kind: LockKind, mem: *mut u8) -> Result<Self> {
        match kind {
            LockKind::Spin => Ok(RingLock::Spin),
            LockKind::Mutex => {
                let (mutex, _) = Mutex::new(mem, mem).map_err(ShmemError::lock)?;
                Ok(RingLock::Mutex(mutex))
            }
        }
    }

    /// Opens a lock another handle initialized at `mem`.
    ///
    /// # Safety
    /// `mem` must hold a lock initialized by [`RingLock::init`] with `kind`.
    pub(crate) unsafe fn attach(kind: LockKind, mem: *mut u8) -> Result<Self> {
        match kind {
            LockKind::Spin => Ok(RingLock::Spin),
            LockKind::Mutex => {
                let (mutex, _) = Mutex::from_existing(mem, mem).map_err(ShmemError::lock)?;
                Ok(RingLock::Mutex(mutex))
            }
        }
    }

    pub(crate) fn acquire<'a>(&'a self, spin: &'a AtomicBool) -> Result<RingGuard<'a>> {
        match self {
            RingLock::Spin => {
                while spin.swap(true, Ordering::Acquire) {
                    while spin.load(Ordering::Relaxed) {
                        hint::spin_loop();
                    }
                }
                Ok(RingGuard::Spin(spin))
            }
            RingLock::Mutex(mutex) => Ok(RingGuard::Mutex(mutex.lock().map_err(ShmemError::lock)?)),
        }
    }
}
