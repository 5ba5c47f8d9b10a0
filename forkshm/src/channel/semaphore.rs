use std::io;
use std::mem;
use std::ptr::NonNull;

use crate::errors::{Result, ShmemError};

pub(crate) const SEMAPHORE_LEN: usize = mem::size_of::<libc::sem_t>();

/// An unnamed POSIX semaphore placed in shared memory, counting unread
/// messages across processes.
#[derive(Clone, Copy)]
pub(crate) struct Semaphore {
    sem: NonNull<libc::sem_t>,
}

impl Semaphore {
    /// # Safety
    /// `mem` must point at [`SEMAPHORE_LEN`] suitably aligned shared bytes
    /// that hold no live semaphore.
    pub(crate) unsafe fn init(mem: *mut u8) -> Result<Self> {
        let sem = NonNull::new(mem.cast::<libc::sem_t>())
            .ok_or_else(|| ShmemError::Logic("null semaphore address".to_string()))?;
        if libc::sem_init(sem.as_ptr(), 1, 0) != 0 {
            return Err(ShmemError::last_os_error());
        }
        Ok(Semaphore { sem })
    }

    /// # Safety
    /// `mem` must hold a semaphore created by [`Semaphore::init`].
    pub(crate) unsafe fn attach(mem: *mut u8) -> Result<Self> {
        NonNull::new(mem.cast::<libc::sem_t>())
            .map(|sem| Semaphore { sem })
            .ok_or_else(|| ShmemError::Logic("null semaphore address".to_string()))
    }

    /// Runs as the region finalizer once the last process lets go.
    pub(crate) unsafe fn destroy(mem: *mut u8) {
        libc::sem_destroy(mem.cast::<libc::sem_t>());
    }

    pub(crate) fn post(&self) -> Result<()> {
        // SAFETY: the semaphore lives as long as the region holding it.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(ShmemError::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ShmemError::Io(err));
            }
        }
    }

    /// `false` when the count is zero.
    pub(crate) fn try_wait(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(ShmemError::Io(err)),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> Result<u32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } != 0 {
            return Err(ShmemError::last_os_error());
        }
        Ok(value.max(0) as u32)
    }
}
