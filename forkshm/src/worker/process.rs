use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::alloc::{allocate_shared, SharedMapping};
use crate::errors::{Result, ShmemError};
use crate::registry::Pid;

/// Reaps `pid`. Without `block`, `Ok(None)` means it is still running.
pub(crate) fn wait_child(pid: Pid, block: bool) -> Result<Option<libc::c_int>> {
    let flags = if block { 0 } else { libc::WNOHANG };
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer.
        let reaped = unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) };
        if reaped == pid.as_raw() {
            return Ok(Some(status));
        }
        if reaped == 0 {
            return Ok(None);
        }
        if reaped == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ShmemError::Io(err));
        }
        return Err(ShmemError::Logic(format!("waitpid({}) reaped {}", pid, reaped)));
    }
}

/// Exit code, or minus the signal number for a killed child.
pub(crate) fn decode_status(raw: libc::c_int) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        -libc::WTERMSIG(raw)
    } else {
        raw
    }
}

/// A flag the child raises while it runs, readable by the parent.
pub(crate) struct AliveFlag {
    mapping: SharedMapping,
}

impl AliveFlag {
    pub(crate) fn new() -> Result<Self> {
        Ok(AliveFlag {
            mapping: allocate_shared(mem::size_of::<AtomicBool>(), true)?,
        })
    }

    fn flag(&self) -> &AtomicBool {
        // SAFETY: the zeroed mapping is a valid `false` and lives as long as self.
        unsafe { &*self.mapping.as_ptr().cast::<AtomicBool>() }
    }

    pub(crate) fn set(&self, alive: bool) {
        self.flag().store(alive, Ordering::Release);
    }

    pub(crate) fn get(&self) -> bool {
        self.flag().load(Ordering::Acquire)
    }
}

impl Drop for AliveFlag {
    fn drop(&mut self) {
        // SAFETY: only this value refers to the mapping.
        if let Err(e) = unsafe { self.mapping.unmap() } {
            tracing::warn!(error = %e, "failed to unmap worker alive flag");
        }
    }
}
