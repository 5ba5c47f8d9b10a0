use std::io;
use std::ptr::{self, NonNull};

use crate::errors::{Result, ShmemError};

/// An anonymous `MAP_SHARED` mapping. Forked children inherit it at the same
/// address.
///
/// The mapping is a plain pointer/length pair: it does not unmap itself. Its
/// owner decides when the last process is done with it.
#[derive(Debug, Clone, Copy)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedMapping {
    pub const fn empty() -> Self {
        SharedMapping {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Releases the mapping in the calling process.
    ///
    /// # Safety
    /// No reference into the mapping may outlive this call, and the mapping
    /// must not be unmapped twice.
    pub unsafe fn unmap(self) -> io::Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        if libc::munmap(self.ptr.as_ptr().cast(), self.len) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Maps `len` bytes of zeroed, anonymous memory shared with future children.
///
/// With `reserve == false` the kernel is asked not to reserve swap for the
/// mapping, so large ring buffers only cost what is actually touched.
pub fn allocate_shared(len: usize, reserve: bool) -> Result<SharedMapping> {
    if len == 0 {
        return Ok(SharedMapping::empty());
    }
    let mut flags = libc::MAP_SHARED | libc::MAP_ANONYMOUS;
    if !reserve {
        flags |= no_reserve_flag();
    }
    // SAFETY: an anonymous mapping at a kernel-chosen address touches no
    // existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(ShmemError::Allocation(io::Error::last_os_error()));
    }
    let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        ShmemError::Allocation(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    })?;
    Ok(SharedMapping { ptr, len })
}

#[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
fn no_reserve_flag() -> libc::c_int {
    libc::MAP_NORESERVE
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
fn no_reserve_flag() -> libc::c_int {
    0
}

/// `true` while `[ptr, ptr + len)` is mapped in this process. `ptr` must be
/// page aligned.
#[cfg(test)]
pub(crate) fn is_mapped(ptr: *mut u8, len: usize) -> bool {
    // SAFETY: msync only inspects the range; unmapped ranges fail with ENOMEM.
    unsafe { libc::msync(ptr.cast(), len, libc::MS_ASYNC) == 0 }
}
