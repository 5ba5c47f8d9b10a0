use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::errors::{Result, ShmemError};

/// Payloads at least this large are received into a private mapping instead
/// of the heap.
pub const MAPPED_THRESHOLD: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Heap,
    Mapped,
}

/// An owned, zero-initialised byte buffer released when dropped.
pub struct ScopedBuffer {
    repr: Repr,
}

enum Repr {
    Heap(Vec<u8>),
    Mapped { ptr: NonNull<u8>, len: usize },
}

// SAFETY: the mapped variant is a private anonymous mapping owned by this value.
unsafe impl Send for ScopedBuffer {}
unsafe impl Sync for ScopedBuffer {}

impl ScopedBuffer {
    pub fn new(len: usize, kind: BufferKind) -> Result<Self> {
        let repr = match kind {
            // mmap rejects zero-length mappings.
            BufferKind::Mapped if len > 0 => Repr::Mapped {
                ptr: map_private(len)?,
                len,
            },
            _ => Repr::Heap(vec![0; len]),
        };
        Ok(ScopedBuffer { repr })
    }

    /// Picks the buffer kind by size.
    pub fn for_len(len: usize) -> Result<Self> {
        let kind = if len >= MAPPED_THRESHOLD {
            BufferKind::Mapped
        } else {
            BufferKind::Heap
        };
        Self::new(len, kind)
    }

    pub fn kind(&self) -> BufferKind {
        match self.repr {
            Repr::Heap(_) => BufferKind::Heap,
            Repr::Mapped { .. } => BufferKind::Mapped,
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Heap(v) => v.len(),
            Repr::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Heap(v) => v,
            // SAFETY: ptr maps len bytes for as long as self lives.
            Repr::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.repr {
            Repr::Heap(v) => v,
            // SAFETY: as above, and &mut self guarantees exclusivity.
            Repr::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) },
        }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        if let Repr::Heap(v) = &mut self.repr {
            return std::mem::take(v);
        }
        self.as_slice().to_vec()
    }
}

impl From<Vec<u8>> for ScopedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        ScopedBuffer {
            repr: Repr::Heap(bytes),
        }
    }
}

impl Deref for ScopedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for ScopedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for ScopedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ScopedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedBuffer")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        if let Repr::Mapped { ptr, len } = self.repr {
            // SAFETY: the mapping is private to this buffer and dropped once.
            if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
                tracing::error!(len, error = %io::Error::last_os_error(), "failed to unmap receive buffer");
            }
        }
    }
}

fn map_private(len: usize) -> Result<NonNull<u8>> {
    // SAFETY: anonymous private mapping at a kernel-chosen address.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(ShmemError::Allocation(io::Error::last_os_error()));
    }
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| ShmemError::Allocation(io::Error::new(io::ErrorKind::Other, "mmap returned null")))
}
