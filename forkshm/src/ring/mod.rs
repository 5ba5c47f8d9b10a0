//! A byte ring in shared memory, guarded by a lock that lives next to it.

mod lock;

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use self::lock::LockKind;
use self::lock::RingLock;
use crate::core::region::{Finalizer, SharedRegion};
use crate::errors::{Result, ShmemError};
use crate::registry::{sealed, Forkable, Registry};

const MUTEX_OFFSET: usize = 64;
const ALIGN: usize = 64;

#[repr(C)]
struct RingControl {
    start: AtomicUsize,
    end: AtomicUsize,
    full: AtomicBool,
    spin: AtomicBool,
}

/// A snapshot of the ring metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub start: usize,
    pub end: usize,
    pub full: bool,
    pub capacity: usize,
}

impl RingStatus {
    pub fn available_bytes(&self) -> usize {
        if self.start < self.end {
            self.end - self.start
        } else if self.start > self.end {
            self.capacity - (self.start - self.end)
        } else if self.full {
            self.capacity
        } else {
            0
        }
    }

    pub fn available_space(&self) -> usize {
        if self.start < self.end {
            self.capacity - (self.end - self.start)
        } else if self.start > self.end {
            self.start - self.end
        } else if self.full {
            0
        } else {
            self.capacity
        }
    }
}

fn round_up(n: usize) -> usize {
    (n + ALIGN - 1) / ALIGN * ALIGN
}

fn trailer_offset() -> usize {
    round_up(MUTEX_OFFSET + RingLock::mutex_len())
}

/// A fixed-capacity FIFO of bytes shared by every process holding a handle.
///
/// Writes and reads are all-or-nothing: a write that does not fit and a read
/// of more than is buffered fail without touching the metadata.
pub struct RingBuffer {
    region: SharedRegion,
    lock: RingLock,
    kind: LockKind,
}

impl RingBuffer {
    pub fn new(registry: &Registry, capacity: usize, kind: LockKind) -> Result<Self> {
        Self::with_trailer(registry, capacity, kind, 0, None)
    }

    /// Allocates `trailer_len` extra control bytes for the owner's use; see
    /// [`RingBuffer::trailer_ptr`].
    pub(crate) fn with_trailer(
        registry: &Registry,
        capacity: usize,
        kind: LockKind,
        trailer_len: usize,
        finalizer: Option<Finalizer>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(ShmemError::Logic("ring buffer capacity must be positive".to_string()));
        }
        let region = SharedRegion::with_control(registry, capacity, trailer_offset() + trailer_len, finalizer)?;
        // SAFETY: the control area is fresh, zeroed and large enough.
        unsafe {
            region.control_ptr().cast::<RingControl>().write(RingControl {
                start: AtomicUsize::new(0),
                end: AtomicUsize::new(0),
                full: AtomicBool::new(false),
                spin: AtomicBool::new(false),
            })
        };
        let lock = unsafe { RingLock::init(kind, region.control_ptr().add(MUTEX_OFFSET))? };
        Ok(RingBuffer { region, lock, kind })
    }

    /// Another handle to the same ring, counted like a region clone.
    pub fn try_clone(&self) -> Result<Self> {
        self.ensure_live()?;
        let region = self.region.clone();
        let lock = unsafe { RingLock::attach(self.kind, region.control_ptr().add(MUTEX_OFFSET))? };
        Ok(RingBuffer {
            region,
            lock,
            kind: self.kind,
        })
    }

    fn control(&self) -> &RingControl {
        // SAFETY: written in with_trailer and mapped while the handle is live.
        unsafe { &*self.region.control_ptr().cast::<RingControl>() }
    }

    pub(crate) fn trailer_ptr(&self) -> *mut u8 {
        // SAFETY: with_trailer reserved trailer_len bytes here.
        unsafe { self.region.control_ptr().add(trailer_offset()) }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.region.is_disposed() {
            return Err(ShmemError::Lifecycle("ring buffer has been disposed"));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn lock_kind(&self) -> LockKind {
        self.kind
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn status(&self) -> Result<RingStatus> {
        self.locked(|status| Ok((status, None)))
    }

    pub fn available_bytes(&self) -> Result<usize> {
        Ok(self.status()?.available_bytes())
    }

    pub fn available_space(&self) -> Result<usize> {
        Ok(self.status()?.available_space())
    }

    /// Runs `f` on the metadata under the lock. `f` may return new
    /// `(end or start, full)` values to store.
    fn locked<R>(&self, f: impl FnOnce(RingStatus) -> Result<(R, Option<RingStatus>)>) -> Result<R> {
        self.ensure_live()?;
        let control = self.control();
        let _guard = self.lock.acquire(&control.spin)?;
        let status = RingStatus {
            start: control.start.load(Ordering::Relaxed),
            end: control.end.load(Ordering::Relaxed),
            full: control.full.load(Ordering::Relaxed),
            capacity: self.capacity(),
        };
        let (out, commit) = f(status)?;
        if let Some(next) = commit {
            control.start.store(next.start, Ordering::Relaxed);
            control.end.store(next.end, Ordering::Relaxed);
            control.full.store(next.full, Ordering::Relaxed);
        }
        Ok(out)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.write_parts(&[bytes])
    }

    /// Writes every part back to back under one lock, or none of them.
    pub fn write_parts(&self, parts: &[&[u8]]) -> Result<()> {
        self.write_parts_gated(parts, || Ok(()))
    }

    /// Like [`RingBuffer::write_parts`]; `gate` runs under the lock once the
    /// parts are known to fit, and its failure aborts the write.
    pub(crate) fn write_parts_gated(&self, parts: &[&[u8]], gate: impl FnOnce() -> Result<()>) -> Result<()> {
        let n: usize = parts.iter().map(|p| p.len()).sum();
        if n == 0 {
            return Ok(());
        }
        self.locked(|status| {
            let space = status.available_space();
            if n > space {
                return Err(ShmemError::Full {
                    requested: n,
                    available: space,
                });
            }
            gate()?;
            let mut end = status.end;
            for part in parts {
                // SAFETY: the parts fit in the free span starting at end.
                unsafe { self.copy_in(end, part) };
                end = (end + part.len()) % status.capacity;
            }
            let next = RingStatus {
                end,
                full: n == space,
                ..status
            };
            Ok(((), Some(next)))
        })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.read_with(|tx| tx.read(buf))
    }

    /// Runs `f` as one locked read transaction. The bytes `f` consumed are
    /// only released to writers if `f` succeeds.
    pub fn read_with<R>(&self, f: impl FnOnce(&mut ReadTx<'_>) -> Result<R>) -> Result<R> {
        self.locked(|status| {
            let mut tx = ReadTx {
                data: self.region.as_ptr(),
                capacity: status.capacity,
                start: status.start,
                available: status.available_bytes(),
                consumed: 0,
                _ring: PhantomData,
            };
            let out = f(&mut tx)?;
            let commit = (tx.consumed > 0).then(|| RingStatus {
                start: tx.start,
                full: false,
                ..status
            });
            Ok((out, commit))
        })
    }

    unsafe fn copy_in(&self, at: usize, src: &[u8]) {
        let data = self.region.as_ptr();
        let first = src.len().min(self.capacity() - at);
        ptr::copy_nonoverlapping(src.as_ptr(), data.add(at), first);
        ptr::copy_nonoverlapping(src.as_ptr().add(first), data, src.len() - first);
    }

    pub fn global_ref_count(&self) -> u32 {
        self.region.global_ref_count()
    }

    pub fn local_ref_count(&self) -> u32 {
        self.region.local_ref_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.region.is_disposed()
    }

    pub fn dispose(&mut self) {
        self.region.dispose();
    }
}

/// The reader's side of [`RingBuffer::read_with`].
pub struct ReadTx<'a> {
    data: *const u8,
    capacity: usize,
    start: usize,
    available: usize,
    consumed: usize,
    _ring: PhantomData<&'a RingBuffer>,
}

impl ReadTx<'_> {
    /// Unread bytes left in this transaction.
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        if n > self.available {
            return Err(ShmemError::OutOfRange {
                requested: n,
                available: self.available,
            });
        }
        let first = n.min(self.capacity - self.start);
        // SAFETY: n unread bytes start at self.start, wrapping at capacity.
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(self.start), buf.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data, buf.as_mut_ptr().add(first), n - first);
        }
        self.start = (self.start + n) % self.capacity;
        self.available -= n;
        self.consumed += n;
        Ok(())
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("kind", &self.kind)
            .field("region", &self.region)
            .finish()
    }
}

impl sealed::Sealed for RingBuffer {}

impl Forkable for RingBuffer {
    fn shared_region(&self, _: sealed::Token) -> &SharedRegion {
        &self.region
    }
}
