use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::alloc::{allocate_shared, SharedMapping};
use crate::errors::Result;
use crate::registry::{sealed, Forkable, HandleId, Registry};

/// Bytes reserved at the start of the control mapping for the shared header.
pub(crate) const HEADER_LEN: usize = 64;

/// Runs on the control area right before the last process unmaps it.
pub(crate) type Finalizer = unsafe fn(*mut u8);

#[repr(C)]
struct RegionHeader {
    global: AtomicU32,
}

/// The untracked view of a region shared by every handle that refers to it.
///
/// The control mapping holds the global count followed by a caller-defined
/// control area. The data mapping holds the payload. `local` counts the
/// handles of this process and lives on the process heap.
#[derive(Clone, Copy)]
pub(crate) struct RawRegion {
    control: SharedMapping,
    data: SharedMapping,
    local: NonNull<AtomicU32>,
    finalizer: Option<Finalizer>,
}

// SAFETY: every field points at memory whose lifetime is governed by the two
// atomic counters, and all counter updates are atomic.
unsafe impl Send for RawRegion {}

impl RawRegion {
    fn allocate(capacity: usize, control_len: usize, finalizer: Option<Finalizer>) -> Result<Self> {
        let control = allocate_shared(HEADER_LEN + control_len, true)?;
        let data = match allocate_shared(capacity, false) {
            Ok(data) => data,
            Err(e) => {
                // SAFETY: nothing refers to the fresh control mapping yet.
                let _ = unsafe { control.unmap() };
                return Err(e);
            }
        };
        // SAFETY: the control mapping is at least HEADER_LEN bytes and page aligned.
        unsafe {
            control
                .as_ptr()
                .cast::<RegionHeader>()
                .write(RegionHeader { global: AtomicU32::new(1) })
        };
        let local = NonNull::from(Box::leak(Box::new(AtomicU32::new(1))));
        Ok(RawRegion {
            control,
            data,
            local,
            finalizer,
        })
    }

    /// Identifies the region across handles and processes.
    pub(crate) fn key(&self) -> usize {
        self.control.as_ptr() as usize
    }

    fn global(&self) -> &AtomicU32 {
        // SAFETY: the header stays mapped while any counted handle exists.
        unsafe { &(*self.control.as_ptr().cast::<RegionHeader>()).global }
    }

    fn local(&self) -> &AtomicU32 {
        // SAFETY: the local counter is freed only once the last local handle is gone.
        unsafe { self.local.as_ref() }
    }

    pub(crate) fn global_count(&self) -> u32 {
        self.global().load(Ordering::Acquire)
    }

    pub(crate) fn local_count(&self) -> u32 {
        self.local().load(Ordering::Acquire)
    }

    pub(crate) fn control_ptr(&self) -> *mut u8 {
        // SAFETY: the control mapping is HEADER_LEN + control_len bytes long.
        unsafe { self.control.as_ptr().add(HEADER_LEN) }
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// # Safety
    /// The region must still be mapped, i.e. held by a live handle.
    pub(crate) unsafe fn retain(&self) {
        self.global().fetch_add(1, Ordering::AcqRel);
        self.local().fetch_add(1, Ordering::AcqRel);
    }

    /// Adds this process's handles to the global count before `fork()`
    /// duplicates them. Returns the amount added.
    ///
    /// # Safety
    /// Must be followed by a fork, or undone with [`RawRegion::cancel_fork`].
    pub(crate) unsafe fn prepare_fork(&self) -> u32 {
        let local = self.local().load(Ordering::Acquire);
        self.global().fetch_add(local, Ordering::AcqRel);
        local
    }

    pub(crate) unsafe fn cancel_fork(&self, added: u32) {
        self.global().fetch_sub(added, Ordering::AcqRel);
    }

    /// Drops one handle's claim. Unmaps the region when this was the last
    /// claim in every process.
    ///
    /// # Safety
    /// Called at most once per counted handle.
    pub(crate) unsafe fn release(&self) {
        let global = self.global().fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
        let local = self.local().fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
        if local != 0 {
            return;
        }
        drop(Box::from_raw(self.local.as_ptr()));
        if global != 0 {
            return;
        }
        if let Some(finalize) = self.finalizer {
            finalize(self.control_ptr());
        }
        tracing::debug!(key = self.key(), capacity = self.capacity(), "unmapping shared region");
        for mapping in [self.data, self.control] {
            if let Err(e) = mapping.unmap() {
                tracing::error!(error = %e, len = mapping.len(), "munmap failed on a shared region");
                std::process::abort();
            }
        }
    }
}

/// A counted handle to a region of anonymous shared memory.
///
/// Cloning a handle counts one more owner in this process and across all of
/// them. Dropping or disposing it removes that owner, and the last owner of
/// the last process unmaps the memory. Handles survive `fork()` only through
/// [`Registry::fork`] or [`crate::fork_with`].
pub struct SharedRegion {
    raw: RawRegion,
    registry: Registry,
    id: HandleId,
    disposed: bool,
}

impl SharedRegion {
    pub fn new(registry: &Registry, capacity: usize) -> Result<Self> {
        Self::with_control(registry, capacity, 0, None)
    }

    pub(crate) fn with_control(
        registry: &Registry,
        capacity: usize,
        control_len: usize,
        finalizer: Option<Finalizer>,
    ) -> Result<Self> {
        let raw = RawRegion::allocate(capacity, control_len, finalizer)?;
        let id = registry.attach(raw, false);
        tracing::debug!(key = raw.key(), capacity, "created shared region");
        Ok(SharedRegion {
            raw,
            registry: registry.clone(),
            id,
            disposed: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Start of the shared payload bytes.
    pub fn as_ptr(&self) -> *mut u8 {
        self.raw.data_ptr()
    }

    pub fn global_ref_count(&self) -> u32 {
        self.raw.global_count()
    }

    pub fn local_ref_count(&self) -> u32 {
        self.raw.local_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Releases this handle's claim. Further calls do nothing.
    pub fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.registry.detach(self.id);
        }
    }

    pub(crate) fn raw(&self) -> &RawRegion {
        &self.raw
    }

    pub(crate) fn control_ptr(&self) -> *mut u8 {
        self.raw.control_ptr()
    }
}

impl Clone for SharedRegion {
    fn clone(&self) -> Self {
        SharedRegion {
            raw: self.raw,
            registry: self.registry.clone(),
            id: self.registry.attach(self.raw, true),
            disposed: false,
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SharedRegion");
        s.field("capacity", &self.capacity()).field("disposed", &self.disposed);
        if !self.disposed {
            s.field("global", &self.global_ref_count())
                .field("local", &self.local_ref_count());
        }
        s.finish()
    }
}

impl sealed::Sealed for SharedRegion {}

impl Forkable for SharedRegion {
    fn shared_region(&self, _: sealed::Token) -> &SharedRegion {
        self
    }
}
