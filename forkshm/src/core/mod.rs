pub mod alloc;
pub mod buffer;
pub mod region;

/// A cheap, high-resolution timestamp for ordering IPC events.
///
/// On x86_64 this is the time stamp counter, which is not serializing: the CPU
/// may reorder it around neighbouring loads and stores. Elsewhere it is the
/// monotonic clock in nanoseconds. Both are comparable across processes forked
/// from one another on the same machine.
#[inline]
pub fn timestamp() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc is available on every x86_64 CPU.
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        monotonic_nanos()
    }
}

/// Like [`timestamp`], but waits for all prior instructions to complete first.
#[inline]
pub fn timestamp_serialized() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: lfence and rdtsc are baseline x86_64 instructions.
        unsafe {
            std::arch::x86_64::_mm_lfence();
            std::arch::x86_64::_rdtsc()
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        monotonic_nanos()
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-pointer and CLOCK_MONOTONIC always exists.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}
