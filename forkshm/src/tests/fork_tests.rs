use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::core::alloc::{allocate_shared, is_mapped};
use crate::core::region::Finalizer;
use crate::worker::process::{decode_status, wait_child};
use crate::{
    fork_with, Channel, ChannelConfig, Fork, Generator, Globals, LockKind, Pid, Registry, SharedRegion, ShmemError,
    Thread, WorkerConfig,
};

type TestResult = Result<(), Box<dyn Error>>;

/// Runs the child side of a test. A failed assertion becomes exit status 101.
fn in_child(registry: &Registry, f: impl FnOnce()) -> ! {
    let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => 0,
        Err(_) => 101,
    };
    registry.exit(status)
}

fn reap(pid: Pid) -> Result<i32, Box<dyn Error>> {
    let raw = wait_child(pid, true)?.ok_or("blocking wait returned no status")?;
    Ok(decode_status(raw))
}

fn small_worker_config() -> WorkerConfig {
    WorkerConfig {
        results: ChannelConfig::builder().capacity(64 * 1024).build().unwrap(),
        commands: ChannelConfig::commands(),
    }
}

#[test]
fn test_anonymous_mapping_is_shared_with_children() -> TestResult {
    let mapping = allocate_shared(4096, true)?;
    match fork_with(&[])? {
        Fork::Child => {
            unsafe { mapping.as_ptr().add(100).write(0xAB) };
            unsafe { libc::_exit(0) }
        }
        Fork::Parent(child) => {
            assert_eq!(reap(child)?, 0);
            assert_eq!(unsafe { mapping.as_ptr().add(100).read() }, 0xAB);
        }
    }
    unsafe { mapping.unmap()? };
    Ok(())
}

#[test]
fn test_ref_counts_across_child_and_grandchild() -> TestResult {
    let registry = Registry::new();
    let a = Channel::with_capacity(&registry, 1024)?;
    let b = Channel::with_capacity(&registry, 1024)?;

    match registry.fork()? {
        Fork::Child => in_child(&registry, || {
            assert_eq!((a.global_ref_count(), a.local_ref_count()), (2, 1));
            let b2 = b.try_clone().unwrap();
            assert_eq!((b.global_ref_count(), b.local_ref_count()), (3, 2));

            match registry.fork().unwrap() {
                Fork::Child => in_child(&registry, || {
                    assert_eq!((a.global_ref_count(), a.local_ref_count()), (3, 1));
                    assert_eq!((b.global_ref_count(), b.local_ref_count()), (5, 2));
                    b2.send_bytes(b"from grandchild").unwrap();
                }),
                Fork::Parent(grandchild) => {
                    assert_eq!(reap(grandchild).unwrap(), 0);
                    assert_eq!((a.global_ref_count(), a.local_ref_count()), (2, 1));
                    assert_eq!((b.global_ref_count(), b.local_ref_count()), (3, 2));
                }
            }
            a.send_value(&7u32).unwrap();
            drop(b2);
            assert_eq!((b.global_ref_count(), b.local_ref_count()), (2, 1));
        }),
        Fork::Parent(child) => {
            assert_eq!(reap(child)?, 0);
            assert_eq!((a.global_ref_count(), a.local_ref_count()), (1, 1));
            assert_eq!((b.global_ref_count(), b.local_ref_count()), (1, 1));
            assert_eq!(a.receive_value::<u32>(false)?, 7);
            assert_eq!(&*b.receive_bytes(false)?, b"from grandchild");
        }
    }
    drop((a, b));
    assert_eq!(registry.live_handles(), 0);
    Ok(())
}

#[test]
fn test_child_sees_counts_taken_at_fork() -> TestResult {
    let registry = Registry::new();
    let region = SharedRegion::new(&registry, 4096)?;
    let copy = region.clone();

    match registry.fork()? {
        Fork::Child => in_child(&registry, || {
            assert_eq!((region.global_ref_count(), region.local_ref_count()), (4, 2));
            unsafe { region.as_ptr().write(1) };
        }),
        Fork::Parent(child) => assert_eq!(reap(child)?, 0),
    }
    assert_eq!((region.global_ref_count(), region.local_ref_count()), (2, 2));
    assert_eq!(unsafe { copy.as_ptr().read() }, 1);
    drop(copy);
    assert_eq!((region.global_ref_count(), region.local_ref_count()), (1, 1));
    Ok(())
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_finalized(_control: *mut u8) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_last_release_in_any_process_finalizes_once() -> TestResult {
    let registry = Registry::new();
    let mut region = SharedRegion::with_control(&registry, 4096, 64, Some(count_finalized as Finalizer))?;
    let data = region.as_ptr();

    match registry.fork()? {
        Fork::Child => in_child(&registry, || {
            region.dispose();
            assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
            assert!(is_mapped(data, 4096));
        }),
        Fork::Parent(child) => assert_eq!(reap(child)?, 0),
    }
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
    assert_eq!((region.global_ref_count(), region.local_ref_count()), (1, 1));
    assert!(is_mapped(data, 4096));

    region.dispose();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert_eq!(registry.live_handles(), 0);
    Ok(())
}

#[test]
fn test_fork_with_prepares_only_listed_regions_once() -> TestResult {
    let registry = Registry::new();
    let listed = SharedRegion::new(&registry, 64)?;
    let listed_copy = listed.clone();
    let other = SharedRegion::new(&registry, 64)?;

    let fork = fork_with(&[&listed, &listed_copy])?;
    match fork {
        Fork::Child => {
            let ok = listed.global_ref_count() == 4 && other.global_ref_count() == 1;
            // Only the prepared handles may be released here.
            drop((listed, listed_copy));
            std::mem::forget(other);
            unsafe { libc::_exit(if ok { 0 } else { 101 }) }
        }
        Fork::Parent(child) => {
            assert_eq!(reap(child)?, 0);
            assert_eq!((listed.global_ref_count(), listed.local_ref_count()), (2, 2));
            assert_eq!(other.global_ref_count(), 1);
        }
    }
    Ok(())
}

#[test]
fn test_thread_returns_value() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), |_| {
        Ok::<_, std::convert::Infallible>(6 * 7)
    })?;
    thread.start()?;
    assert!(thread.pid().is_some());
    thread.join()?;
    assert_eq!(thread.exit_status()?, 0);
    assert_eq!(*thread.result()?, 42);
    assert!(!thread.is_alive());
    assert!(matches!(thread.start(), Err(ShmemError::Lifecycle(_))));
    assert!(matches!(thread.join(), Err(ShmemError::Lifecycle(_))));
    assert_eq!(thread.into_result()?, 42);
    Ok(())
}

#[test]
fn test_thread_default_config_and_handles_released() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::new(&registry, || String::from("done"))?;
    thread.start()?;
    thread.join()?;
    assert_eq!(thread.result()?, "done");
    drop(thread);
    assert_eq!(registry.live_handles(), 0);
    Ok(())
}

#[test]
fn test_thread_divide_by_zero_panic() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), |_| {
        let zero = std::hint::black_box(0i64);
        Ok::<i64, std::convert::Infallible>(1 / zero)
    })?;
    thread.start()?;
    thread.join()?;
    assert_eq!(thread.exit_status()?, 0);
    let remote = match thread.result() {
        Err(ShmemError::Remote(remote)) => remote,
        other => panic!("expected a remote error, got {:?}", other),
    };
    assert!(remote.is_panic());
    assert!(remote.message.contains("divide by zero"), "{}", remote.message);
    assert!(remote.trace[0].starts_with("panicked at "), "{:?}", remote.trace);
    // The trace is fetched once and then cached.
    assert!(matches!(thread.result(), Err(ShmemError::Remote(again)) if again == remote));
    Ok(())
}

#[test]
fn test_thread_typed_error() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::fallible(&registry, || "forty-two".parse::<i32>())?;
    thread.start()?;
    thread.join()?;
    match thread.result() {
        Err(ShmemError::Remote(remote)) => {
            assert!(remote.category.contains("ParseIntError"), "{}", remote.category);
            assert_eq!(remote.message, "invalid digit found in string");
            assert!(!remote.is_panic());
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_thread_killed_by_signal_has_no_result() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), |_| {
        unsafe { libc::raise(libc::SIGKILL) };
        Ok::<u8, std::convert::Infallible>(0)
    })?;
    thread.start()?;
    thread.join()?;
    assert_eq!(thread.exit_status()?, -libc::SIGKILL);
    assert!(matches!(
        thread.result(),
        Err(ShmemError::MissingResult { status }) if status == -libc::SIGKILL
    ));
    Ok(())
}

#[test]
fn test_thread_merges_globals_into_parent_state() -> TestResult {
    #[derive(Default)]
    struct Tally {
        seen: Vec<u32>,
        scratch: u32,
    }

    let registry = Registry::new();
    let state = Tally {
        seen: vec![1],
        scratch: 5,
    };
    let mut thread = Thread::with_state(&registry, &small_worker_config(), state, |tally: &mut Tally| {
        tally.seen.extend([2, 3]);
        tally.scratch = 99;
        Ok::<_, std::convert::Infallible>(tally.seen.len())
    })?
    .with_globals(Globals::new(
        |tally: &Tally| tally.seen.clone(),
        |tally: &mut Tally, seen: Vec<u32>| tally.seen = seen,
    ));
    thread.start()?;
    thread.join()?;
    assert_eq!(*thread.result()?, 3);
    let tally = thread.into_state();
    assert_eq!(tally.seen, vec![1, 2, 3]);
    assert_eq!(tally.scratch, 5);
    Ok(())
}

#[test]
fn test_thread_try_join_polls() -> TestResult {
    let registry = Registry::new();
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), |_| {
        thread::sleep(Duration::from_millis(300));
        Ok::<_, std::convert::Infallible>(true)
    })?;
    thread.start()?;
    assert!(thread.is_alive());
    assert!(!thread.try_join()?);
    assert!(matches!(thread.exit_status(), Err(ShmemError::Lifecycle(_))));
    while !thread.try_join()? {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(*thread.result()?);
    assert!(!thread.is_alive());
    Ok(())
}

#[test]
fn test_generator_yields_then_exhausts() -> TestResult {
    let registry = Registry::new();
    let mut generator = Generator::from_iter(&registry, 0..3u32)?;
    assert!(!generator.is_alive());
    generator.start()?;
    assert!(generator.is_alive());
    assert_eq!(generator.next(true)?, Some(0));
    assert_eq!(generator.next(true)?, Some(1));
    assert_eq!(generator.next(true)?, Some(2));
    assert_eq!(generator.next(true)?, None);
    assert_eq!(generator.next(true)?, None);
    generator.join()?;
    assert!(!generator.is_alive());
    assert_eq!(generator.exit_status()?, 0);
    assert!(matches!(generator.next(true), Err(ShmemError::Lifecycle(_))));
    Ok(())
}

#[test]
fn test_generator_step_too_large_for_results_fails_in_parent() -> TestResult {
    let registry = Registry::new();
    let mut generator = Generator::with_state(&registry, &small_worker_config(), (), |_| {
        Some(Ok::<_, std::convert::Infallible>(vec![7u8; 100 * 1024]))
    })?;
    generator.start()?;
    match generator.next(true) {
        Err(ShmemError::Remote(remote)) => assert!(!remote.is_panic()),
        other => panic!("expected a remote failure, got {:?}", other.map(|v| v.map(|v| v.len()))),
    }
    assert_eq!(generator.next(true)?, None);
    generator.join()?;
    assert_eq!(generator.exit_status()?, 0);
    Ok(())
}

#[test]
fn test_generator_iter_collects() -> TestResult {
    let registry = Registry::new();
    let mut generator = Generator::from_iter(&registry, vec!["a".to_string(), "b".to_string()])?;
    generator.start()?;
    let values = generator.iter().collect::<crate::Result<Vec<String>>>()?;
    assert_eq!(values, vec!["a", "b"]);
    generator.join()?;
    Ok(())
}

#[test]
fn test_generator_non_blocking_next_keeps_request_outstanding() -> TestResult {
    let registry = Registry::new();
    let mut n = 0u64;
    let mut generator = Generator::new(&registry, move || {
        thread::sleep(Duration::from_millis(200));
        n += 1;
        Some(n)
    })?;
    generator.start()?;
    assert!(matches!(generator.next(false), Err(ShmemError::WouldBlock)));
    let first = loop {
        match generator.next(false) {
            Err(ShmemError::WouldBlock) => thread::sleep(Duration::from_millis(10)),
            other => break other?,
        }
    };
    // Only one step was requested while polling.
    assert_eq!(first, Some(1));
    assert_eq!(generator.next(true)?, Some(2));
    generator.join()?;
    Ok(())
}

#[test]
fn test_generator_failure_ends_it() -> TestResult {
    let registry = Registry::new();
    let mut i = 0u32;
    let mut generator = Generator::new(&registry, move || {
        i += 1;
        if i == 3 {
            panic!("third step");
        }
        Some(i)
    })?;
    generator.start()?;
    assert_eq!(generator.next(true)?, Some(1));
    assert_eq!(generator.next(true)?, Some(2));
    match generator.next(true) {
        Err(ShmemError::Remote(remote)) => {
            assert!(remote.is_panic());
            assert_eq!(remote.message, "third step");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(generator.next(true)?, None);
    generator.join()?;
    assert_eq!(generator.exit_status()?, 0);
    Ok(())
}

#[test]
fn test_generator_join_drains_unanswered_step_and_merges_globals() -> TestResult {
    let registry = Registry::new();
    let mut generator = Generator::with_state(&registry, &small_worker_config(), 0u32, |steps: &mut u32| {
        thread::sleep(Duration::from_millis(100));
        *steps += 1;
        Some(Ok::<_, std::convert::Infallible>(*steps))
    })?
    .with_globals(Globals::new(|steps: &u32| *steps, |steps: &mut u32, child: u32| *steps += child));
    generator.start()?;
    assert_eq!(generator.next(true)?, Some(1));
    assert!(matches!(generator.next(false), Err(ShmemError::WouldBlock)));
    generator.join()?;
    assert_eq!(*generator.state(), 2);
    Ok(())
}

#[test]
fn test_generator_try_join_stops_child() -> TestResult {
    let registry = Registry::new();
    let mut generator = Generator::from_iter(&registry, 0..)?;
    generator.start()?;
    assert_eq!(generator.next(true)?, Some(0u64));
    while !generator.try_join()? {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(generator.exit_status()?, 0);
    Ok(())
}

#[test]
fn test_ten_thousand_elements_in_one_message() -> TestResult {
    let registry = Registry::new();
    let channel = Channel::with_capacity(&registry, 1 << 20)?;
    let sender = channel.try_clone()?;
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), move |_| {
        let values: Vec<u64> = (0..10_000).collect();
        sender.send_value(&values).map(|()| values.len())
    })?;
    thread.start()?;
    let received: Vec<u64> = channel.receive_value(true)?;
    thread.join()?;
    assert_eq!(*thread.result()?, 10_000);
    assert_eq!(received, (0..10_000).collect::<Vec<u64>>());
    Ok(())
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    seq: u64,
    label: String,
}

fn stream_through(config: ChannelConfig) -> TestResult {
    let registry = Registry::new();
    let channel = Channel::new(&registry, &config)?;
    let sender = channel.try_clone()?;
    let mut thread = Thread::with_state(&registry, &small_worker_config(), (), move |_| {
        for seq in 0..10_000u64 {
            let sample = Sample {
                seq,
                label: "x".repeat((seq % 40) as usize),
            };
            loop {
                match sender.send_value(&sample) {
                    Err(e) if e.is_retryable() => std::hint::spin_loop(),
                    other => break other?,
                }
            }
        }
        Ok::<_, ShmemError>(())
    })?;
    thread.start()?;
    for seq in 0..10_000u64 {
        let sample: Sample = channel.receive_value(true)?;
        assert_eq!(sample.seq, seq);
        assert_eq!(sample.label.len(), (seq % 40) as usize);
    }
    thread.join()?;
    thread.result()?;
    assert!(matches!(channel.receive_bytes(false), Err(ShmemError::WouldBlock)));
    Ok(())
}

#[test]
fn test_ten_thousand_messages_through_a_small_spin_ring() -> TestResult {
    stream_through(ChannelConfig::builder().capacity(512).build()?)
}

#[test]
fn test_ten_thousand_messages_through_a_small_mutex_ring() -> TestResult {
    stream_through(ChannelConfig::builder().capacity(512).lock(LockKind::Mutex).build()?)
}

#[test]
fn test_ten_thousand_messages_in_hybrid_mode() -> TestResult {
    stream_through(ChannelConfig::builder().capacity(4096).datagram_threshold(24).build()?)
}
