use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use portsync_sys::dispatch::{
    broadcast_cond_var, create_cond_var, create_mutex, free_cond_var, free_mutex, lock_mutex,
    signal_cond_var, try_lock_mutex, unlock_mutex, wait_cond_var,
};
use portsync_sys::{
    CondVarHandle, INFINITE_TIME_VALUE, MutexHandle, SyncError, Timeout,
    live_primitive_count,
};

static TEST_GUARD_HELD: AtomicBool = AtomicBool::new(false);

struct TestGuard;

impl Drop for TestGuard {
    fn drop(&mut self) {
        TEST_GUARD_HELD.store(false, Ordering::Release);
    }
}

fn acquire_test_guard() -> TestGuard {
    loop {
        if TEST_GUARD_HELD
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return TestGuard;
        }
        std::thread::yield_now();
    }
}

fn ticks(d: Duration) -> u64 {
    Timeout::from_duration(d).ticks()
}

fn held_elsewhere(mutex: MutexHandle) -> bool {
    std::thread::spawn(move || unsafe {
        let acquired = try_lock_mutex(mutex);
        if acquired {
            unlock_mutex(mutex);
        }
        !acquired
    })
    .join()
    .unwrap()
}

/// Waits on `cv` until `flag` is set, absorbing spurious wakeups.
unsafe fn wait_for_flag(cv: CondVarHandle, mutex: MutexHandle, flag: &AtomicBool) {
    unsafe {
        lock_mutex(mutex);
        while !flag.load(Ordering::Acquire) {
            wait_cond_var(cv, mutex, INFINITE_TIME_VALUE).unwrap();
        }
        unlock_mutex(mutex);
    }
}

#[test]
fn timed_wait_reports_timeout_and_reacquires_mutex() {
    let _guard = acquire_test_guard();
    let m = create_mutex(false);
    let cv = create_cond_var();
    unsafe {
        lock_mutex(m);
        let start = Instant::now();
        let res = wait_cond_var(cv, m, ticks(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert_eq!(res, Err(SyncError::OperationTimedOut));
        assert!(elapsed >= Duration::from_millis(40), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");
        assert!(held_elsewhere(m), "mutex must be held again after the wait");

        unlock_mutex(m);
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn timed_wait_on_reentrant_mutex_reacquires() {
    let _guard = acquire_test_guard();
    let m = create_mutex(true);
    let cv = create_cond_var();
    unsafe {
        lock_mutex(m);
        let res = wait_cond_var(cv, m, ticks(Duration::from_millis(10)));
        assert!(matches!(res, Ok(()) | Err(SyncError::OperationTimedOut)));
        assert!(held_elsewhere(m));
        unlock_mutex(m);
        assert!(!held_elsewhere(m));
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn zero_timeout_returns_promptly() {
    let _guard = acquire_test_guard();
    let m = create_mutex(false);
    let cv = create_cond_var();
    unsafe {
        lock_mutex(m);
        let start = Instant::now();
        let res = wait_cond_var(cv, m, Timeout::ZERO.ticks());
        assert!(matches!(res, Ok(()) | Err(SyncError::OperationTimedOut)));
        assert!(start.elapsed() < Duration::from_secs(1));
        unlock_mutex(m);
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn signal_wakes_infinite_waiter() {
    let _guard = acquire_test_guard();
    let m = create_mutex(false);
    let cv = create_cond_var();
    let ready = Arc::new(AtomicBool::new(false));

    let waiter = {
        let ready = ready.clone();
        std::thread::spawn(move || unsafe { wait_for_flag(cv, m, &ready) })
    };

    std::thread::sleep(Duration::from_millis(20));
    unsafe {
        lock_mutex(m);
        ready.store(true, Ordering::Release);
        assert_eq!(signal_cond_var(cv), Ok(()));
        unlock_mutex(m);
    }
    waiter.join().unwrap();

    unsafe {
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn broadcast_wakes_every_waiter() {
    let _guard = acquire_test_guard();
    const WAITERS: usize = 4;
    let m = create_mutex(false);
    let cv = create_cond_var();
    let ready = Arc::new(AtomicBool::new(false));
    let woken = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..WAITERS)
        .map(|_| {
            let ready = ready.clone();
            let woken = woken.clone();
            std::thread::spawn(move || {
                unsafe { wait_for_flag(cv, m, &ready) };
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    unsafe {
        lock_mutex(m);
        ready.store(true, Ordering::Release);
        assert_eq!(broadcast_cond_var(cv), Ok(()));
        unlock_mutex(m);
    }
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);

    unsafe {
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn signal_without_waiters_succeeds() {
    let _guard = acquire_test_guard();
    let cv = create_cond_var();
    unsafe {
        assert_eq!(signal_cond_var(cv), Ok(()));
        assert_eq!(broadcast_cond_var(cv), Ok(()));
        free_cond_var(cv);
    }
}

#[test]
fn null_handles_are_invalid_arguments() {
    let _guard = acquire_test_guard();
    let m = create_mutex(false);
    let cv = create_cond_var();
    unsafe {
        assert!(matches!(
            signal_cond_var(CondVarHandle::NULL),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            broadcast_cond_var(CondVarHandle::NULL),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            wait_cond_var(CondVarHandle::NULL, m, 0),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            wait_cond_var(cv, MutexHandle::NULL, 0),
            Err(SyncError::InvalidArgument(_))
        ));
        free_cond_var(cv);
        free_mutex(m);
    }
}

#[test]
fn free_cond_var_is_idempotent_and_ignores_null() {
    let _guard = acquire_test_guard();
    let before = live_primitive_count();
    let cv = create_cond_var();
    assert!(!cv.is_null());
    assert_eq!(live_primitive_count(), before + 1);
    unsafe {
        free_cond_var(cv);
        free_cond_var(cv);
        free_cond_var(CondVarHandle::NULL);
    }
    assert_eq!(live_primitive_count(), before);
}

#[test]
fn mutex_handle_cannot_be_freed_as_cond_var() {
    let _guard = acquire_test_guard();
    let m = create_mutex(false);
    let before = live_primitive_count();
    unsafe {
        free_cond_var(CondVarHandle::from_raw(m.as_raw()));
    }
    assert_eq!(live_primitive_count(), before);
    unsafe {
        lock_mutex(m);
        unlock_mutex(m);
        free_mutex(m);
    }
}

#[test]
fn stale_free_leaves_newer_cond_var_alive() {
    let _guard = acquire_test_guard();
    let before = live_primitive_count();
    let a = create_cond_var();
    unsafe { free_cond_var(a) };
    let b = create_cond_var();
    assert_ne!(a, b);
    unsafe {
        free_cond_var(a);
        assert_eq!(live_primitive_count(), before + 1);
        assert_eq!(signal_cond_var(b), Ok(()));
        assert!(matches!(signal_cond_var(a), Err(SyncError::InvalidArgument(_))));
        free_cond_var(b);
    }
    assert_eq!(live_primitive_count(), before);
}
