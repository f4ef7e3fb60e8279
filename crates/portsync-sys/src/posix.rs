//! POSIX backend: pthread mutexes and condition variables.
//!
//! Reentrant handles are `PTHREAD_MUTEX_RECURSIVE` mutexes, non-reentrant
//! handles are `PTHREAD_MUTEX_NORMAL` (relocking from the owner deadlocks).
//! Timed waits convert the tick duration into an absolute `CLOCK_REALTIME`
//! deadline, as `pthread_cond_timedwait` expects.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::ffi::c_int;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, addr_of};
use std::sync::Once;

use portsync_core::{MutexKind, SyncError, SyncResult, Timeout};
use tracing::{debug, trace, warn};

use crate::alloc::{RawAlloc, SystemAlloc};
use crate::backend::SyncBackend;
use crate::handle::{CondVarHandle, MutexHandle};
use crate::live::{Primitive, global_live};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Heap (or static) record behind a mutex handle.
#[repr(C)]
struct PosixMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    kind: MutexKind,
}

impl PosixMutex {
    const fn statically_initialized(kind: MutexKind) -> Self {
        Self {
            raw: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            kind,
        }
    }
}

// SAFETY: the pthread mutex is only touched through pthread calls, which
// synchronize internally; `kind` is immutable after initialization.
unsafe impl Sync for PosixMutex {}

/// Heap (or static) record behind a condition variable handle.
#[repr(C)]
struct PosixCond {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: the pthread condition variable is only touched through pthread calls.
unsafe impl Sync for PosixCond {}

// ---------------------------------------------------------------------------
// Fallback statics
// ---------------------------------------------------------------------------

static FALLBACK_NON_REENTRANT: PosixMutex =
    PosixMutex::statically_initialized(MutexKind::NonReentrant);
static FALLBACK_REENTRANT: PosixMutex = PosixMutex::statically_initialized(MutexKind::Reentrant);
static FALLBACK_REENTRANT_INIT: Once = Once::new();
static FALLBACK_COND: PosixCond = PosixCond {
    raw: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
};

fn fallback_mutex_record(kind: MutexKind) -> &'static PosixMutex {
    match kind {
        MutexKind::NonReentrant => &FALLBACK_NON_REENTRANT,
        MutexKind::Reentrant => {
            FALLBACK_REENTRANT_INIT.call_once(|| {
                // SAFETY: the record is not handed out until this returns, so
                // no thread can be holding it.
                let rc = unsafe { init_pthread_mutex(FALLBACK_REENTRANT.raw.get(), kind) };
                if rc != 0 {
                    warn!(rc, "recursive fallback mutex init failed; it stays non-recursive");
                }
            });
            &FALLBACK_REENTRANT
        }
    }
}

// ---------------------------------------------------------------------------
// Native helpers
// ---------------------------------------------------------------------------

/// Initialize `raw` as a recursive or normal mutex. Returns the pthread code.
unsafe fn init_pthread_mutex(raw: *mut libc::pthread_mutex_t, kind: MutexKind) -> c_int {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: `attr` is valid storage for an attribute object.
    let rc = unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) };
    if rc != 0 {
        return rc;
    }
    let native_type = if kind.is_reentrant() {
        libc::PTHREAD_MUTEX_RECURSIVE
    } else {
        libc::PTHREAD_MUTEX_NORMAL
    };
    // SAFETY: `attr` was initialized above; caller guarantees `raw` is valid,
    // unshared storage.
    unsafe {
        let mut rc = libc::pthread_mutexattr_settype(attr.as_mut_ptr(), native_type);
        if rc == 0 {
            rc = libc::pthread_mutex_init(raw, attr.as_ptr());
        }
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        rc
    }
}

/// Record behind a mutex handle, or `None` for null, stale and foreign handles.
fn mutex_record(handle: MutexHandle) -> Option<*mut PosixMutex> {
    let bits = handle.bits();
    if bits == addr_of!(FALLBACK_NON_REENTRANT).addr() {
        return Some(ptr::from_ref(&FALLBACK_NON_REENTRANT).cast_mut());
    }
    if bits == addr_of!(FALLBACK_REENTRANT).addr() {
        return Some(ptr::from_ref(fallback_mutex_record(MutexKind::Reentrant)).cast_mut());
    }
    global_live().resolve(bits, Primitive::Mutex)
}

/// Record behind a condition variable handle, or `None` for null, stale and
/// foreign handles.
fn cond_record(handle: CondVarHandle) -> Option<*mut PosixCond> {
    let bits = handle.bits();
    if bits == addr_of!(FALLBACK_COND).addr() {
        return Some(ptr::from_ref(&FALLBACK_COND).cast_mut());
    }
    global_live().resolve(bits, Primitive::CondVar)
}

/// Native mutex behind a handle, or `None` for null, stale and foreign handles.
///
/// The handle must not be freed while the returned pointer is in use.
unsafe fn native_mutex(handle: MutexHandle) -> Option<*mut libc::pthread_mutex_t> {
    let record = mutex_record(handle)?;
    // SAFETY: `record` is a live PosixMutex; the caller keeps it alive.
    Some(UnsafeCell::raw_get(unsafe { addr_of!((*record).raw) }))
}

/// As [`native_mutex`], panicking on an invalid handle.
unsafe fn raw_mutex(handle: MutexHandle) -> *mut libc::pthread_mutex_t {
    // SAFETY: forwarded caller contract.
    let Some(raw) = (unsafe { native_mutex(handle) }) else {
        panic!("invalid mutex handle");
    };
    raw
}

/// Native condition variable behind a handle.
///
/// The handle must not be freed while the returned pointer is in use.
unsafe fn raw_cond(handle: CondVarHandle) -> SyncResult<*mut libc::pthread_cond_t> {
    let record = cond_record(handle).ok_or(SyncError::InvalidArgument("invalid condition variable"))?;
    // SAFETY: `record` is a live PosixCond; the caller keeps it alive.
    Ok(UnsafeCell::raw_get(unsafe { addr_of!((*record).raw) }))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Absolute `CLOCK_REALTIME` deadline for a finite timeout.
fn realtime_deadline(timeout: Timeout) -> SyncResult<Option<libc::timespec>> {
    if timeout.is_infinite() {
        return Ok(None);
    }
    // SAFETY: timespec is plain data; all-zero is a valid value.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `now` is valid writable storage.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(SyncError::WaitFailed(last_errno()));
    }
    let Some(deadline) = timeout.deadline_from(i64::from(now.tv_sec), i64::from(now.tv_nsec))
    else {
        return Ok(None);
    };
    // SAFETY: as above.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = libc::time_t::try_from(deadline.secs).unwrap_or(libc::time_t::MAX);
    ts.tv_nsec = deadline.nanos as _;
    Ok(Some(ts))
}

/// Map a `pthread_cond_wait`/`pthread_cond_timedwait` return code.
fn wait_status(rc: c_int) -> SyncResult {
    match rc {
        0 => Ok(()),
        libc::ETIMEDOUT => Err(SyncError::OperationTimedOut),
        other => Err(SyncError::WaitFailed(other)),
    }
}

/// Map a `pthread_cond_signal`/`pthread_cond_broadcast` return code.
fn wake_status(rc: c_int) -> SyncResult {
    if rc == 0 {
        Ok(())
    } else {
        Err(SyncError::InvalidOperation(rc))
    }
}

fn alloc_record<T, A: RawAlloc>() -> SyncResult<*mut T> {
    let ptr = A::alloc_zeroed(Layout::new::<T>()).cast::<T>();
    if ptr.is_null() {
        Err(SyncError::OutOfMemory)
    } else {
        Ok(ptr)
    }
}

unsafe fn dealloc_record<T, A: RawAlloc>(ptr: *mut T) {
    // SAFETY: caller passes a record from `alloc_record::<T, A>`.
    unsafe { A::dealloc(ptr.cast::<u8>(), Layout::new::<T>()) }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// pthread-backed implementation of [`SyncBackend`].
///
/// `A` supplies record memory; the default is the global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixBackend<A = SystemAlloc>(PhantomData<A>);

// SAFETY: every handle this backend returns is a registry token for a record
// it initialized, or the address of a fallback static; entrypoints resolve
// handles before touching native state.
unsafe impl<A: RawAlloc> SyncBackend for PosixBackend<A> {
    const NAME: &'static str = "posix";

    fn try_create_mutex(kind: MutexKind) -> SyncResult<MutexHandle> {
        let record = alloc_record::<PosixMutex, A>()?;
        // SAFETY: `record` is fresh, exclusively owned, zeroed storage for a
        // PosixMutex; zero is a valid bit pattern for both fields.
        let rc = unsafe {
            (*record).kind = kind;
            init_pthread_mutex((*record).raw.get(), kind)
        };
        if rc != 0 {
            // SAFETY: init failed, nothing else references the record.
            unsafe { dealloc_record::<PosixMutex, A>(record) };
            return Err(SyncError::InitFailed(rc));
        }
        let Some(token) = global_live().register(record, Primitive::Mutex) else {
            // SAFETY: the mutex was initialized above and was never shared.
            unsafe {
                libc::pthread_mutex_destroy((*record).raw.get());
                dealloc_record::<PosixMutex, A>(record);
            }
            return Err(SyncError::OutOfMemory);
        };
        let handle = MutexHandle::from_token(token);
        trace!(kind = kind.name(), handle = ?handle.as_raw(), "created pthread mutex");
        Ok(handle)
    }

    fn fallback_mutex(kind: MutexKind) -> MutexHandle {
        MutexHandle::from_static(fallback_mutex_record(kind))
    }

    fn is_fallback_mutex(handle: MutexHandle) -> bool {
        let bits = handle.bits();
        bits == addr_of!(FALLBACK_NON_REENTRANT).addr() || bits == addr_of!(FALLBACK_REENTRANT).addr()
    }

    unsafe fn lock_mutex(handle: MutexHandle) {
        // SAFETY: caller keeps the handle alive; invalid handles panic in `raw_mutex`.
        let rc = unsafe { libc::pthread_mutex_lock(raw_mutex(handle)) };
        assert_eq!(rc, 0, "pthread_mutex_lock failed");
    }

    unsafe fn unlock_mutex(handle: MutexHandle) {
        // SAFETY: caller keeps the handle alive and holds it on this thread.
        let rc = unsafe { libc::pthread_mutex_unlock(raw_mutex(handle)) };
        assert_eq!(rc, 0, "pthread_mutex_unlock failed");
    }

    unsafe fn try_lock_mutex(handle: MutexHandle) -> bool {
        // SAFETY: caller keeps the handle alive; invalid handles panic in `raw_mutex`.
        unsafe { libc::pthread_mutex_trylock(raw_mutex(handle)) == 0 }
    }

    unsafe fn free_mutex(handle: MutexHandle) {
        if handle.is_null() {
            return;
        }
        if Self::is_fallback_mutex(handle) {
            trace!("free of shared fallback mutex is a no-op");
            return;
        }
        let Some(record) = global_live().retire::<PosixMutex>(handle.bits(), Primitive::Mutex) else {
            debug!(handle = ?handle.as_raw(), "ignoring free of unknown or already freed mutex");
            return;
        };
        // SAFETY: the registry handed us sole ownership of a live record.
        let (rc, kind) = unsafe { (libc::pthread_mutex_destroy((*record).raw.get()), (*record).kind) };
        if rc != 0 {
            warn!(rc, kind = kind.name(), "pthread_mutex_destroy failed; releasing storage anyway");
        }
        // SAFETY: record came from `alloc_record::<PosixMutex, A>`.
        unsafe { dealloc_record::<PosixMutex, A>(record) };
        trace!(kind = kind.name(), handle = ?handle.as_raw(), "freed pthread mutex");
    }

    fn try_create_cond_var() -> SyncResult<CondVarHandle> {
        let record = alloc_record::<PosixCond, A>()?;
        // SAFETY: fresh, exclusively owned, zeroed storage for a PosixCond.
        let rc = unsafe { libc::pthread_cond_init((*record).raw.get(), std::ptr::null()) };
        if rc != 0 {
            // SAFETY: init failed, nothing else references the record.
            unsafe { dealloc_record::<PosixCond, A>(record) };
            return Err(SyncError::InitFailed(rc));
        }
        let Some(token) = global_live().register(record, Primitive::CondVar) else {
            // SAFETY: the condition variable was initialized above and was never shared.
            unsafe {
                libc::pthread_cond_destroy((*record).raw.get());
                dealloc_record::<PosixCond, A>(record);
            }
            return Err(SyncError::OutOfMemory);
        };
        let handle = CondVarHandle::from_token(token);
        trace!(handle = ?handle.as_raw(), "created pthread condition variable");
        Ok(handle)
    }

    fn fallback_cond_var() -> CondVarHandle {
        CondVarHandle::from_static(&FALLBACK_COND)
    }

    fn is_fallback_cond_var(handle: CondVarHandle) -> bool {
        handle.bits() == addr_of!(FALLBACK_COND).addr()
    }

    unsafe fn signal_cond_var(handle: CondVarHandle) -> SyncResult {
        // SAFETY: caller keeps the handle alive for the call.
        let cond = unsafe { raw_cond(handle) }?;
        // SAFETY: `cond` is a live, initialized condition variable.
        wake_status(unsafe { libc::pthread_cond_signal(cond) })
    }

    unsafe fn broadcast_cond_var(handle: CondVarHandle) -> SyncResult {
        // SAFETY: caller keeps the handle alive for the call.
        let cond = unsafe { raw_cond(handle) }?;
        // SAFETY: `cond` is a live, initialized condition variable.
        wake_status(unsafe { libc::pthread_cond_broadcast(cond) })
    }

    unsafe fn wait_cond_var(
        handle: CondVarHandle,
        mutex: MutexHandle,
        timeout: Timeout,
    ) -> SyncResult {
        // SAFETY: caller keeps both handles alive for the call.
        let (cond, mutex) = unsafe {
            let cond = raw_cond(handle)?;
            let mutex = native_mutex(mutex).ok_or(SyncError::InvalidArgument("invalid mutex"))?;
            (cond, mutex)
        };
        let deadline = realtime_deadline(timeout)?;
        // SAFETY: both handles resolved to live records and this thread holds `mutex`.
        let rc = unsafe {
            match deadline {
                None => libc::pthread_cond_wait(cond, mutex),
                Some(ts) => libc::pthread_cond_timedwait(cond, mutex, &ts),
            }
        };
        wait_status(rc)
    }

    unsafe fn free_cond_var(handle: CondVarHandle) {
        if handle.is_null() {
            return;
        }
        if Self::is_fallback_cond_var(handle) {
            trace!("free of shared fallback condition variable is a no-op");
            return;
        }
        let Some(record) = global_live().retire::<PosixCond>(handle.bits(), Primitive::CondVar)
        else {
            debug!(handle = ?handle.as_raw(), "ignoring free of unknown or already freed condition variable");
            return;
        };
        // SAFETY: the registry handed us sole ownership of a live record.
        let rc = unsafe { libc::pthread_cond_destroy((*record).raw.get()) };
        if rc != 0 {
            warn!(rc, "pthread_cond_destroy failed; releasing storage anyway");
        }
        // SAFETY: record came from `alloc_record::<PosixCond, A>`.
        unsafe { dealloc_record::<PosixCond, A>(record) };
        trace!(handle = ?handle.as_raw(), "freed pthread condition variable");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    type Posix = PosixBackend<SystemAlloc>;

    #[test]
    fn wait_status_distinguishes_timeout() {
        assert_eq!(wait_status(0), Ok(()));
        assert_eq!(wait_status(libc::ETIMEDOUT), Err(SyncError::OperationTimedOut));
        assert_eq!(wait_status(libc::EINVAL), Err(SyncError::WaitFailed(libc::EINVAL)));
        assert_eq!(wake_status(libc::EINVAL), Err(SyncError::InvalidOperation(libc::EINVAL)));
    }

    #[test]
    fn realtime_deadline_is_in_the_future() {
        assert!(realtime_deadline(Timeout::INFINITE).unwrap().is_none());
        let before = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap();
        let ts = realtime_deadline(Timeout::from_millis(2_000)).unwrap().unwrap();
        assert!(i64::from(ts.tv_sec) >= before.as_secs() as i64 + 1);
        assert!((0..1_000_000_000).contains(&i64::from(ts.tv_nsec)));
    }

    #[test]
    fn record_carries_kind() {
        let h = Posix::try_create_mutex(MutexKind::Reentrant).unwrap();
        let record = mutex_record(h).unwrap();
        // SAFETY: fresh live handle.
        let kind = unsafe { (*record).kind };
        assert_eq!(kind, MutexKind::Reentrant);
        unsafe { Posix::free_mutex(h) };
    }

    #[test]
    fn fallback_records_are_distinct_and_recognized() {
        let plain = Posix::fallback_mutex(MutexKind::NonReentrant);
        let recursive = Posix::fallback_mutex(MutexKind::Reentrant);
        assert_ne!(plain, recursive);
        assert!(Posix::is_fallback_mutex(plain));
        assert!(Posix::is_fallback_mutex(recursive));
        assert!(Posix::is_fallback_cond_var(Posix::fallback_cond_var()));

        let fresh = Posix::try_create_mutex(MutexKind::NonReentrant).unwrap();
        assert!(!Posix::is_fallback_mutex(fresh));
        unsafe { Posix::free_mutex(fresh) };
    }

    #[test]
    fn freed_handles_stop_resolving() {
        let m = Posix::try_create_mutex(MutexKind::NonReentrant).unwrap();
        let cv = Posix::try_create_cond_var().unwrap();
        assert!(mutex_record(m).is_some());
        assert!(cond_record(cv).is_some());
        // SAFETY: both handles are live and released once.
        unsafe {
            Posix::free_mutex(m);
            Posix::free_cond_var(cv);
        }
        assert!(mutex_record(m).is_none());
        assert!(cond_record(cv).is_none());
        // SAFETY: stale handles are rejected before native state is touched.
        let rc = unsafe { Posix::signal_cond_var(cv) };
        assert_eq!(rc, Err(SyncError::InvalidArgument("invalid condition variable")));
    }

    #[test]
    fn recursive_fallback_nests() {
        let h = Posix::fallback_mutex(MutexKind::Reentrant);
        // SAFETY: fallback handles are always live.
        unsafe {
            Posix::lock_mutex(h);
            assert!(Posix::try_lock_mutex(h));
            Posix::unlock_mutex(h);
            Posix::unlock_mutex(h);
        }
    }
}
