//! Windows backend: critical sections, SRW locks and condition variables.
//!
//! Reentrant handles use a `CRITICAL_SECTION` (recursive by construction);
//! non-reentrant handles use an `SRWLOCK` acquired exclusively. Waits pass a
//! relative millisecond timeout, with `INFINITE` for the sentinel.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::ptr::{self, addr_of, null_mut};
use std::sync::Once;

use portsync_core::{MutexKind, SyncError, SyncResult, Timeout};
use tracing::{debug, trace};

use crate::alloc::{RawAlloc, SystemAlloc};
use crate::backend::SyncBackend;
use crate::handle::{CondVarHandle, MutexHandle};
use crate::live::{Primitive, global_live};

// ---------------------------------------------------------------------------
// kernel32 bindings
// ---------------------------------------------------------------------------

type Bool = i32;
type Boolean = u8;

/// `SRWLOCK`: one pointer, zero means unlocked.
#[repr(C)]
struct SrwLock {
    ptr: *mut c_void,
}

/// `CONDITION_VARIABLE`: one pointer, zero means no waiters.
#[repr(C)]
struct ConditionVariable {
    ptr: *mut c_void,
}

/// `CRITICAL_SECTION` (`RTL_CRITICAL_SECTION`).
#[repr(C)]
struct CriticalSection {
    debug_info: *mut c_void,
    lock_count: i32,
    recursion_count: i32,
    owning_thread: *mut c_void,
    lock_semaphore: *mut c_void,
    spin_count: usize,
}

impl SrwLock {
    const INIT: Self = Self { ptr: null_mut() };
}

impl ConditionVariable {
    const INIT: Self = Self { ptr: null_mut() };
}

impl CriticalSection {
    const ZEROED: Self = Self {
        debug_info: null_mut(),
        lock_count: 0,
        recursion_count: 0,
        owning_thread: null_mut(),
        lock_semaphore: null_mut(),
        spin_count: 0,
    };
}

const ERROR_TIMEOUT: u32 = 1460;
const CONDITION_VARIABLE_LOCKMODE_EXCLUSIVE: u32 = 0;

#[link(name = "kernel32")]
unsafe extern "system" {
    fn InitializeCriticalSection(cs: *mut CriticalSection);
    fn EnterCriticalSection(cs: *mut CriticalSection);
    fn TryEnterCriticalSection(cs: *mut CriticalSection) -> Bool;
    fn LeaveCriticalSection(cs: *mut CriticalSection);
    fn DeleteCriticalSection(cs: *mut CriticalSection);

    fn AcquireSRWLockExclusive(lock: *mut SrwLock);
    fn TryAcquireSRWLockExclusive(lock: *mut SrwLock) -> Boolean;
    fn ReleaseSRWLockExclusive(lock: *mut SrwLock);

    fn InitializeConditionVariable(cv: *mut ConditionVariable);
    fn WakeConditionVariable(cv: *mut ConditionVariable);
    fn WakeAllConditionVariable(cv: *mut ConditionVariable);
    fn SleepConditionVariableCS(
        cv: *mut ConditionVariable,
        cs: *mut CriticalSection,
        millis: u32,
    ) -> Bool;
    fn SleepConditionVariableSRW(
        cv: *mut ConditionVariable,
        lock: *mut SrwLock,
        millis: u32,
        flags: u32,
    ) -> Bool;

    fn GetLastError() -> u32;
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Record behind a mutex handle. Only the primitive matching `kind` is used.
#[repr(C)]
struct WinLock {
    kind: MutexKind,
    srw: UnsafeCell<SrwLock>,
    cs: UnsafeCell<CriticalSection>,
}

impl WinLock {
    const fn unlocked(kind: MutexKind) -> Self {
        Self {
            kind,
            srw: UnsafeCell::new(SrwLock::INIT),
            cs: UnsafeCell::new(CriticalSection::ZEROED),
        }
    }
}

// SAFETY: the native lock is only touched through kernel32 calls, which
// synchronize internally; `kind` is immutable after initialization.
unsafe impl Sync for WinLock {}

#[repr(C)]
struct WinCond {
    raw: UnsafeCell<ConditionVariable>,
}

// SAFETY: only touched through kernel32 condition variable calls.
unsafe impl Sync for WinCond {}

// ---------------------------------------------------------------------------
// Fallback statics
// ---------------------------------------------------------------------------

static FALLBACK_NON_REENTRANT: WinLock = WinLock::unlocked(MutexKind::NonReentrant);
static FALLBACK_REENTRANT: WinLock = WinLock::unlocked(MutexKind::Reentrant);
static FALLBACK_REENTRANT_INIT: Once = Once::new();
static FALLBACK_COND: WinCond = WinCond {
    raw: UnsafeCell::new(ConditionVariable::INIT),
};

fn fallback_mutex_record(kind: MutexKind) -> &'static WinLock {
    match kind {
        MutexKind::NonReentrant => &FALLBACK_NON_REENTRANT,
        MutexKind::Reentrant => {
            FALLBACK_REENTRANT_INIT.call_once(|| {
                // SAFETY: the record is not handed out until this returns.
                unsafe { InitializeCriticalSection(FALLBACK_REENTRANT.cs.get()) };
            });
            &FALLBACK_REENTRANT
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Record behind a mutex handle, or `None` for null, stale and foreign handles.
fn mutex_record(handle: MutexHandle) -> Option<*mut WinLock> {
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
fn cond_record(handle: CondVarHandle) -> Option<*mut WinCond> {
    let bits = handle.bits();
    if bits == addr_of!(FALLBACK_COND).addr() {
        return Some(ptr::from_ref(&FALLBACK_COND).cast_mut());
    }
    global_live().resolve(bits, Primitive::CondVar)
}

/// Lock record behind a handle. Panics on null, stale and foreign handles.
///
/// The handle must not be freed while the reference is in use.
unsafe fn win_lock<'a>(handle: MutexHandle) -> &'a WinLock {
    let Some(record) = mutex_record(handle) else {
        panic!("invalid mutex handle");
    };
    // SAFETY: `record` is a live WinLock; the caller keeps it alive.
    unsafe { &*record }
}

/// Native condition variable behind a handle.
///
/// The handle must not be freed while the returned pointer is in use.
unsafe fn raw_cond(handle: CondVarHandle) -> SyncResult<*mut ConditionVariable> {
    let record = cond_record(handle).ok_or(SyncError::InvalidArgument("invalid condition variable"))?;
    // SAFETY: `record` is a live WinCond; the caller keeps it alive.
    Ok(UnsafeCell::raw_get(unsafe { addr_of!((*record).raw) }))
}

/// Map a `SleepConditionVariable*` result.
fn wait_status(ok: Bool, last_error: u32) -> SyncResult {
    if ok != 0 {
        Ok(())
    } else if last_error == ERROR_TIMEOUT {
        Err(SyncError::OperationTimedOut)
    } else {
        Err(SyncError::WaitFailed(last_error as i32))
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

/// kernel32-backed implementation of [`SyncBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsBackend<A = SystemAlloc>(PhantomData<A>);

// SAFETY: every handle this backend returns is a registry token for a record
// it initialized, or the address of a fallback static; entrypoints resolve
// handles before touching native state.
unsafe impl<A: RawAlloc> SyncBackend for WindowsBackend<A> {
    const NAME: &'static str = "windows";

    fn try_create_mutex(kind: MutexKind) -> SyncResult<MutexHandle> {
        let record = alloc_record::<WinLock, A>()?;
        // SAFETY: fresh, exclusively owned, zeroed storage for a WinLock. A
        // zeroed SRWLOCK is SRWLOCK_INIT.
        unsafe {
            (*record).kind = kind;
            if kind.is_reentrant() {
                InitializeCriticalSection((*record).cs.get());
            }
        }
        let Some(token) = global_live().register(record, Primitive::Mutex) else {
            // SAFETY: the lock was initialized above and was never shared.
            unsafe {
                if kind.is_reentrant() {
                    DeleteCriticalSection((*record).cs.get());
                }
                dealloc_record::<WinLock, A>(record);
            }
            return Err(SyncError::OutOfMemory);
        };
        let handle = MutexHandle::from_token(token);
        trace!(kind = kind.name(), handle = ?handle.as_raw(), "created win32 mutex");
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
        // SAFETY: caller keeps the handle alive; invalid handles panic in `win_lock`.
        let lock = unsafe { win_lock(handle) };
        // SAFETY: the primitive matching `kind` was initialized at creation.
        unsafe {
            if lock.kind.is_reentrant() {
                EnterCriticalSection(lock.cs.get());
            } else {
                AcquireSRWLockExclusive(lock.srw.get());
            }
        }
    }

    unsafe fn unlock_mutex(handle: MutexHandle) {
        // SAFETY: caller keeps the handle alive; invalid handles panic in `win_lock`.
        let lock = unsafe { win_lock(handle) };
        // SAFETY: this thread holds the primitive matching `kind`, which was
        // initialized at creation.
        unsafe {
            if lock.kind.is_reentrant() {
                LeaveCriticalSection(lock.cs.get());
            } else {
                ReleaseSRWLockExclusive(lock.srw.get());
            }
        }
    }

    unsafe fn try_lock_mutex(handle: MutexHandle) -> bool {
        // SAFETY: caller keeps the handle alive; invalid handles panic in `win_lock`.
        let lock = unsafe { win_lock(handle) };
        // SAFETY: the primitive matching `kind` was initialized at creation.
        unsafe {
            if lock.kind.is_reentrant() {
                TryEnterCriticalSection(lock.cs.get()) != 0
            } else {
                TryAcquireSRWLockExclusive(lock.srw.get()) != 0
            }
        }
    }

    unsafe fn free_mutex(handle: MutexHandle) {
        if handle.is_null() {
            return;
        }
        if Self::is_fallback_mutex(handle) {
            trace!("free of shared fallback mutex is a no-op");
            return;
        }
        let Some(record) = global_live().retire::<WinLock>(handle.bits(), Primitive::Mutex) else {
            debug!(handle = ?handle.as_raw(), "ignoring free of unknown or already freed mutex");
            return;
        };
        // SAFETY: the registry handed us sole ownership of a live record.
        let kind = unsafe { (*record).kind };
        if kind.is_reentrant() {
            // SAFETY: critical section was initialized at creation.
            unsafe { DeleteCriticalSection((*record).cs.get()) };
        }
        // SAFETY: record came from `alloc_record::<WinLock, A>`.
        unsafe { dealloc_record::<WinLock, A>(record) };
        trace!(kind = kind.name(), handle = ?handle.as_raw(), "freed win32 mutex");
    }

    fn try_create_cond_var() -> SyncResult<CondVarHandle> {
        let record = alloc_record::<WinCond, A>()?;
        // SAFETY: fresh, exclusively owned storage for a WinCond.
        unsafe { InitializeConditionVariable((*record).raw.get()) };
        let Some(token) = global_live().register(record, Primitive::CondVar) else {
            // SAFETY: nothing else references the record.
            unsafe { dealloc_record::<WinCond, A>(record) };
            return Err(SyncError::OutOfMemory);
        };
        let handle = CondVarHandle::from_token(token);
        trace!(handle = ?handle.as_raw(), "created win32 condition variable");
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
        unsafe { WakeConditionVariable(cond) };
        Ok(())
    }

    unsafe fn broadcast_cond_var(handle: CondVarHandle) -> SyncResult {
        // SAFETY: caller keeps the handle alive for the call.
        let cond = unsafe { raw_cond(handle) }?;
        // SAFETY: `cond` is a live, initialized condition variable.
        unsafe { WakeAllConditionVariable(cond) };
        Ok(())
    }

    unsafe fn wait_cond_var(
        handle: CondVarHandle,
        mutex: MutexHandle,
        timeout: Timeout,
    ) -> SyncResult {
        // SAFETY: caller keeps the handle alive for the call.
        let cond = unsafe { raw_cond(handle) }?;
        let lock = mutex_record(mutex).ok_or(SyncError::InvalidArgument("invalid mutex"))?;
        let millis = timeout.as_win32_millis();
        // SAFETY: both handles resolved to live records the caller keeps
        // alive, and this thread holds `mutex`; the SRW lock is held
        // exclusively, so it is reacquired exclusively.
        let (ok, last_error) = unsafe {
            let lock = &*lock;
            let ok = if lock.kind.is_reentrant() {
                SleepConditionVariableCS(cond, lock.cs.get(), millis)
            } else {
                SleepConditionVariableSRW(
                    cond,
                    lock.srw.get(),
                    millis,
                    CONDITION_VARIABLE_LOCKMODE_EXCLUSIVE,
                )
            };
            (ok, if ok == 0 { GetLastError() } else { 0 })
        };
        wait_status(ok, last_error)
    }

    unsafe fn free_cond_var(handle: CondVarHandle) {
        if handle.is_null() {
            return;
        }
        if Self::is_fallback_cond_var(handle) {
            trace!("free of shared fallback condition variable is a no-op");
            return;
        }
        let Some(record) = global_live().retire::<WinCond>(handle.bits(), Primitive::CondVar)
        else {
            debug!(handle = ?handle.as_raw(), "ignoring free of unknown or already freed condition variable");
            return;
        };
        // Windows condition variables need no destroy step.
        // SAFETY: record came from `alloc_record::<WinCond, A>`.
        unsafe { dealloc_record::<WinCond, A>(record) };
        trace!(handle = ?handle.as_raw(), "freed win32 condition variable");
    }
}
