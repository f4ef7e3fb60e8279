//! Backend capability contract.
//!
//! Exactly one backend is compiled per target and exposed as
//! [`NativeBackend`]; there is no runtime switch between POSIX and Windows.
//! Both implement [`SyncBackend`] with identical external contracts, so the
//! dispatch table and the tests treat them interchangeably.

use std::sync::atomic::{AtomicU64, Ordering};

use portsync_core::{MutexKind, SyncResult, Timeout, fallback_policy};
use tracing::warn;

use crate::alloc::SystemAlloc;
use crate::handle::{CondVarHandle, MutexHandle};

/// The backend selected for this build target.
#[cfg(unix)]
pub type NativeBackend<A = SystemAlloc> = crate::posix::PosixBackend<A>;
/// The backend selected for this build target.
#[cfg(windows)]
pub type NativeBackend<A = SystemAlloc> = crate::windows::WindowsBackend<A>;

static FALLBACK_MUTEX_SUBSTITUTIONS: AtomicU64 = AtomicU64::new(0);
static FALLBACK_COND_SUBSTITUTIONS: AtomicU64 = AtomicU64::new(0);

/// Mutex and condition-variable operations over opaque handles.
///
/// Handle-taking operations are `unsafe`: the handle must be one returned by
/// this backend's create operations and not yet freed (null is accepted
/// where documented).
///
/// # Safety
///
/// [`crate::SyncOps::of`] builds a table from any implementor, and the safe
/// wrappers in [`crate::sync`] pass whatever its create operations return
/// straight to the handle-taking ones. Implementors promise that:
///
/// - `create_*`, `try_create_*` and `fallback_*` only return handles the
///   same implementation's operations accept;
/// - operations on a handle that is live and used per the contract above are
///   memory safe, including from several threads at once;
/// - `free_*` leaves fallback handles usable.
pub unsafe trait SyncBackend {
    /// Short backend name for logs and reports.
    const NAME: &'static str;

    /// Allocate and initialize a dedicated mutex, reporting failure.
    fn try_create_mutex(kind: MutexKind) -> SyncResult<MutexHandle>;

    /// The process-wide fallback mutex for `kind`. Never freed.
    fn fallback_mutex(kind: MutexKind) -> MutexHandle;

    /// Returns true if `handle` is one of the two fallback mutexes.
    fn is_fallback_mutex(handle: MutexHandle) -> bool;

    /// Blocking exclusive acquire. Panics on a null handle.
    unsafe fn lock_mutex(handle: MutexHandle);

    /// Release one hold. Panics on a null handle.
    unsafe fn unlock_mutex(handle: MutexHandle);

    /// Non-blocking acquire attempt. Panics on a null handle.
    unsafe fn try_lock_mutex(handle: MutexHandle) -> bool;

    /// Destroy and release a mutex. Null, fallback and already-freed handles
    /// are no-ops.
    unsafe fn free_mutex(handle: MutexHandle);

    /// Allocate and initialize a dedicated condition variable, reporting failure.
    fn try_create_cond_var() -> SyncResult<CondVarHandle>;

    /// The process-wide fallback condition variable. Never freed.
    fn fallback_cond_var() -> CondVarHandle;

    /// Returns true if `handle` is the fallback condition variable.
    fn is_fallback_cond_var(handle: CondVarHandle) -> bool;

    /// Wake one waiter. `InvalidArgument` on a null handle.
    unsafe fn signal_cond_var(handle: CondVarHandle) -> SyncResult;

    /// Wake all current waiters. `InvalidArgument` on a null handle.
    unsafe fn broadcast_cond_var(handle: CondVarHandle) -> SyncResult;

    /// Atomically release `mutex`, wait for a wakeup or `timeout`, and
    /// reacquire `mutex` before returning. The caller must hold `mutex`.
    unsafe fn wait_cond_var(
        handle: CondVarHandle,
        mutex: MutexHandle,
        timeout: Timeout,
    ) -> SyncResult;

    /// Destroy and release a condition variable. Null, fallback and
    /// already-freed handles are no-ops.
    unsafe fn free_cond_var(handle: CondVarHandle);

    /// Create a mutex, substituting the shared fallback on failure.
    ///
    /// # Panics
    ///
    /// Under [`portsync_core::FallbackPolicy::Strict`], panics instead of
    /// substituting.
    fn create_mutex(kind: MutexKind) -> MutexHandle {
        match Self::try_create_mutex(kind) {
            Ok(handle) => handle,
            Err(err) => {
                assert!(
                    fallback_policy().allows_fallback(),
                    "{} mutex creation failed under strict fallback policy: {err}",
                    kind.name()
                );
                FALLBACK_MUTEX_SUBSTITUTIONS.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend = Self::NAME,
                    kind = kind.name(),
                    error = %err,
                    "substituting shared fallback mutex"
                );
                Self::fallback_mutex(kind)
            }
        }
    }

    /// Create a condition variable, substituting the shared fallback on failure.
    ///
    /// # Panics
    ///
    /// Under [`portsync_core::FallbackPolicy::Strict`], panics instead of
    /// substituting.
    fn create_cond_var() -> CondVarHandle {
        match Self::try_create_cond_var() {
            Ok(handle) => handle,
            Err(err) => {
                assert!(
                    fallback_policy().allows_fallback(),
                    "condition variable creation failed under strict fallback policy: {err}"
                );
                FALLBACK_COND_SUBSTITUTIONS.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backend = Self::NAME,
                    error = %err,
                    "substituting shared fallback condition variable"
                );
                Self::fallback_cond_var()
            }
        }
    }
}

/// Snapshot of (mutex, condition variable) fallback substitutions so far.
#[must_use]
pub fn fallback_substitutions() -> (u64, u64) {
    (
        FALLBACK_MUTEX_SUBSTITUTIONS.load(Ordering::Relaxed),
        FALLBACK_COND_SUBSTITUTIONS.load(Ordering::Relaxed),
    )
}
