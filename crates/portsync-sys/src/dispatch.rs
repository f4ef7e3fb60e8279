//! Replaceable operation table and the consumer-facing entrypoints.
//!
//! [`SyncOps`] holds one function pointer per operation. It can be passed
//! explicitly to the components that need it (see [`crate::sync`]), or
//! installed process-wide with [`install`], after which the free functions in
//! this module forward through it. The default table is built from
//! [`NativeBackend`].
//!
//! Replace the table during single-threaded initialization. Calls already in
//! flight keep the table they started with, and a handle must be released
//! through the same backend that created it.
//!
//! The wrappers trust every handle a table's create slots return, so a table
//! only comes from a [`SyncBackend`] (an `unsafe` trait) or from
//! [`SyncOps::from_slots`]. Safe code cannot patch a slot:
//!
//! ```compile_fail
//! use portsync_sys::{MutexHandle, SyncOps};
//!
//! let mut ops = SyncOps::native();
//! ops.slots.create_mutex = |_| MutexHandle::NULL;
//! ```
//!
//! ```compile_fail
//! use portsync_sys::SyncOps;
//!
//! let ops = SyncOps::from_slots("patched", SyncOps::native().slots());
//! ```

use parking_lot::{RwLock, const_rwlock};
use portsync_core::{MutexKind, SyncResult, Timeout};
use tracing::info;

use crate::backend::{NativeBackend, SyncBackend};
use crate::handle::{CondVarHandle, MutexHandle};

pub type CreateMutexFn = fn(bool) -> MutexHandle;
pub type TryCreateMutexFn = fn(bool) -> SyncResult<MutexHandle>;
pub type LockMutexFn = unsafe fn(MutexHandle);
pub type UnlockMutexFn = unsafe fn(MutexHandle);
pub type TryLockMutexFn = unsafe fn(MutexHandle) -> bool;
pub type FreeMutexFn = unsafe fn(MutexHandle);
pub type CreateCondVarFn = fn() -> CondVarHandle;
pub type TryCreateCondVarFn = fn() -> SyncResult<CondVarHandle>;
pub type SignalCondVarFn = unsafe fn(CondVarHandle) -> SyncResult;
pub type BroadcastCondVarFn = unsafe fn(CondVarHandle) -> SyncResult;
/// Wait slot; the timeout is raw 100ns ticks, `u64::MAX` meaning forever.
pub type WaitCondVarFn = unsafe fn(CondVarHandle, MutexHandle, u64) -> SyncResult;
pub type FreeCondVarFn = unsafe fn(CondVarHandle);

/// Raw slot values of a [`SyncOps`] table.
///
/// Building or reading one is safe; turning it into a table takes
/// [`SyncOps::from_slots`].
#[derive(Debug, Clone, Copy)]
pub struct SyncSlots {
    pub create_mutex: CreateMutexFn,
    pub try_create_mutex: TryCreateMutexFn,
    pub lock_mutex: LockMutexFn,
    pub unlock_mutex: UnlockMutexFn,
    pub try_lock_mutex: TryLockMutexFn,
    pub free_mutex: FreeMutexFn,
    pub create_cond_var: CreateCondVarFn,
    pub try_create_cond_var: TryCreateCondVarFn,
    pub signal_cond_var: SignalCondVarFn,
    pub broadcast_cond_var: BroadcastCondVarFn,
    pub wait_cond_var: WaitCondVarFn,
    pub free_cond_var: FreeCondVarFn,
}

/// One slot per synchronization operation, and the name reported for them.
#[derive(Debug, Clone, Copy)]
pub struct SyncOps {
    name: &'static str,
    pub(crate) slots: SyncSlots,
}

fn create_mutex_slot<B: SyncBackend>(reentrant: bool) -> MutexHandle {
    B::create_mutex(MutexKind::from_reentrant(reentrant))
}

fn try_create_mutex_slot<B: SyncBackend>(reentrant: bool) -> SyncResult<MutexHandle> {
    B::try_create_mutex(MutexKind::from_reentrant(reentrant))
}

unsafe fn wait_cond_var_slot<B: SyncBackend>(
    cv: CondVarHandle,
    mutex: MutexHandle,
    timeout: u64,
) -> SyncResult {
    // SAFETY: forwarded caller contract.
    unsafe { B::wait_cond_var(cv, mutex, Timeout::from_ticks(timeout)) }
}

impl SyncOps {
    /// Table forwarding every slot to backend `B`.
    #[must_use]
    pub fn of<B: SyncBackend>() -> Self {
        let slots = SyncSlots {
            create_mutex: create_mutex_slot::<B>,
            try_create_mutex: try_create_mutex_slot::<B>,
            lock_mutex: B::lock_mutex,
            unlock_mutex: B::unlock_mutex,
            try_lock_mutex: B::try_lock_mutex,
            free_mutex: B::free_mutex,
            create_cond_var: B::create_cond_var,
            try_create_cond_var: B::try_create_cond_var,
            signal_cond_var: B::signal_cond_var,
            broadcast_cond_var: B::broadcast_cond_var,
            wait_cond_var: wait_cond_var_slot::<B>,
            free_cond_var: B::free_cond_var,
        };
        Self {
            name: B::NAME,
            slots,
        }
    }

    /// Table over hand-assembled slots, typically a backend's
    /// [`SyncOps::slots`] with some of them wrapped.
    ///
    /// # Safety
    ///
    /// The slots together must uphold the [`SyncBackend`] contract: every
    /// handle the create slots return is accepted by the other slots, and
    /// those operate on it soundly.
    #[must_use]
    pub const unsafe fn from_slots(name: &'static str, slots: SyncSlots) -> Self {
        Self { name, slots }
    }

    /// Backend name, or the name given to [`SyncOps::from_slots`].
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Copy of the slot values.
    #[must_use]
    pub const fn slots(&self) -> SyncSlots {
        self.slots
    }

    /// Table for the backend compiled into this build.
    #[must_use]
    pub fn native() -> Self {
        Self::of::<NativeBackend>()
    }
}

impl Default for SyncOps {
    fn default() -> Self {
        Self::native()
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

// `None` means the native table.
static INSTALLED: RwLock<Option<SyncOps>> = const_rwlock(None);

/// Snapshot of the table the free functions currently forward to.
#[must_use]
pub fn current() -> SyncOps {
    (*INSTALLED.read()).unwrap_or_else(SyncOps::native)
}

/// Returns true while a table installed with [`install`] is in effect.
#[must_use]
pub fn is_replaced() -> bool {
    INSTALLED.read().is_some()
}

/// Replace the process-wide table, returning the previous one.
pub fn install(ops: SyncOps) -> SyncOps {
    let previous = INSTALLED.write().replace(ops);
    info!(backend = ops.name(), "synchronization dispatch table replaced");
    previous.unwrap_or_else(SyncOps::native)
}

/// Restore the native table.
pub fn reset() {
    INSTALLED.write().take();
    info!("synchronization dispatch table reset to native backend");
}

// ---------------------------------------------------------------------------
// Entrypoints
// ---------------------------------------------------------------------------

/// Create a mutex. Never fails under the default fallback policy.
#[must_use]
pub fn create_mutex(reentrant: bool) -> MutexHandle {
    (current().slots.create_mutex)(reentrant)
}

/// Create a mutex, surfacing allocation or init failure instead of falling back.
pub fn try_create_mutex(reentrant: bool) -> SyncResult<MutexHandle> {
    (current().slots.try_create_mutex)(reentrant)
}

/// Blocking exclusive acquire.
pub unsafe fn lock_mutex(mutex: MutexHandle) {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.lock_mutex)(mutex) }
}

/// Release one hold.
pub unsafe fn unlock_mutex(mutex: MutexHandle) {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.unlock_mutex)(mutex) }
}

/// Non-blocking acquire attempt.
pub unsafe fn try_lock_mutex(mutex: MutexHandle) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.try_lock_mutex)(mutex) }
}

/// Release a mutex. Idempotent.
pub unsafe fn free_mutex(mutex: MutexHandle) {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.free_mutex)(mutex) }
}

/// Create a condition variable. Never fails under the default fallback policy.
#[must_use]
pub fn create_cond_var() -> CondVarHandle {
    (current().slots.create_cond_var)()
}

/// Create a condition variable, surfacing failure instead of falling back.
pub fn try_create_cond_var() -> SyncResult<CondVarHandle> {
    (current().slots.try_create_cond_var)()
}

/// Wake one waiter.
pub unsafe fn signal_cond_var(cv: CondVarHandle) -> SyncResult {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.signal_cond_var)(cv) }
}

/// Wake every current waiter.
pub unsafe fn broadcast_cond_var(cv: CondVarHandle) -> SyncResult {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.broadcast_cond_var)(cv) }
}

/// Wait on `cv`, releasing and reacquiring `mutex`. `timeout` is in 100ns
/// ticks; [`portsync_core::INFINITE_TIME_VALUE`] waits forever.
pub unsafe fn wait_cond_var(cv: CondVarHandle, mutex: MutexHandle, timeout: u64) -> SyncResult {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.wait_cond_var)(cv, mutex, timeout) }
}

/// Release a condition variable. Idempotent.
pub unsafe fn free_cond_var(cv: CondVarHandle) {
    // SAFETY: forwarded caller contract.
    unsafe { (current().slots.free_cond_var)(cv) }
}
