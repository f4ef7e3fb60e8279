//! Owning wrappers over the handle API.
//!
//! [`Mutex`] and [`Condvar`] create their handle through a [`SyncOps`] table,
//! remember that table, and release the handle through it on drop, so a
//! wrapper always talks to the backend that produced it. Locking returns a
//! [`MutexGuard`] that unlocks when dropped.

use std::marker::PhantomData;
use std::time::Instant;

use portsync_core::{MutexKind, SyncError, SyncResult, Timeout};

use crate::dispatch::{self, SyncOps};
use crate::handle::{CondVarHandle, MutexHandle};

/// An owned mutex handle.
#[derive(Debug)]
pub struct Mutex {
    handle: MutexHandle,
    kind: MutexKind,
    ops: SyncOps,
}

impl Mutex {
    /// Create a mutex through the installed dispatch table.
    #[must_use]
    pub fn new(kind: MutexKind) -> Self {
        Self::with_ops(dispatch::current(), kind)
    }

    /// Create a mutex through an explicit table.
    #[must_use]
    pub fn with_ops(ops: SyncOps, kind: MutexKind) -> Self {
        let handle = (ops.slots.create_mutex)(kind.is_reentrant());
        Self { handle, kind, ops }
    }

    /// Create a mutex through an explicit table, refusing the shared fallback.
    pub fn try_with_ops(ops: SyncOps, kind: MutexKind) -> SyncResult<Self> {
        let handle = (ops.slots.try_create_mutex)(kind.is_reentrant())?;
        Ok(Self { handle, kind, ops })
    }

    /// Category fixed at creation.
    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// The underlying handle, still owned by `self`.
    #[must_use]
    pub fn handle(&self) -> MutexHandle {
        self.handle
    }

    /// Block until the lock is held.
    ///
    /// Relocking a non-reentrant mutex from the thread that holds it
    /// deadlocks.
    pub fn lock(&self) -> MutexGuard<'_> {
        // SAFETY: `self.handle` is live until `self` drops.
        unsafe { (self.ops.slots.lock_mutex)(self.handle) };
        MutexGuard::new(self)
    }

    /// Acquire without blocking, or `None` if the lock is unavailable.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        // SAFETY: `self.handle` is live until `self` drops.
        if unsafe { (self.ops.slots.try_lock_mutex)(self.handle) } {
            Some(MutexGuard::new(self))
        } else {
            None
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // SAFETY: no guard outlives `self`, and this is the only release.
        unsafe { (self.ops.slots.free_mutex)(self.handle) };
    }
}

/// Proof that the current thread holds a [`Mutex`]. Unlocks on drop.
#[derive(Debug)]
#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    // Native locks must be released by the thread that acquired them.
    _not_send: PhantomData<*const ()>,
}

impl<'a> MutexGuard<'a> {
    fn new(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard holds.
    #[must_use]
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the lock.
        unsafe { (self.mutex.ops.slots.unlock_mutex)(self.mutex.handle) };
    }
}

/// An owned condition variable handle.
#[derive(Debug)]
pub struct Condvar {
    handle: CondVarHandle,
    ops: SyncOps,
}

impl Condvar {
    /// Create a condition variable through the installed dispatch table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ops(dispatch::current())
    }

    /// Create a condition variable through an explicit table.
    #[must_use]
    pub fn with_ops(ops: SyncOps) -> Self {
        let handle = (ops.slots.create_cond_var)();
        Self { handle, ops }
    }

    /// Create through an explicit table, refusing the shared fallback.
    pub fn try_with_ops(ops: SyncOps) -> SyncResult<Self> {
        let handle = (ops.slots.try_create_cond_var)()?;
        Ok(Self { handle, ops })
    }

    /// The underlying handle, still owned by `self`.
    #[must_use]
    pub fn handle(&self) -> CondVarHandle {
        self.handle
    }

    /// Wake one waiter.
    pub fn signal(&self) -> SyncResult {
        // SAFETY: `self.handle` is live until `self` drops.
        unsafe { (self.ops.slots.signal_cond_var)(self.handle) }
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) -> SyncResult {
        // SAFETY: `self.handle` is live until `self` drops.
        unsafe { (self.ops.slots.broadcast_cond_var)(self.handle) }
    }

    /// Release the guarded mutex, wait for a wakeup or `timeout`, and
    /// reacquire the mutex before returning, whatever the outcome.
    ///
    /// A reentrant mutex must be held exactly once when waiting.
    pub fn wait(&self, guard: &mut MutexGuard<'_>, timeout: impl Into<Timeout>) -> SyncResult {
        let timeout = timeout.into();
        // SAFETY: both handles are live, and the guard proves this thread
        // holds the mutex.
        unsafe { (self.ops.slots.wait_cond_var)(self.handle, guard.mutex.handle, timeout.ticks()) }
    }

    /// Wait until `condition` returns false, absorbing spurious wakeups.
    ///
    /// `timeout` bounds the whole call, not each individual wait.
    pub fn wait_while<F>(
        &self,
        guard: &mut MutexGuard<'_>,
        timeout: impl Into<Timeout>,
        mut condition: F,
    ) -> SyncResult
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout
            .into()
            .as_duration()
            .and_then(|d| Instant::now().checked_add(d));
        while condition() {
            let remaining = match deadline {
                None => Timeout::INFINITE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SyncError::OperationTimedOut);
                    }
                    Timeout::from_duration(deadline - now)
                }
            };
            match self.wait(guard, remaining) {
                Ok(()) | Err(SyncError::OperationTimedOut) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        // SAFETY: this is the only release of the handle.
        unsafe { (self.ops.slots.free_cond_var)(self.handle) };
    }
}
