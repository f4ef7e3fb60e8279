//! # portsync-sys
//!
//! Platform layer for portsync mutexes and condition variables.
//!
//! Consumers call the operations in [`dispatch`], which forward to whichever
//! [`SyncOps`] table is installed. The default table is built from the one
//! backend compiled for the target: pthreads on Unix, critical sections / SRW
//! locks / `CONDITION_VARIABLE` on Windows.
//!
//! # Architecture
//!
//! ```text
//! caller -> dispatch (SyncOps slot) -> SyncBackend impl -> native primitive
//!                                            |
//!                                            +-> fallback static (allocation failed)
//! ```
//!
//! Creation never fails under the default policy: when a dedicated primitive
//! cannot be allocated or initialized, a process-wide fallback of the same
//! category is handed out instead. See [`portsync_core::config`].
//!
//! # Safety
//!
//! Every `unsafe fn` in [`dispatch`] and on [`SyncBackend`] that takes a
//! handle has the same contract: the handle comes from the matching create
//! operation of the same table and is not freed while the call runs. Null,
//! stale and freed handles are rejected (see [`handle`]). The owning wrappers
//! in [`sync`] uphold the contract themselves.

#![allow(clippy::missing_safety_doc)]

pub mod alloc;
pub mod backend;
pub mod dispatch;
pub mod handle;
mod live;
pub mod sync;

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

pub use alloc::{RawAlloc, SystemAlloc};
pub use backend::{NativeBackend, SyncBackend};
pub use dispatch::{SyncOps, SyncSlots};
pub use handle::{CondVarHandle, MutexHandle};
pub use live::live_primitive_count;
pub use sync::{Condvar, Mutex, MutexGuard};

pub use portsync_core::{
    FallbackPolicy, INFINITE_TIME_VALUE, MutexKind, SyncError, SyncResult, Timeout,
};
