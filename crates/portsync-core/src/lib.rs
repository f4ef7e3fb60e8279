//! # portsync-core
//!
//! Platform-free contracts shared by every portsync backend.
//!
//! This crate holds the pieces of the synchronization layer that do not touch
//! the operating system: the 100-nanosecond tick timeout contract, the mutex
//! category and its transition contract, the error taxonomy returned by
//! condition-variable operations, and the process-wide fallback policy.
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod mutex;
pub mod timeout;

pub use config::{FallbackPolicy, fallback_policy, set_fallback_policy};
pub use error::{SyncError, SyncResult};
pub use mutex::MutexKind;
pub use timeout::{Deadline, INFINITE_TIME_VALUE, Timeout};
