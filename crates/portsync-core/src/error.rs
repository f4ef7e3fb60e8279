//! Error taxonomy for synchronization operations.
//!
//! Only condition-variable signal/broadcast/wait and the explicit
//! `try_create_*` constructors return these. Lock, unlock, try-lock and free
//! never report recoverable errors: they assume a valid handle and fault on
//! misuse.

use thiserror::Error;

/// Failure of a synchronization operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SyncError {
    /// A null or otherwise invalid handle was passed in.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The native signal/broadcast call failed.
    #[error("native condition variable operation failed (os error {0})")]
    InvalidOperation(i32),
    /// The native wait call failed for a reason other than timeout.
    #[error("condition variable wait failed (os error {0})")]
    WaitFailed(i32),
    /// The native wait call reached its deadline before being woken.
    #[error("operation timed out")]
    OperationTimedOut,
    /// Backing memory for a new primitive could not be allocated.
    #[error("out of memory allocating synchronization primitive")]
    OutOfMemory,
    /// The native primitive could not be initialized.
    #[error("native primitive initialization failed (os error {0})")]
    InitFailed(i32),
}

impl SyncError {
    /// True when a wait ended because its timeout elapsed.
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        matches!(self, Self::OperationTimedOut)
    }

    /// The native OS code carried by this error, if any.
    #[must_use]
    pub const fn os_code(self) -> Option<i32> {
        match self {
            Self::InvalidOperation(code) | Self::WaitFailed(code) | Self::InitFailed(code) => {
                Some(code)
            }
            Self::InvalidArgument(_) | Self::OperationTimedOut | Self::OutOfMemory => None,
        }
    }
}

/// Result alias used across portsync.
pub type SyncResult<T = ()> = Result<T, SyncError>;
