//! Opaque handles for mutexes and condition variables.
//!
//! A handle is pointer-sized and names a backend-owned record in one of two
//! encodings:
//!
//! - a dynamically created primitive is a tagged registry token (low bit set)
//!   carrying a slot index and a generation, so a handle that outlives its
//!   primitive never resolves to a newer one;
//! - a process-wide fallback is the address of its static record.
//!
//! Handles are plain `Copy` values; ownership is by convention, and the
//! creator releases each handle exactly once. Repeated frees are tolerated.
//!
//! Only backends mint handles. Code without `unsafe` cannot build one from an
//! arbitrary value:
//!
//! ```compile_fail
//! # #![forbid(unsafe_code)]
//! use portsync_sys::MutexHandle;
//!
//! let forged = MutexHandle::from_raw(0x10 as *mut std::ffi::c_void);
//! ```

use std::ffi::c_void;

/// Opaque reference to a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MutexHandle(*mut c_void);

/// Opaque reference to a condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CondVarHandle(*mut c_void);

// SAFETY: handles only name native synchronization objects, which are built
// to be shared across threads. The pointee is never accessed without going
// through a backend entrypoint.
unsafe impl Send for MutexHandle {}
unsafe impl Sync for MutexHandle {}
unsafe impl Send for CondVarHandle {}
unsafe impl Sync for CondVarHandle {}

macro_rules! handle_common {
    ($ty:ident) => {
        impl $ty {
            /// The null handle. Freeing it is a no-op.
            pub const NULL: Self = Self(std::ptr::null_mut());

            /// Rebuild a handle from [`Self::as_raw`].
            ///
            /// # Safety
            ///
            /// `raw` must be null or a value obtained from `as_raw` on a
            /// handle of the same type. A handle that does not name a live
            /// primitive must not reach the wrappers in [`crate::sync`].
            #[must_use]
            pub const unsafe fn from_raw(raw: *mut c_void) -> Self {
                Self(raw)
            }

            /// The raw handle value, for passing through foreign code.
            #[must_use]
            pub const fn as_raw(self) -> *mut c_void {
                self.0
            }

            /// Returns true for the null handle.
            #[must_use]
            pub fn is_null(self) -> bool {
                self.0.is_null()
            }

            /// Handle for a registry token.
            pub(crate) fn from_token(token: usize) -> Self {
                Self(std::ptr::without_provenance_mut(token))
            }

            /// Handle naming a static fallback record.
            pub(crate) fn from_static<T>(record: &'static T) -> Self {
                Self(std::ptr::from_ref(record).cast_mut().cast())
            }

            pub(crate) fn bits(self) -> usize {
                self.0.addr()
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::NULL
            }
        }
    };
}

handle_common!(MutexHandle);
handle_common!(CondVarHandle);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles() {
        assert!(MutexHandle::NULL.is_null());
        assert!(CondVarHandle::default().is_null());
        assert_eq!(MutexHandle::default(), MutexHandle::NULL);
        assert_eq!(MutexHandle::NULL.bits(), 0);
    }

    #[test]
    fn raw_round_trip() {
        let h = MutexHandle::from_token(0x0001_0003);
        assert!(!h.is_null());
        // SAFETY: the value came from `as_raw` on a mutex handle.
        let back = unsafe { MutexHandle::from_raw(h.as_raw()) };
        assert_eq!(back, h);
        assert_eq!(back.bits(), 0x0001_0003);
    }

    #[test]
    fn static_handles_carry_the_record_address() {
        static RECORD: u64 = 0;
        let h = CondVarHandle::from_static(&RECORD);
        assert_eq!(h.bits(), std::ptr::from_ref(&RECORD).addr());
    }
}
