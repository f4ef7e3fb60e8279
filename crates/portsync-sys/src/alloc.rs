//! Allocation seam for backend records.
//!
//! Backends obtain zero-initialized memory for each primitive from a
//! [`RawAlloc`] and hand it back with the same layout. The default
//! [`SystemAlloc`] forwards to the global allocator; tests substitute an
//! allocator that always fails to drive the fallback path.

use std::alloc::Layout;

/// Zero-initialized allocation and matching deallocation.
pub trait RawAlloc {
    /// Allocate zeroed memory for `layout`. Returns null on failure.
    fn alloc_zeroed(layout: Layout) -> *mut u8;

    /// Release memory previously returned by [`RawAlloc::alloc_zeroed`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_zeroed` of the same allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn dealloc(ptr: *mut u8, layout: Layout);
}

/// The process global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAlloc;

impl RawAlloc for SystemAlloc {
    fn alloc_zeroed(layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: layout has non-zero size.
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    unsafe fn dealloc(ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: caller guarantees `ptr`/`layout` came from `alloc_zeroed`.
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}
