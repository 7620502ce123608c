//! System allocator seam
//!
//! Every byte a pool hands out ultimately comes from a [`RawAllocator`]:
//! block memory, large allocations and aligned allocations. The default
//! [`SystemAllocator`] delegates to `std::alloc::System`; tests swap in
//! allocators that fail on demand.
//!
//! # Safety
//!
//! Implementors must return memory that is valid for reads and writes of
//! `layout.size()` bytes, aligned to `layout.align()`, and not aliased by any
//! other live allocation. `deallocate` is only ever called with a pointer and
//! layout previously returned from / passed to `allocate` on the same
//! allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use std::alloc::System;

/// Raw memory source for a pool
///
/// # Safety
///
/// See the module documentation for the contract implementors must uphold.
pub unsafe trait RawAllocator {
    /// Allocates memory for `layout`; `None` means the allocator is exhausted
    ///
    /// `layout.size()` is never zero when called by a pool.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases memory previously returned by [`allocate`](Self::allocate)
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `allocate` on this allocator
    /// - `layout` must be the layout passed to that call
    /// - `ptr` must not be used afterwards
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Wrapper for the system's default allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    /// Creates a new SystemAllocator
    #[inline]
    pub const fn new() -> Self {
        Self
    }
}

// SAFETY: delegates to `System`, which upholds the GlobalAlloc contract for
// non-zero-sized layouts; pools never request zero-sized layouts.
unsafe impl RawAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has non-zero size (pool contract, asserted above).
        NonNull::new(unsafe { System.alloc(layout) })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from `allocate`.
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
    }
}

// SAFETY: forwards to the referenced allocator unchanged.
unsafe impl<A: RawAllocator + ?Sized> RawAllocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: same contract as the referenced allocator.
        unsafe { (**self).deallocate(ptr, layout) };
    }
}
