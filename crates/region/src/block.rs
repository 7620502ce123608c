//! Blocks: contiguous segments carved by a bump cursor
//!
//! ## Invariants
//!
//! - `0 <= cursor <= capacity`, i.e. `base <= base + cursor <= limit`
//! - `cursor` only moves forward until [`Block::reset`]
//! - the segment is released exactly once, by [`Block::release`]

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::config::POOL_ALIGNMENT;
use crate::sys::RawAllocator;
use crate::utils::checked_align_up;

/// One memory segment of a pool's chain
pub(crate) struct Block {
    base: NonNull<u8>,
    layout: Layout,
    cursor: usize,
    failed: u32,
}

impl Block {
    /// Obtains a `size`-byte segment from `alloc`
    ///
    /// Returns `None` when the allocator is exhausted or `size` cannot be laid
    /// out; the pool turns that into `AllocationFailed`.
    pub(crate) fn allocate<A: RawAllocator>(alloc: &A, size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, POOL_ALIGNMENT).ok()?;
        let base = alloc.allocate(layout)?;

        Some(Self {
            base,
            layout,
            cursor: 0,
            failed: 0,
        })
    }

    /// Carves `size` bytes aligned to `align`, or `None` if they don't fit
    #[inline]
    pub(crate) fn try_bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.base.as_ptr() as usize;
        let aligned = checked_align_up(base.checked_add(self.cursor)?, align)?;
        let offset = aligned - base;
        let end = offset.checked_add(size)?;

        if end > self.layout.size() {
            return None;
        }

        self.cursor = end;
        debug_assert!(self.cursor <= self.layout.size());

        // SAFETY: offset <= end <= capacity, so the result stays inside (or
        // one past the end of) the segment allocated in `allocate`.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Total bytes in this segment
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes handed out (including alignment padding)
    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes still available after the cursor
    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.layout.size() - self.cursor
    }

    #[inline]
    pub(crate) fn failed(&self) -> u32 {
        self.failed
    }

    /// Records that block growth passed over this block
    ///
    /// Returns the count before the increment.
    #[inline]
    pub(crate) fn record_failure(&mut self) -> u32 {
        let previous = self.failed;
        self.failed = previous.saturating_add(1);
        previous
    }

    /// Whether `ptr` points into `[base, limit)`
    #[inline]
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.layout.size()
    }

    /// Rewinds the cursor to the start and clears the failure count
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
        self.failed = 0;
    }

    /// Returns the segment to `alloc`
    ///
    /// # Safety
    ///
    /// `alloc` must be the allocator the block was obtained from, and no
    /// pointer into the block may be used afterwards.
    pub(crate) unsafe fn release<A: RawAllocator>(self, alloc: &A) {
        // SAFETY: base/layout are exactly what `allocate` received from
        // `alloc` (caller contract).
        unsafe { alloc.deallocate(self.base, self.layout) };
    }
}
