//! Tracker for allocations too large (or too aligned) for block memory
//!
//! Entries are kept newest-first: the last element of `entries` is the head
//! of the list. Freeing empties a slot but keeps the node, and insertion
//! probes a few nodes from the head for an empty slot before pushing, so
//! alloc/free churn of large buffers does not grow the list.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::sys::RawAllocator;

/// One large allocation owned by a pool
#[derive(Debug)]
pub(crate) struct LargeAlloc {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) layout: Layout,
}

impl LargeAlloc {
    /// Returns the payload to `alloc`
    ///
    /// # Safety
    ///
    /// `alloc` must be the allocator that produced `ptr` with `layout`.
    pub(crate) unsafe fn release<A: RawAllocator>(self, alloc: &A) {
        // SAFETY: caller contract.
        unsafe { alloc.deallocate(self.ptr, self.layout) };
    }
}

/// Whether [`LargeList::insert`] reused a node or pushed a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Reused,
    Pushed,
}

#[derive(Debug, Default)]
pub(crate) struct LargeList {
    entries: Vec<Option<LargeAlloc>>,
}

impl LargeList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tracks `alloc`, reusing one of the first `scan` nodes from the head if empty
    ///
    /// Gives the allocation back if a new node is needed and cannot be
    /// reserved, so the caller can release it.
    pub(crate) fn insert(&mut self, alloc: LargeAlloc, scan: usize) -> Result<Slot, LargeAlloc> {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .rev()
            .take(scan)
            .find(|slot| slot.is_none())
        {
            *slot = Some(alloc);
            return Ok(Slot::Reused);
        }

        if self.entries.try_reserve(1).is_err() {
            return Err(alloc);
        }
        self.entries.push(Some(alloc));
        Ok(Slot::Pushed)
    }

    /// Stops tracking `ptr`, leaving its node empty for reuse
    pub(crate) fn remove(&mut self, ptr: *const u8) -> Option<LargeAlloc> {
        self.entries
            .iter_mut()
            .rev()
            .find(|slot| matches!(slot, Some(large) if large.ptr.as_ptr().cast_const() == ptr))
            .and_then(Option::take)
    }

    /// Whether `ptr` is the start of a tracked allocation
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|large| large.ptr.as_ptr().cast_const() == ptr)
    }

    /// Empties the list, yielding every live allocation
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = LargeAlloc> + '_ {
        self.entries.drain(..).flatten()
    }

    /// Number of live allocations
    pub(crate) fn live(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of nodes, live or empty
    pub(crate) fn slots(&self) -> usize {
        self.entries.len()
    }

    /// Bytes held by live allocations
    pub(crate) fn bytes(&self) -> usize {
        self.entries.iter().flatten().map(|large| large.layout.size()).sum()
    }
}
