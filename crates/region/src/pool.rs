//! Region pool: chained bump blocks, tracked large allocations, teardown cleanups
//!
//! # Safety
//!
//! This module implements a single-threaded region allocator:
//! - `RefCell` for the block chain, large list and cleanup stack
//! - `Cell` for the index of the first block worth probing
//! - blocks are only appended, never removed, until the pool is dropped
//!
//! ## Invariants
//!
//! - every block's cursor stays within `[0, capacity]`
//! - `current < blocks.len()` (the chain is never empty)
//! - allocations never overlap: cursors only move forward until `reset`
//! - `reset` and drop take `&mut self` / `self`, so no reference handed out
//!   by the typed helpers can outlive the memory behind it
//!
//! ## Not Thread-Safe
//!
//! - Uses `Cell`/`RefCell` instead of atomics
//! - No `Send`/`Sync` implementations: bind one pool to one unit of work

use core::alloc::Layout;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use crate::block::Block;
use crate::cleanup::{Cleanup, CleanupStack};
#[cfg(unix)]
use crate::cleanup::{CleanupFile, CleanupHandler};
use crate::config::{ALLOC_ALIGNMENT, POOL_ALIGNMENT, PoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::large::{LargeAlloc, LargeList};
use crate::log::{PoolLogger, Severity, TracingLogger, pool_log};
use crate::stats::{BlockInfo, Location, PoolStats};
use crate::sys::{RawAllocator, SystemAllocator};

/// Region allocator for one bounded unit of work
///
/// Small requests are bump-allocated from a chain of fixed-size blocks and
/// released all at once by [`reset`](Self::reset) or drop. Requests above
/// [`small_alloc_ceiling`](Self::small_alloc_ceiling), and every
/// [`alloc_aligned`](Self::alloc_aligned) request, go to the system
/// allocator and are tracked so they can be released early with
/// [`free`](Self::free). Cleanups registered with
/// [`add_cleanup`](Self::add_cleanup) run once, newest first, when the pool
/// is dropped.
///
/// Values placed in the pool never have their destructors run; register a
/// cleanup for anything that needs teardown.
///
/// # Examples
///
/// ```
/// use nebula_region::Pool;
///
/// let pool = Pool::new(1024).unwrap();
///
/// let header = pool.alloc_str("HTTP/1.1 200 OK").unwrap();
/// let counters = pool.alloc_slice(&[0u64; 4]).unwrap();
/// counters[0] += 1;
///
/// assert_eq!(header, "HTTP/1.1 200 OK");
/// assert_eq!(pool.stats().blocks, 1);
/// // everything is released here
/// ```
pub struct Pool<A: RawAllocator = SystemAllocator> {
    blocks: RefCell<Vec<Block>>,
    current: Cell<usize>,
    large: RefCell<LargeList>,
    cleanups: RefCell<CleanupStack>,
    max: usize,
    config: PoolConfig,
    logger: Arc<dyn PoolLogger>,
    alloc: A,
}

impl Pool {
    /// Creates a pool of `size`-byte blocks that logs through `tracing`
    pub fn new(size: usize) -> PoolResult<Self> {
        Self::with_config(PoolConfig::default().with_size(size), Arc::new(TracingLogger))
    }

    /// Creates a pool from `config`, reporting through `logger`
    pub fn with_config(config: PoolConfig, logger: Arc<dyn PoolLogger>) -> PoolResult<Self> {
        Self::with_allocator(config, logger, SystemAllocator)
    }
}

impl<A: RawAllocator> Pool<A> {
    /// Creates a pool whose memory comes from `alloc`
    pub fn with_allocator(
        config: PoolConfig,
        logger: Arc<dyn PoolLogger>,
        alloc: A,
    ) -> PoolResult<Self> {
        config.validate()?;

        let pool = Self {
            blocks: RefCell::new(Vec::with_capacity(1)),
            current: Cell::new(0),
            large: RefCell::new(LargeList::new()),
            cleanups: RefCell::new(CleanupStack::new()),
            max: config.small_alloc_ceiling(),
            config,
            logger,
            alloc,
        };

        let head = pool.new_block()?;
        pool.blocks.borrow_mut().push(head);

        pool_log!(
            pool.logger,
            Severity::Debug,
            "create pool: size:{} max:{}",
            pool.config.size,
            pool.max
        );

        Ok(pool)
    }

    // ------------------------------------------------------------------------
    // Raw allocation
    // ------------------------------------------------------------------------

    /// Allocates `size` bytes aligned to pointer size
    ///
    /// The memory is uninitialized. It stays valid until the pool is reset
    /// or dropped (or, for large requests, until [`free`](Self::free)).
    pub fn alloc(&self, size: usize) -> PoolResult<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, ALLOC_ALIGNMENT);
        }
        self.alloc_large(size)
    }

    /// Allocates `size` bytes with no alignment padding
    ///
    /// Suited to byte strings, where padding would only waste block space.
    pub fn alloc_unaligned(&self, size: usize) -> PoolResult<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, 1);
        }
        self.alloc_large(size)
    }

    /// Like [`alloc`](Self::alloc), with the memory zero-filled
    pub fn alloc_zeroed(&self, size: usize) -> PoolResult<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        // SAFETY: `alloc` returned a region valid for `size` bytes of writes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Allocates `size` bytes straight from the system allocator
    ///
    /// The allocation is tracked, so it can be released early with
    /// [`free`](Self::free) and is released automatically otherwise.
    pub fn alloc_large(&self, size: usize) -> PoolResult<NonNull<u8>> {
        self.track_large(size, ALLOC_ALIGNMENT)
    }

    /// Allocates `size` bytes aligned to `alignment`
    ///
    /// Always served by the system allocator and tracked like
    /// [`alloc_large`](Self::alloc_large), whatever the size.
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(PoolError::invalid_alignment(alignment));
        }
        self.track_large(size, alignment)
    }

    /// Releases a large allocation before the pool dies
    ///
    /// Only pointers returned by [`alloc_large`](Self::alloc_large),
    /// [`alloc_aligned`](Self::alloc_aligned), or a request above the small
    /// ceiling are tracked. Anything else is reported at notice severity and
    /// rejected with [`PoolError::UntrackedFree`]; the pool is unaffected.
    ///
    /// # Safety
    ///
    /// If `ptr` is tracked, no pointer or reference into that allocation may
    /// be used after this call.
    pub unsafe fn free(&self, ptr: *const u8) -> PoolResult<()> {
        let Some(large) = self.large.borrow_mut().remove(ptr) else {
            pool_log!(
                self.logger,
                Severity::Notice,
                "free: {ptr:p} is not a large allocation of this pool"
            );
            return Err(PoolError::untracked_free(ptr));
        };

        pool_log!(self.logger, Severity::Debug, "free: {ptr:p}");
        // SAFETY: `large` came from `self.alloc` in `track_large`; the caller
        // guarantees the memory is no longer used.
        unsafe { large.release(&self.alloc) };
        Ok(())
    }

    /// Allocates memory for `layout`
    ///
    /// Alignments above pointer size are served by
    /// [`alloc_aligned`](Self::alloc_aligned).
    pub fn alloc_layout(&self, layout: Layout) -> PoolResult<NonNull<u8>> {
        if layout.align() > ALLOC_ALIGNMENT {
            return self.alloc_aligned(layout.size(), layout.align());
        }
        if layout.size() <= self.max {
            return self.alloc_small(layout.size(), layout.align());
        }
        self.alloc_large(layout.size())
    }

    // ------------------------------------------------------------------------
    // Typed allocation
    // ------------------------------------------------------------------------

    /// Moves `value` into the pool
    ///
    /// `value` is never dropped.
    pub fn alloc_value<T>(&self, value: T) -> PoolResult<&mut T> {
        let ptr = self.alloc_layout(Layout::new::<T>())?.cast::<T>();

        // SAFETY: Initializing allocated memory and creating reference.
        // - ptr is valid for a T (alloc_layout used T's layout)
        // - the region is handed out once, so the reference is unique
        // - the lifetime is bound to &self; reset/drop need &mut self/self
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    /// Copies `slice` into the pool
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> PoolResult<&mut [T]> {
        if slice.is_empty() {
            return Ok(&mut []);
        }

        let layout = Layout::for_value(slice);
        let ptr = self.alloc_layout(layout)?.cast::<T>();

        // SAFETY: Copying slice to allocated memory and creating slice reference.
        // - ptr is valid and aligned for slice.len() elements (layout of the slice)
        // - source and destination don't overlap (fresh allocation)
        // - T: Copy, so the copied bits are valid T values
        unsafe {
            ptr::copy_nonoverlapping(slice.as_ptr(), ptr.as_ptr(), slice.len());
            Ok(&mut *ptr::slice_from_raw_parts_mut(ptr.as_ptr(), slice.len()))
        }
    }

    /// Copies `s` into the pool without alignment padding
    pub fn alloc_str(&self, s: &str) -> PoolResult<&str> {
        if s.is_empty() {
            return Ok("");
        }

        let ptr = self.alloc_unaligned(s.len())?;

        // SAFETY: ptr is valid for s.len() bytes; the bytes are copied from a
        // &str, so they are valid UTF-8.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), s.len());
            Ok(core::str::from_utf8_unchecked(bytes))
        }
    }

    // ------------------------------------------------------------------------
    // Cleanups
    // ------------------------------------------------------------------------

    /// Registers a cleanup entry with a `size`-byte zero-filled payload
    ///
    /// The returned handle exposes the payload and must be armed with a
    /// handler; see [`Cleanup`]. `size` may be zero.
    pub fn add_cleanup(&self, size: usize) -> PoolResult<Cleanup<'_>> {
        let data = if size == 0 {
            NonNull::dangling()
        } else {
            self.alloc_zeroed(size)?
        };

        let index = self.cleanups.borrow_mut().push(data, size);
        pool_log!(self.logger, Severity::Debug, "add cleanup: #{index} size:{size}");

        Ok(Cleanup::new(&self.cleanups, index, data, size))
    }

    /// Registers a cleanup closing `fd` (and deleting `path` if `delete`)
    ///
    /// Close failures are reported at alert severity, delete failures other
    /// than "not found" at critical severity.
    #[cfg(unix)]
    pub fn add_file_cleanup(
        &self,
        fd: RawFd,
        path: impl Into<PathBuf>,
        delete: bool,
    ) -> PoolResult<()> {
        let file = CleanupFile::new(fd, path);
        let handler = if delete {
            CleanupHandler::DeleteFile(file)
        } else {
            CleanupHandler::CloseFile(file)
        };
        self.add_cleanup(0)?.set(handler);
        Ok(())
    }

    /// Closes `fd` now if a close-file cleanup is registered for it
    ///
    /// The entry is disarmed, so the pool won't close the descriptor again.
    /// Returns whether an entry was found.
    #[cfg(unix)]
    pub fn run_cleanup_file(&self, fd: RawFd) -> bool {
        let handler = self.cleanups.borrow_mut().take_file(fd);
        match handler {
            Some(handler) => {
                handler.run(&mut [], &*self.logger);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Releases every allocation while keeping the block chain
    ///
    /// Large allocations go back to the system allocator, every block's
    /// cursor and failure count are rewound, and probing restarts at the
    /// head block. Registered cleanups are discarded without running: their
    /// payloads live in the memory being rewound.
    pub fn reset(&mut self) {
        let cleanups = self.cleanups.get_mut();
        if cleanups.armed() > 0 {
            pool_log!(
                self.logger,
                Severity::Debug,
                "reset pool: discarding {} cleanups",
                cleanups.armed()
            );
        }
        cleanups.clear();

        for large in self.large.get_mut().drain() {
            // SAFETY: allocated by `self.alloc` in `track_large`; `&mut self`
            // proves no reference into it is alive.
            unsafe { large.release(&self.alloc) };
        }

        for block in self.blocks.get_mut() {
            block.reset();
        }
        self.current.set(0);

        pool_log!(self.logger, Severity::Debug, "reset pool");
    }

    /// Runs every cleanup, newest first, then releases all memory
    ///
    /// Equivalent to dropping the pool. If a cleanup panics, the remaining
    /// cleanups still run and all memory is released before the first panic
    /// is resumed.
    pub fn destroy(self) {
        drop(self);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Largest request served from block memory
    pub fn small_alloc_ceiling(&self) -> usize {
        self.max
    }

    /// Configuration the pool was created with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Logger the pool reports through
    pub fn logger(&self) -> &Arc<dyn PoolLogger> {
        &self.logger
    }

    /// Snapshot of every block, head first
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let current = self.current.get();
        self.blocks
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, block)| BlockInfo {
                index,
                capacity: block.capacity(),
                used: block.used(),
                available: block.available(),
                failed: block.failed(),
                probed: index >= current,
            })
            .collect()
    }

    /// Pool-wide snapshot
    pub fn stats(&self) -> PoolStats {
        let blocks = self.blocks.borrow();
        let large = self.large.borrow();

        PoolStats {
            blocks: blocks.len(),
            current: self.current.get(),
            capacity: blocks.iter().map(Block::capacity).sum(),
            used: blocks.iter().map(Block::used).sum(),
            available: blocks.iter().map(Block::available).sum(),
            large_live: large.live(),
            large_slots: large.slots(),
            large_bytes: large.bytes(),
            cleanups: self.cleanups.borrow().len(),
        }
    }

    /// Where `ptr` lives, if it belongs to this pool
    pub fn locate(&self, ptr: *const u8) -> Option<Location> {
        if self.large.borrow().contains(ptr) {
            return Some(Location::Large);
        }
        self.blocks
            .borrow()
            .iter()
            .position(|block| block.contains(ptr))
            .map(Location::Block)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Bump-allocates from the first probed block with room, growing the chain if none has
    fn alloc_small(&self, size: usize, align: usize) -> PoolResult<NonNull<u8>> {
        let mut blocks = self.blocks.borrow_mut();

        let current = self.current.get();
        if let Some(ptr) = blocks[current..]
            .iter_mut()
            .find_map(|block| block.try_bump(size, align))
        {
            return Ok(ptr);
        }

        self.grow(&mut blocks, size, align)
    }

    /// Appends a block and serves the request from it
    ///
    /// Every probed block except the old tail is charged one failure; blocks
    /// charged more than `skip_threshold` times stop being probed.
    fn grow(&self, blocks: &mut Vec<Block>, size: usize, align: usize) -> PoolResult<NonNull<u8>> {
        let mut block = self.new_block()?;

        // A fresh block is POOL_ALIGNMENT-aligned and `size <= max <= capacity`.
        let Some(ptr) = block.try_bump(size, align) else {
            // SAFETY: the block was never handed out.
            unsafe { block.release(&self.alloc) };
            return Err(PoolError::allocation_failed(size, align));
        };

        if blocks.try_reserve(1).is_err() {
            // SAFETY: `ptr` has not been returned to anyone yet.
            unsafe { block.release(&self.alloc) };
            pool_log!(
                self.logger,
                Severity::Emergency,
                "block list growth failed at {} blocks",
                blocks.len()
            );
            return Err(PoolError::allocation_failed(size, align));
        }

        let tail = blocks.len() - 1;
        let mut current = self.current.get();
        for (index, probed) in blocks.iter_mut().enumerate().take(tail).skip(current) {
            if probed.record_failure() > self.config.skip_threshold {
                current = index + 1;
            }
        }
        self.current.set(current);

        blocks.push(block);
        pool_log!(
            self.logger,
            Severity::Debug,
            "pool block #{} appended, current:{current}",
            blocks.len() - 1
        );

        Ok(ptr)
    }

    fn new_block(&self) -> PoolResult<Block> {
        Block::allocate(&self.alloc, self.config.size).ok_or_else(|| {
            pool_log!(
                self.logger,
                Severity::Emergency,
                "memalign({POOL_ALIGNMENT}, {}) failed",
                self.config.size
            );
            PoolError::allocation_failed(self.config.size, POOL_ALIGNMENT)
        })
    }

    fn track_large(&self, size: usize, align: usize) -> PoolResult<NonNull<u8>> {
        // zero-sized layouts can't be handed to the system allocator
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| PoolError::size_overflow(size))?;

        let Some(ptr) = self.alloc.allocate(layout) else {
            pool_log!(
                self.logger,
                Severity::Emergency,
                "memalign({}, {}) failed",
                layout.align(),
                layout.size()
            );
            return Err(PoolError::allocation_failed_with_layout(layout));
        };

        let inserted = self
            .large
            .borrow_mut()
            .insert(LargeAlloc { ptr, layout }, self.config.large_reuse_scan);

        match inserted {
            Ok(slot) => {
                pool_log!(
                    self.logger,
                    Severity::Debug,
                    "large alloc: {ptr:p}:{} ({slot:?})",
                    layout.size()
                );
                Ok(ptr)
            }
            Err(large) => {
                // SAFETY: just allocated from `self.alloc`, never handed out.
                unsafe { large.release(&self.alloc) };
                pool_log!(self.logger, Severity::Emergency, "large list growth failed");
                Err(PoolError::allocation_failed_with_layout(layout))
            }
        }
    }
}

impl<A: RawAllocator> Drop for Pool<A> {
    fn drop(&mut self) {
        // cleanups may read their payloads, so they run while blocks are alive
        let panicked = self.cleanups.get_mut().run_all(&*self.logger);

        for large in self.large.get_mut().drain() {
            pool_log!(self.logger, Severity::Debug, "free: {:p}", large.ptr);
            // SAFETY: allocated by `self.alloc` in `track_large`.
            unsafe { large.release(&self.alloc) };
        }

        for block in mem::take(self.blocks.get_mut()) {
            pool_log!(
                self.logger,
                Severity::Debug,
                "free block: capacity:{}, unused:{}",
                block.capacity(),
                block.available()
            );
            // SAFETY: allocated by `self.alloc` in `new_block`; the pool is
            // going away, so nothing can reach the block afterwards.
            unsafe { block.release(&self.alloc) };
        }

        // a second panic while already unwinding would abort
        if let Some(payload) = panicked
            && !std::thread::panicking()
        {
            std::panic::resume_unwind(payload);
        }
    }
}

impl<A: RawAllocator> fmt::Debug for Pool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max", &self.max)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
