//! Pool configuration

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::utils::page_size;

/// Default size of every block in a pool (16 KiB)
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Alignment of every block's base address
pub const POOL_ALIGNMENT: usize = 16;

/// Alignment of [`Pool::alloc`](crate::Pool::alloc) results
pub const ALLOC_ALIGNMENT: usize = core::mem::align_of::<usize>();

/// Smallest accepted block size
pub const MIN_POOL_SIZE: usize = 64;

/// Times a block may be passed over by block growth before `current` skips it
pub const DEFAULT_SKIP_THRESHOLD: u32 = 4;

/// Large-list nodes probed for an empty slot before a new node is pushed
pub const DEFAULT_LARGE_REUSE_SCAN: usize = 3;

/// Configuration for a [`Pool`](crate::Pool)
///
/// # Examples
///
/// ```
/// use nebula_region::PoolConfig;
///
/// let config = PoolConfig::default()
///     .with_size(4096)
///     .with_skip_threshold(8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Size of the head block and of every block appended by growth
    pub size: usize,

    /// Failure count after which a block stops being probed for small allocations
    pub skip_threshold: u32,

    /// Number of large-list nodes probed for a reusable empty slot
    pub large_reuse_scan: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            large_reuse_scan: DEFAULT_LARGE_REUSE_SCAN,
        }
    }
}

impl PoolConfig {
    /// Creates new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Config for short-lived, small units of work: one page per block
    #[must_use]
    pub fn small() -> Self {
        Self {
            size: page_size(),
            ..Self::default()
        }
    }

    /// Config for allocation-heavy units of work (64 KiB blocks)
    #[must_use]
    pub fn large() -> Self {
        Self {
            size: 64 * 1024,
            ..Self::default()
        }
    }

    /// Sets block size
    #[must_use = "builder methods must be chained or built"]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the failure count after which a block is skipped
    #[must_use = "builder methods must be chained or built"]
    pub fn with_skip_threshold(mut self, threshold: u32) -> Self {
        self.skip_threshold = threshold;
        self
    }

    /// Sets how many large-list nodes are probed for reuse
    #[must_use = "builder methods must be chained or built"]
    pub fn with_large_reuse_scan(mut self, scan: usize) -> Self {
        self.large_reuse_scan = scan;
        self
    }

    /// Largest request served from block memory
    ///
    /// Anything bigger goes straight to the system allocator.
    #[must_use]
    pub fn small_alloc_ceiling(&self) -> usize {
        self.size.min(page_size() - 1)
    }

    /// Validates the configuration
    pub fn validate(&self) -> PoolResult<()> {
        if self.size < MIN_POOL_SIZE {
            return Err(PoolError::invalid_config(format!(
                "pool size {} is below the minimum of {MIN_POOL_SIZE} bytes",
                self.size
            )));
        }

        if self.size > isize::MAX as usize - POOL_ALIGNMENT {
            return Err(PoolError::invalid_config(format!(
                "pool size {} cannot be laid out",
                self.size
            )));
        }

        Ok(())
    }
}
