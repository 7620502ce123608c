//! Error types for nebula-region
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.

use core::alloc::Layout;
use thiserror::Error;

// ============================================================================
// Main Error Types
// ============================================================================

/// Errors reported by a [`Pool`](crate::Pool)
///
/// None of these are fatal: the pool stays usable after any of them.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    // --- Allocation Errors ---
    #[error("Memory allocation failed: {size} bytes with {align} byte alignment")]
    AllocationFailed { size: usize, align: usize },

    #[error("Invalid alignment: {alignment}")]
    InvalidAlignment { alignment: usize },

    #[error("Size overflow: {size} bytes cannot be laid out")]
    SizeOverflow { size: usize },

    // --- Tracker Errors ---
    #[error("Pointer {addr:#x} is not a large allocation owned by this pool")]
    UntrackedFree { addr: usize },

    // --- Configuration Errors ---
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl PoolError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllocationFailed { .. } => "REGION:ALLOC:FAILED",
            Self::InvalidAlignment { .. } => "REGION:ALLOC:ALIGN",
            Self::SizeOverflow { .. } => "REGION:ALLOC:OVERFLOW",
            Self::UntrackedFree { .. } => "REGION:FREE:UNTRACKED",
            Self::InvalidConfig { .. } => "REGION:CONFIG:INVALID",
        }
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create allocation failed error
    pub fn allocation_failed(size: usize, align: usize) -> Self {
        Self::AllocationFailed { size, align }
    }

    /// Create allocation failed error from layout
    pub fn allocation_failed_with_layout(layout: Layout) -> Self {
        Self::allocation_failed(layout.size(), layout.align())
    }

    /// Create invalid alignment error
    pub fn invalid_alignment(alignment: usize) -> Self {
        Self::InvalidAlignment { alignment }
    }

    /// Create size overflow error
    pub fn size_overflow(size: usize) -> Self {
        Self::SizeOverflow { size }
    }

    /// Create untracked free error
    pub fn untracked_free(ptr: *const u8) -> Self {
        Self::UntrackedFree { addr: ptr as usize }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
