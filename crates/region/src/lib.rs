//! # nebula-region
//!
//! Region-based memory pool for bounded units of work (a request, a
//! connection, a workflow step).
//!
//! A [`Pool`] hands out memory from a chain of fixed-size blocks with a bump
//! cursor and releases all of it at once when the unit of work ends. On top
//! of that it provides:
//! - tracked large allocations that can be released early with
//!   [`Pool::free`]
//! - a cleanup registry whose finalizers run once, newest first, on
//!   teardown (closures, or built-in file close/delete on Unix)
//! - [`Pool::reset`] to reuse the block chain for the next unit of work
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_region::prelude::*;
//!
//! # fn main() -> PoolResult<()> {
//! let mut pool = Pool::new(4096)?;
//!
//! let name = pool.alloc_str("upstream")?;
//! let buf = pool.alloc_zeroed(256)?;
//! assert_eq!(name, "upstream");
//!
//! // a buffer too big for a block goes to the system allocator
//! let body = pool.alloc(64 * 1024)?;
//! // SAFETY: nothing reads `body` after it is freed.
//! unsafe { pool.free(body.as_ptr())? };
//!
//! # let _ = buf;
//! pool.reset();
//! assert_eq!(pool.stats().used, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `serde`: `Serialize`/`Deserialize` for [`PoolConfig`]
//!
//! ## Logging
//!
//! Pools report through a [`PoolLogger`]. The default [`TracingLogger`]
//! emits `tracing` events under the `nebula_region` target.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]
#![warn(rust_2018_idioms)]
// Explicit lifetimes are clearer in unsafe/arena code even when elidable
#![allow(clippy::elidable_lifetime_names)]
// Address arithmetic in block bumping is reviewed per-site
#![allow(clippy::cast_ptr_alignment)]

mod block;
mod cleanup;
mod config;
mod error;
mod large;
pub mod log;
mod pool;
mod stats;
mod sys;
pub mod utils;

#[cfg(unix)]
pub use crate::cleanup::CleanupFile;
pub use crate::cleanup::{Cleanup, CleanupHandler};
pub use crate::config::{
    ALLOC_ALIGNMENT, DEFAULT_LARGE_REUSE_SCAN, DEFAULT_POOL_SIZE, DEFAULT_SKIP_THRESHOLD,
    MIN_POOL_SIZE, POOL_ALIGNMENT, PoolConfig,
};
pub use crate::error::{PoolError, PoolResult};
pub use crate::log::{LogRecord, NoopLogger, PoolLogger, RecordingLogger, Severity, TracingLogger};
pub use crate::pool::Pool;
pub use crate::stats::{BlockInfo, Location, PoolStats};
pub use crate::sys::{RawAllocator, SystemAllocator};

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::config::PoolConfig;
    pub use crate::error::{PoolError, PoolResult};
    pub use crate::log::{PoolLogger, Severity, TracingLogger};
    pub use crate::pool::Pool;
    pub use crate::stats::PoolStats;
    pub use crate::sys::{RawAllocator, SystemAllocator};
}
