//! Logging seam for pools
//!
//! A pool reports through a [`PoolLogger`] rather than calling `tracing`
//! directly, so callers can route pool events per unit of work (one logger
//! per connection, a test recorder, ...). [`TracingLogger`] is the default.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a pool event, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The system allocator is exhausted
    Emergency,
    /// A resource could not be released (e.g. `close` failed)
    Alert,
    /// A resource was left behind (e.g. a file could not be deleted)
    Critical,
    /// Errors
    Error,
    /// Warnings
    Warn,
    /// Caller mistakes the pool recovers from
    Notice,
    /// Informational messages
    Info,
    /// Allocation tracing
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emergency => write!(f, "EMERG"),
            Self::Alert => write!(f, "ALERT"),
            Self::Critical => write!(f, "CRIT"),
            Self::Error => write!(f, "ERROR"),
            Self::Warn => write!(f, "WARN"),
            Self::Notice => write!(f, "NOTICE"),
            Self::Info => write!(f, "INFO"),
            Self::Debug => write!(f, "DEBUG"),
        }
    }
}

/// Sink for pool events
///
/// Implementations must not panic and should not block for long: they are
/// called from inside allocation paths.
pub trait PoolLogger: Send + Sync {
    /// Record one event
    fn log(&self, severity: Severity, args: fmt::Arguments<'_>);

    /// Whether events of `severity` would be recorded
    ///
    /// Lets the pool skip formatting for filtered-out debug events.
    fn enabled(&self, severity: Severity) -> bool {
        let _ = severity;
        true
    }
}

impl<L: PoolLogger + ?Sized> PoolLogger for Arc<L> {
    fn log(&self, severity: Severity, args: fmt::Arguments<'_>) {
        (**self).log(severity, args);
    }

    fn enabled(&self, severity: Severity) -> bool {
        (**self).enabled(severity)
    }
}

/// Logs through the pool's logger, skipping formatting when filtered out
macro_rules! pool_log {
    ($logger:expr, $severity:expr, $($arg:tt)+) => {{
        let logger: &dyn $crate::log::PoolLogger = &*$logger;
        if logger.enabled($severity) {
            logger.log($severity, format_args!($($arg)+));
        }
    }};
}
pub(crate) use pool_log;

/// Forwards pool events to `tracing` under the `nebula_region` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl PoolLogger for TracingLogger {
    fn log(&self, severity: Severity, args: fmt::Arguments<'_>) {
        match severity {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
                tracing::error!(target: "nebula_region", %severity, "{args}");
            }
            Severity::Warn => tracing::warn!(target: "nebula_region", %severity, "{args}"),
            Severity::Notice | Severity::Info => {
                tracing::info!(target: "nebula_region", %severity, "{args}");
            }
            Severity::Debug => tracing::debug!(target: "nebula_region", "{args}"),
        }
    }

    fn enabled(&self, severity: Severity) -> bool {
        match severity {
            Severity::Debug => tracing::enabled!(target: "nebula_region", tracing::Level::DEBUG),
            _ => true,
        }
    }
}

/// Discards all events
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl PoolLogger for NoopLogger {
    fn log(&self, _severity: Severity, _args: fmt::Arguments<'_>) {}

    fn enabled(&self, _severity: Severity) -> bool {
        false
    }
}

/// One event captured by [`RecordingLogger`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity the event was reported at
    pub severity: Severity,
    /// Rendered message
    pub message: String,
}

/// Keeps every event at or above a minimum severity in memory
///
/// Useful for asserting on what a pool reported.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use nebula_region::{Pool, PoolConfig, RecordingLogger, Severity};
///
/// let logger = Arc::new(RecordingLogger::new(Severity::Notice));
/// let pool = Pool::with_config(PoolConfig::default(), logger.clone()).unwrap();
///
/// let outside = 0u8;
/// // SAFETY: `outside` is not tracked, so nothing is released.
/// assert!(unsafe { pool.free(&outside) }.is_err());
/// assert_eq!(logger.count(Severity::Notice), 1);
/// ```
#[derive(Debug)]
pub struct RecordingLogger {
    min_severity: Severity,
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogger {
    /// Creates a recorder keeping events at `min_severity` or more severe
    #[must_use]
    pub fn new(min_severity: Severity) -> Self {
        Self {
            min_severity,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything recorded so far
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of events recorded at exactly `severity`
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.severity == severity)
            .count()
    }

    /// Drops all recorded events
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for RecordingLogger {
    fn default() -> Self {
        Self::new(Severity::Debug)
    }
}

impl PoolLogger for RecordingLogger {
    fn log(&self, severity: Severity, args: fmt::Arguments<'_>) {
        if self.enabled(severity) {
            self.records.lock().push(LogRecord {
                severity,
                message: args.to_string(),
            });
        }
    }

    fn enabled(&self, severity: Severity) -> bool {
        severity <= self.min_severity
    }
}
