//! Cleanup registry: finalizers run once when a pool is destroyed
//!
//! Entries form a LIFO stack (the last element of `entries` is the head), so
//! teardown runs them most-recently-registered first. Each entry may own a
//! payload carved from pool memory; the payload stays valid until the entry
//! runs because cleanups run before any block is released.

use core::cell::RefCell;
use core::fmt;
use core::ptr::NonNull;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(unix)]
use std::path::PathBuf;

use crate::log::{PoolLogger, Severity, pool_log};

/// A file the built-in finalizers close (and optionally delete)
#[cfg(unix)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFile {
    /// Descriptor to close
    pub fd: RawFd,
    /// Path used in reports, and deleted by [`CleanupHandler::DeleteFile`]
    pub path: PathBuf,
}

#[cfg(unix)]
impl CleanupFile {
    /// Creates a new file cleanup record
    pub fn new(fd: RawFd, path: impl Into<PathBuf>) -> Self {
        Self {
            fd,
            path: path.into(),
        }
    }

    fn close(&self, logger: &dyn PoolLogger) {
        pool_log!(logger, Severity::Debug, "file cleanup: fd:{}", self.fd);

        // SAFETY: the descriptor was handed to the pool to close; nothing
        // else closes it while the entry is registered.
        if unsafe { libc::close(self.fd) } == -1 {
            let err = std::io::Error::last_os_error();
            pool_log!(
                logger,
                Severity::Alert,
                "close() \"{}\" failed: {err}",
                self.path.display()
            );
        }
    }

    fn delete(&self, logger: &dyn PoolLogger) {
        pool_log!(logger, Severity::Debug, "file cleanup: delete \"{}\"", self.path.display());

        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            pool_log!(
                logger,
                Severity::Critical,
                "delete \"{}\" failed: {err}",
                self.path.display()
            );
        }
    }
}

/// Finalizer attached to a cleanup entry
pub enum CleanupHandler {
    /// Arbitrary finalizer, given the entry's payload bytes
    Callback(Box<dyn FnOnce(&mut [u8])>),
    /// Close a file descriptor
    #[cfg(unix)]
    CloseFile(CleanupFile),
    /// Close a file descriptor, then delete its path
    ///
    /// The descriptor is closed before the unlink, and both are attempted
    /// even if the close fails.
    #[cfg(unix)]
    DeleteFile(CleanupFile),
}

impl CleanupHandler {
    /// Wraps a closure
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(&mut [u8]) + 'static,
    {
        Self::Callback(Box::new(f))
    }

    pub(crate) fn run(self, data: &mut [u8], logger: &dyn PoolLogger) {
        match self {
            Self::Callback(f) => f(data),
            #[cfg(unix)]
            Self::CloseFile(file) => file.close(logger),
            #[cfg(unix)]
            Self::DeleteFile(file) => {
                file.close(logger);
                file.delete(logger);
            }
        }
    }
}

impl fmt::Debug for CleanupHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback(..)"),
            #[cfg(unix)]
            Self::CloseFile(file) => f.debug_tuple("CloseFile").field(file).finish(),
            #[cfg(unix)]
            Self::DeleteFile(file) => f.debug_tuple("DeleteFile").field(file).finish(),
        }
    }
}

struct CleanupEntry {
    handler: Option<CleanupHandler>,
    data: NonNull<u8>,
    len: usize,
}

impl CleanupEntry {
    fn run(mut self, logger: &dyn PoolLogger) {
        if let Some(handler) = self.handler.take() {
            pool_log!(logger, Severity::Debug, "run cleanup: {handler:?}");
            // SAFETY: `data` points at `len` initialized bytes of pool memory
            // reserved for this entry alone (see `CleanupStack::push`); the
            // blocks are still alive while cleanups run.
            let data = unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) };
            handler.run(data, logger);
        }
    }
}

#[derive(Default)]
pub(crate) struct CleanupStack {
    entries: Vec<CleanupEntry>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pushes an entry without a handler
    ///
    /// `data` must point at `len` zero-initialized bytes that nothing else
    /// references until the pool is reset or destroyed.
    pub(crate) fn push(&mut self, data: NonNull<u8>, len: usize) -> usize {
        self.entries.push(CleanupEntry {
            handler: None,
            data,
            len,
        });
        self.entries.len() - 1
    }

    pub(crate) fn set_handler(&mut self, index: usize, handler: CleanupHandler) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.handler = Some(handler);
        }
    }

    /// Unsets the newest close-file entry for `fd`, handing its handler back
    #[cfg(unix)]
    pub(crate) fn take_file(&mut self, fd: RawFd) -> Option<CleanupHandler> {
        self.entries
            .iter_mut()
            .rev()
            .find(|entry| {
                matches!(&entry.handler, Some(CleanupHandler::CloseFile(file)) if file.fd == fd)
            })
            .and_then(|entry| entry.handler.take())
    }

    /// Number of entries with a handler set
    pub(crate) fn armed(&self) -> usize {
        self.entries.iter().filter(|e| e.handler.is_some()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forgets every entry without running it
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Runs every entry, newest first, emptying the stack
    ///
    /// A panicking handler does not stop the remaining ones. The first panic
    /// payload is handed back for the caller to resume once teardown is done.
    pub(crate) fn run_all(&mut self, logger: &dyn PoolLogger) -> Option<Box<dyn Any + Send>> {
        let mut first_panic = None;
        while let Some(entry) = self.entries.pop() {
            let index = self.entries.len();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry.run(logger))) {
                pool_log!(logger, Severity::Alert, "cleanup #{index} panicked");
                first_panic.get_or_insert(payload);
            }
        }
        first_panic
    }
}

/// Handle to a freshly registered cleanup entry
///
/// Fill the payload through [`data`](Self::data), then arm the entry with
/// [`set_handler`](Self::set_handler) or [`set`](Self::set). An entry that is
/// never armed is skipped at teardown.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use nebula_region::Pool;
///
/// let seen = Rc::new(Cell::new(0u8));
/// let pool = Pool::new(1024).unwrap();
///
/// let mut cleanup = pool.add_cleanup(1).unwrap();
/// cleanup.data()[0] = 7;
/// let sink = Rc::clone(&seen);
/// cleanup.set_handler(move |data| sink.set(data[0]));
///
/// drop(pool);
/// assert_eq!(seen.get(), 7);
/// ```
#[must_use = "a cleanup entry does nothing until a handler is set"]
pub struct Cleanup<'p> {
    stack: &'p RefCell<CleanupStack>,
    index: usize,
    data: NonNull<u8>,
    len: usize,
}

impl<'p> Cleanup<'p> {
    pub(crate) fn new(
        stack: &'p RefCell<CleanupStack>,
        index: usize,
        data: NonNull<u8>,
        len: usize,
    ) -> Self {
        Self {
            stack,
            index,
            data,
            len,
        }
    }

    /// The entry's payload, zero-filled at registration
    pub fn data(&mut self) -> &mut [u8] {
        // SAFETY: the payload was reserved for this entry (see
        // `CleanupStack::push`) and the handle borrows the pool, so it cannot
        // be reset or destroyed meanwhile.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arms the entry with a closure receiving the payload
    pub fn set_handler<F>(self, f: F)
    where
        F: FnOnce(&mut [u8]) + 'static,
    {
        self.set(CleanupHandler::callback(f));
    }

    /// Arms the entry with any handler
    pub fn set(self, handler: CleanupHandler) {
        self.stack.borrow_mut().set_handler(self.index, handler);
    }
}

impl fmt::Debug for Cleanup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{NoopLogger, RecordingLogger};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn runs_newest_first() {
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let mut stack = CleanupStack::new();

        for name in ["a", "b", "c"] {
            let index = stack.push(NonNull::dangling(), 0);
            let order = Rc::clone(&order);
            stack.set_handler(
                index,
                CleanupHandler::callback(move |_| order.borrow_mut().push(name)),
            );
        }

        assert!(stack.run_all(&NoopLogger).is_none());
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn unarmed_entries_are_skipped() {
        let mut stack = CleanupStack::new();
        stack.push(NonNull::dangling(), 0);
        assert_eq!(stack.armed(), 0);

        let logger = RecordingLogger::default();
        stack.run_all(&logger);
        assert!(logger.records().is_empty());
    }

    #[test]
    fn clear_drops_without_running() {
        let ran = Rc::new(StdRefCell::new(false));
        let mut stack = CleanupStack::new();
        let index = stack.push(NonNull::dangling(), 0);
        let flag = Rc::clone(&ran);
        stack.set_handler(
            index,
            CleanupHandler::callback(move |_| *flag.borrow_mut() = true),
        );

        stack.clear();
        stack.run_all(&NoopLogger);
        assert!(!*ran.borrow());
        // the closure (and its captured Rc) was dropped
        assert_eq!(Rc::strong_count(&ran), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let mut stack = CleanupStack::new();

        for name in ["a", "boom", "c"] {
            let index = stack.push(NonNull::dangling(), 0);
            let order = Rc::clone(&order);
            stack.set_handler(
                index,
                CleanupHandler::callback(move |_| {
                    assert_ne!(name, "boom", "handler failed");
                    order.borrow_mut().push(name);
                }),
            );
        }

        let logger = RecordingLogger::new(Severity::Alert);
        let payload = stack.run_all(&logger);

        assert!(payload.is_some());
        assert_eq!(*order.borrow(), vec!["c", "a"]);
        assert_eq!(logger.count(Severity::Alert), 1);
        assert_eq!(stack.len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn take_file_matches_close_entries_only() {
        let mut stack = CleanupStack::new();
        let a = stack.push(NonNull::dangling(), 0);
        stack.set_handler(a, CleanupHandler::DeleteFile(CleanupFile::new(7, "/tmp/x")));
        let b = stack.push(NonNull::dangling(), 0);
        stack.set_handler(b, CleanupHandler::CloseFile(CleanupFile::new(9, "/tmp/y")));

        assert!(stack.take_file(7).is_none());
        assert!(matches!(
            stack.take_file(9),
            Some(CleanupHandler::CloseFile(file)) if file.fd == 9
        ));
        assert!(stack.take_file(9).is_none());
        assert_eq!(stack.armed(), 1);
        stack.clear();
    }
}
