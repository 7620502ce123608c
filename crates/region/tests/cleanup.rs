//! Cleanup registry: ordering, payloads, reset, and the built-in file finalizers.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use nebula_region::{
    CleanupHandler, NoopLogger, Pool, PoolConfig, RawAllocator, RecordingLogger, Severity,
    SystemAllocator,
};
use pretty_assertions::assert_eq;

fn pool() -> Pool {
    Pool::with_config(PoolConfig::default().with_size(1024), Arc::new(NoopLogger)).unwrap()
}

#[test]
fn test_finalizers_run_in_reverse_registration_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let pool = pool();

    for name in ["A", "B"] {
        let order = Rc::clone(&order);
        pool.add_cleanup(0)
            .unwrap()
            .set_handler(move |_| order.borrow_mut().push(name));
    }

    pool.destroy();
    assert_eq!(*order.borrow(), vec!["B", "A"]);
}

#[test]
fn test_each_finalizer_runs_exactly_once() {
    let runs = Rc::new(Cell::new(0));
    let pool = pool();

    for _ in 0..10 {
        let runs = Rc::clone(&runs);
        pool.add_cleanup(0)
            .unwrap()
            .set_handler(move |_| runs.set(runs.get() + 1));
    }
    assert_eq!(pool.stats().cleanups, 10);

    drop(pool);
    assert_eq!(runs.get(), 10);
}

#[test]
fn test_finalizer_receives_payload() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let pool = pool();

    let mut cleanup = pool.add_cleanup(16).unwrap();
    assert_eq!(cleanup.len(), 16);
    assert!(cleanup.data().iter().all(|b| *b == 0));
    cleanup.data()[..5].copy_from_slice(b"hello");

    let sink = Rc::clone(&seen);
    cleanup.set_handler(move |data| sink.borrow_mut().extend_from_slice(&data[..5]));

    // later allocations don't disturb the payload
    for _ in 0..50 {
        pool.alloc_zeroed(100).unwrap();
    }

    drop(pool);
    assert_eq!(seen.borrow().as_slice(), b"hello");
}

#[test]
fn test_unarmed_entries_are_skipped() {
    let ran = Rc::new(Cell::new(false));
    let pool = pool();

    let _ = pool.add_cleanup(8).unwrap();
    let flag = Rc::clone(&ran);
    pool.add_cleanup(0)
        .unwrap()
        .set(CleanupHandler::callback(move |_| flag.set(true)));

    drop(pool);
    assert!(ran.get());
}

#[test]
fn test_reset_discards_cleanups_without_running() {
    let runs = Rc::new(Cell::new(0));
    let mut pool = pool();

    let counter = Rc::clone(&runs);
    pool.add_cleanup(32)
        .unwrap()
        .set_handler(move |_| counter.set(counter.get() + 1));

    pool.reset();
    assert_eq!(pool.stats().cleanups, 0);
    // the handler (and its captured Rc) is gone
    assert_eq!(Rc::strong_count(&runs), 1);

    drop(pool);
    assert_eq!(runs.get(), 0);
}

#[test]
fn test_finalizers_run_before_memory_is_released() {
    let total = Rc::new(Cell::new(0u64));
    let pool = pool();

    let values = pool.alloc_slice(&[1u64, 2, 3, 4]).unwrap();
    let ptr = values.as_ptr();
    let len = values.len();

    let sink = Rc::clone(&total);
    pool.add_cleanup(0).unwrap().set_handler(move |_| {
        // SAFETY: block memory is still alive while finalizers run.
        let values = unsafe { std::slice::from_raw_parts(ptr, len) };
        sink.set(values.iter().sum());
    });

    drop(pool);
    assert_eq!(total.get(), 10);
}

/// System allocator that counts outstanding allocations
#[derive(Debug, Default)]
struct Counting {
    live: Cell<usize>,
}

unsafe impl RawAllocator for Counting {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = SystemAllocator.allocate(layout)?;
        self.live.set(self.live.get() + 1);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.set(self.live.get() - 1);
        unsafe { SystemAllocator.deallocate(ptr, layout) };
    }
}

#[test]
fn test_panicking_finalizer_does_not_abort_teardown() {
    let counting = Counting::default();
    let logger = Arc::new(RecordingLogger::new(Severity::Alert));
    let older_runs = Rc::new(Cell::new(0));

    let pool =
        Pool::with_allocator(PoolConfig::default().with_size(1024), logger.clone(), &counting)
            .unwrap();
    pool.alloc_large(8192).unwrap();

    let runs = Rc::clone(&older_runs);
    pool.add_cleanup(0)
        .unwrap()
        .set_handler(move |_| runs.set(runs.get() + 1));
    pool.add_cleanup(0)
        .unwrap()
        .set_handler(|_| panic!("finalizer failed"));
    assert_eq!(counting.live.get(), 2);

    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.destroy()));

    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"finalizer failed"));
    assert_eq!(older_runs.get(), 1);
    assert_eq!(counting.live.get(), 0);
    assert_eq!(logger.count(Severity::Alert), 1);
}

#[cfg(unix)]
mod files {
    use std::fs::File;
    use std::os::fd::IntoRawFd;

    use pretty_assertions::assert_eq;

    use super::{Arc, Pool, PoolConfig, RecordingLogger, Severity};

    fn recording() -> Arc<RecordingLogger> {
        Arc::new(RecordingLogger::default())
    }

    fn pool_with(logger: &Arc<RecordingLogger>) -> Pool {
        Pool::with_config(PoolConfig::default().with_size(1024), logger.clone()).unwrap()
    }

    fn close_attempts(logger: &RecordingLogger, fd: i32) -> usize {
        let marker = format!("file cleanup: fd:{fd}");
        logger
            .records()
            .iter()
            .filter(|r| r.message == marker)
            .count()
    }

    #[test]
    fn test_close_file_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let fd = File::create(&path).unwrap().into_raw_fd();

        let logger = recording();
        let pool = pool_with(&logger);
        pool.add_file_cleanup(fd, &path, false).unwrap();
        pool.destroy();

        assert_eq!(close_attempts(&logger, fd), 1);
        assert_eq!(logger.count(Severity::Alert), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_delete_file_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.tmp");
        let fd = File::create(&path).unwrap().into_raw_fd();

        let logger = recording();
        let pool = pool_with(&logger);
        pool.add_file_cleanup(fd, &path, true).unwrap();
        drop(pool);

        assert!(!path.exists());
        assert_eq!(logger.count(Severity::Alert), 0);
        assert_eq!(logger.count(Severity::Critical), 0);
    }

    #[test]
    fn test_delete_of_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.tmp");
        let fd = File::create(&path).unwrap().into_raw_fd();
        std::fs::remove_file(&path).unwrap();

        let logger = recording();
        let pool = pool_with(&logger);
        pool.add_file_cleanup(fd, &path, true).unwrap();
        drop(pool);

        assert_eq!(logger.count(Severity::Critical), 0);
    }

    #[test]
    fn test_failures_are_logged_close_then_delete() {
        let dir = tempfile::tempdir().unwrap();

        let logger = recording();
        let pool = pool_with(&logger);
        // an invalid descriptor and a path that can't be unlinked
        pool.add_file_cleanup(-1, dir.path(), true).unwrap();
        drop(pool);

        let failures: Vec<Severity> = logger
            .records()
            .iter()
            .map(|r| r.severity)
            .filter(|s| *s < Severity::Notice)
            .collect();
        assert_eq!(failures, vec![Severity::Alert, Severity::Critical]);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_run_cleanup_file_closes_early_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("early.log");
        let fd = File::create(&path).unwrap().into_raw_fd();

        let logger = recording();
        let pool = pool_with(&logger);
        pool.add_file_cleanup(fd, &path, false).unwrap();

        assert!(pool.run_cleanup_file(fd));
        assert_eq!(close_attempts(&logger, fd), 1);
        assert!(!pool.run_cleanup_file(fd));

        drop(pool);
        assert_eq!(close_attempts(&logger, fd), 1);
        assert_eq!(logger.count(Severity::Alert), 0);
    }

    #[test]
    fn test_run_cleanup_file_ignores_delete_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.tmp");
        let fd = File::create(&path).unwrap().into_raw_fd();

        let pool = pool_with(&recording());
        pool.add_file_cleanup(fd, &path, true).unwrap();

        assert!(!pool.run_cleanup_file(fd));
        assert!(path.exists());
        drop(pool);
        assert!(!path.exists());
    }
}
