//! A `LocalSnapshotLock` is a process-wide keyed mutex: at most one
//! transfer activity may hold the lock for a given local snapshot path at
//! any instant.  Concurrent jobs that touch the same directory (e.g., an
//! upload racing a snapshot install) serialize on it, while jobs on
//! independent directories proceed in parallel.
//!
//! The registry is a map from path string to holder/waiter state; entries
//! are garbage-collected as soon as the last interested party leaves, so
//! the map only grows with the number of in-flight jobs.
use std::collections::HashMap;
use std::sync::Condvar;
use std::sync::Mutex;

/// Per-path state: whether the path is currently held, and how many
/// threads are blocked waiting for it.  An entry is removed once
/// `held == false && waiters == 0`.
#[derive(Debug, Default)]
struct PathState {
    held: bool,
    waiters: usize,
}

#[derive(Debug, Default)]
pub struct LocalSnapshotLock {
    paths: Mutex<HashMap<String, PathState>>,
    unlocked: Condvar,
}

/// A scoped guard for one locked path; the path is released when the
/// guard is dropped.
#[derive(Debug)]
pub struct LocalSnapshotGuard<'a> {
    registry: &'a LocalSnapshotLock,
    path: String,
}

impl LocalSnapshotLock {
    /// Returns the process-wide registry.
    pub fn instance() -> &'static LocalSnapshotLock {
        lazy_static::lazy_static! {
            static ref GLOBAL: LocalSnapshotLock = Default::default();
        }

        &GLOBAL
    }

    pub fn new() -> LocalSnapshotLock {
        Default::default()
    }

    /// Blocks until `path` is free, then takes it.  The returned guard
    /// releases the path on drop.
    pub fn acquire(&self, path: impl Into<String>) -> LocalSnapshotGuard<'_> {
        let path = path.into();
        let mut paths = self.paths.lock().expect("snapshot lock mutex should be valid");

        loop {
            let state = paths.entry(path.clone()).or_default();
            if !state.held {
                state.held = true;
                return LocalSnapshotGuard {
                    registry: self,
                    path,
                };
            }

            state.waiters += 1;
            paths = self
                .unlocked
                .wait(paths)
                .expect("snapshot lock mutex should be valid");
            // The entry cannot have been dropped while we were counted
            // as a waiter.
            paths
                .get_mut(&path)
                .expect("waited-on entry must still exist")
                .waiters -= 1;
        }
    }
}

impl Drop for LocalSnapshotGuard<'_> {
    fn drop(&mut self) {
        let mut paths = self
            .registry
            .paths
            .lock()
            .expect("snapshot lock mutex should be valid");

        let state = paths
            .get_mut(&self.path)
            .expect("held entry must still exist");
        state.held = false;
        if state.waiters == 0 {
            paths.remove(&self.path);
        } else {
            self.registry.unlocked.notify_all();
        }
    }
}

/// Two sequential acquisitions of the same path both succeed, and the
/// registry forgets the path in between.
#[test]
fn test_acquire_release() {
    let registry = LocalSnapshotLock::new();

    {
        let _guard = registry.acquire("/data/snapshot/10007/123");
        assert_eq!(registry.paths.lock().unwrap().len(), 1);
    }
    assert!(registry.paths.lock().unwrap().is_empty());

    let _guard = registry.acquire("/data/snapshot/10007/123");
}

/// Guards for distinct paths coexist.
#[test]
fn test_independent_paths() {
    let registry = LocalSnapshotLock::new();

    let _a = registry.acquire("/data/snapshot/10007/123");
    let _b = registry.acquire("/data/snapshot/10008/123");
    assert_eq!(registry.paths.lock().unwrap().len(), 2);
}

/// At most one thread holds a given path's critical section at a time.
#[test]
fn test_mutual_exclusion() {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let active = active.clone();
            let peak = peak.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = LocalSnapshotLock::instance().acquire("/data/snapshot/contended");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("worker should not panic");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
