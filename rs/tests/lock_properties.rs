//! Property tests for multi-file locking

use proptest::prelude::*;
use runstore::FileLockManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

// =============================================================================
// Deadlock freedom
// =============================================================================

/// Strategy: 2..6 workers, each wanting a non-empty subset of 6 shared files
fn worker_sets() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(0usize..6, 1..5), 2..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: concurrent acquire_all over overlapping sets always finishes
    ///
    /// Every worker requests its files in an arbitrary order; global ordering
    /// inside acquire_all means nobody waits in a cycle, so every worker gets
    /// its whole set within the bound.
    #[test]
    fn prop_acquire_all_never_deadlocks(sets in worker_sets()) {
        let temp = tempdir().unwrap();
        let mgr = Arc::new(FileLockManager::new(temp.path().join("locks")).unwrap());
        let files: Vec<PathBuf> = (0..6).map(|i| temp.path().join(format!("f{i}.rs"))).collect();

        let barrier = Arc::new(Barrier::new(sets.len()));
        let finished = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let handles: Vec<_> = sets
            .iter()
            .map(|set| {
                // Reverse the request order to make naive ordering collide
                let wanted: Vec<PathBuf> = set.iter().rev().map(|&i| files[i].clone()).collect();
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                let finished = Arc::clone(&finished);
                thread::spawn(move || {
                    barrier.wait();
                    let held = mgr.acquire_all(&wanted, Duration::from_secs(20));
                    if held.is_ok() {
                        thread::sleep(Duration::from_millis(5));
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                    held.is_ok()
                })
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        prop_assert!(results.iter().all(|ok| *ok), "some worker timed out: {:?}", results);
        prop_assert_eq!(finished.load(Ordering::SeqCst), sets.len());
        prop_assert!(start.elapsed() < Duration::from_secs(20));
    }

    /// Property: at most one holder of a file at any instant
    #[test]
    fn prop_lock_exclusivity(workers in 2usize..5) {
        let temp = tempdir().unwrap();
        let mgr = Arc::new(FileLockManager::new(temp.path().join("locks")).unwrap());
        let target = temp.path().join("hot.rs");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let target = target.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..3 {
                        let _lock = mgr.acquire(&target, Duration::from_secs(10)).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        prop_assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
