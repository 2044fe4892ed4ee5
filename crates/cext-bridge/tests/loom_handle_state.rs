//! Loom tests for the handle disposal protocol.
//!
//! These model the two ways a handle reaches `free` (the reaper after a
//! collection notification and the shutdown sweep) and check the orderings
//! that keep the free count at exactly one.

use loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex};

const ACTIVE: u8 = 0;
const QUEUED: u8 = 1;
const DISPOSED: u8 = 2;

/// Test that the collection callback and the sweep never both free.
#[test]
#[ignore = "loom test - run with cargo test loom_queue_vs_sweep --release"]
fn test_queue_vs_sweep_frees_once() {
    loom::model(|| {
        let state = Arc::new(AtomicU8::new(ACTIVE));
        let slot = Arc::new(Mutex::new(Some(())));
        let frees = Arc::new(AtomicUsize::new(0));

        // Collection callback: queue, then the reaper unlinks and frees.
        let reaper = loom::thread::spawn({
            let state = Arc::clone(&state);
            let slot = Arc::clone(&slot);
            let frees = Arc::clone(&frees);
            move || {
                if state
                    .compare_exchange(ACTIVE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                    && slot.lock().unwrap().take().is_some()
                {
                    state.swap(DISPOSED, Ordering::AcqRel);
                    frees.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        // Shutdown sweep: unlink everything, dispose what it unlinked.
        let sweep = loom::thread::spawn({
            let state = Arc::clone(&state);
            let slot = Arc::clone(&slot);
            let frees = Arc::clone(&frees);
            move || {
                if slot.lock().unwrap().take().is_some() {
                    state.swap(DISPOSED, Ordering::AcqRel);
                    frees.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        reaper.join().unwrap();
        sweep.join().unwrap();

        assert_eq!(frees.load(Ordering::Relaxed), 1);
        assert_eq!(state.load(Ordering::Acquire), DISPOSED);
    });
}

/// Test that a waiter never sees zero pending while a notification is in flight.
#[test]
#[ignore = "loom test - run with cargo test loom_pending_count --release"]
fn test_pending_count_covers_in_flight_notification() {
    loom::model(|| {
        let pending = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));

        pending.fetch_add(1, Ordering::AcqRel);
        let reaper = loom::thread::spawn({
            let pending = Arc::clone(&pending);
            let disposed = Arc::clone(&disposed);
            move || {
                disposed.store(1, Ordering::Relaxed);
                pending.fetch_sub(1, Ordering::AcqRel);
            }
        });

        if pending.load(Ordering::Acquire) == 0 {
            assert_eq!(disposed.load(Ordering::Relaxed), 1);
        }
        reaper.join().unwrap();
        assert_eq!(pending.load(Ordering::Acquire), 0);
    });
}
