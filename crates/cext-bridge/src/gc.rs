//! GC-bridge coordination: cleanup scheduling and the mark pass.
//!
//! A cleanup pass asks every owning handle's native resource which managed
//! objects it references (`mark_owned_references`), stores the answer on the
//! owning handle as its retained set, and then tells the native side to clear
//! its per-pass mark flags. Passes are requested on GIL release and run on the
//! collector thread; requests coalesce, so at most one pass is pending.
//!
//! # Scheduling
//!
//! | Phase       | `request()` while enabled | `request()` while disabled |
//! |-------------|---------------------------|----------------------------|
//! | `Idle`      | `Scheduled`               | `Deferred`                 |
//! | `Scheduled` | `Coalesced`               | `Deferred`                 |
//! | `Running`   | `Coalesced`               | `Deferred`                 |
//!
//! A request coalesced into a running pass queues one more pass after it,
//! since the running pass may already have taken the root sets.
//! A deferred request is replayed once by the `enable()` that brings the
//! nesting count back to zero.

use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::bridge::Shared;
use crate::gil::GilGuard;
use crate::handle::Handle;
use crate::mark::{self, MarkSink, Marker};
use crate::object::{ManagedObject, ObjectRef};
use crate::value::NativeAddress;

/// Outcome of a cleanup request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CleanupRequest {
    /// A new pass was scheduled.
    Scheduled,
    /// A pass was already scheduled or running.
    Coalesced,
    /// Cleanup is disabled; a pass runs when it is re-enabled.
    Deferred,
    /// The bridge is shutting down.
    Rejected,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug)]
struct Schedule {
    disabled: usize,
    deferred: bool,
    phase: Phase,
    rerun: bool,
    shutdown: bool,
}

/// Summary of one cleanup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Pass number, starting at 1.
    pub pass_id: u64,
    /// Owning handles whose native memory was scanned.
    pub owners_scanned: usize,
    /// Distinct objects found referenced from native memory.
    pub objects_marked: usize,
    /// Addresses whose mark flag was cleared.
    pub unmarked: usize,
    /// Carried roots released by this pass.
    pub carried_released: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

/// Scheduling state plus the per-bridge root sets.
pub(crate) struct GcBridge {
    schedule: Mutex<Schedule>,
    wake: Condvar,
    idle: Condvar,
    carried: Mutex<Vec<ObjectRef>>,
    unmark_queue: Mutex<Vec<NativeAddress>>,
    next_pass_id: AtomicU64,
}

impl GcBridge {
    pub(crate) fn new() -> Self {
        Self {
            schedule: Mutex::new(Schedule {
                disabled: 0,
                deferred: false,
                phase: Phase::Idle,
                rerun: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            carried: Mutex::new(Vec::new()),
            unmark_queue: Mutex::new(Vec::new()),
            next_pass_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn request(&self) -> CleanupRequest {
        let mut schedule = self.schedule.lock();
        self.request_locked(&mut schedule)
    }

    fn request_locked(&self, schedule: &mut Schedule) -> CleanupRequest {
        if schedule.shutdown {
            return CleanupRequest::Rejected;
        }
        if schedule.disabled > 0 {
            schedule.deferred = true;
            return CleanupRequest::Deferred;
        }
        match schedule.phase {
            Phase::Idle => {
                schedule.phase = Phase::Scheduled;
                self.wake.notify_one();
                CleanupRequest::Scheduled
            }
            Phase::Scheduled => CleanupRequest::Coalesced,
            Phase::Running => {
                schedule.rerun = true;
                CleanupRequest::Coalesced
            }
        }
    }

    /// Increments the nesting count. Returns the new depth.
    pub(crate) fn disable(&self) -> usize {
        let mut schedule = self.schedule.lock();
        schedule.disabled += 1;
        schedule.disabled
    }

    /// Decrements the nesting count, replaying a deferred request at zero.
    ///
    /// # Panics
    ///
    /// If called more often than [`disable`](Self::disable).
    pub(crate) fn enable(&self) -> Option<CleanupRequest> {
        let mut schedule = self.schedule.lock();
        assert!(schedule.disabled > 0, "enable_gc called without a matching disable_gc");
        schedule.disabled -= 1;
        if schedule.disabled == 0 && schedule.deferred {
            schedule.deferred = false;
            return Some(self.request_locked(&mut schedule));
        }
        None
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.schedule.lock().disabled > 0
    }

    /// Records that a synchronous pass was skipped because cleanup is disabled.
    pub(crate) fn defer_if_disabled(&self) -> bool {
        let mut schedule = self.schedule.lock();
        if schedule.disabled > 0 {
            schedule.deferred = true;
            true
        } else {
            false
        }
    }

    /// Blocks the collector until a pass should run. `false` means stop.
    fn next_pass(&self) -> bool {
        let mut schedule = self.schedule.lock();
        loop {
            if schedule.shutdown {
                return false;
            }
            if schedule.phase == Phase::Scheduled {
                if schedule.disabled > 0 {
                    // Disabled after scheduling: keep the pass for `enable`.
                    schedule.deferred = true;
                    schedule.phase = Phase::Idle;
                    self.idle.notify_all();
                    continue;
                }
                schedule.phase = Phase::Running;
                return true;
            }
            self.wake.wait(&mut schedule);
        }
    }

    fn finish_pass(&self) {
        let mut schedule = self.schedule.lock();
        if schedule.phase == Phase::Running {
            if std::mem::take(&mut schedule.rerun) {
                schedule.phase = Phase::Scheduled;
                return;
            }
            schedule.phase = Phase::Idle;
        }
        self.idle.notify_all();
    }

    /// Waits until no pass is scheduled or running.
    pub(crate) fn wait_idle(&self, deadline: Instant) -> bool {
        let mut schedule = self.schedule.lock();
        while schedule.phase != Phase::Idle && !schedule.shutdown {
            if self.idle.wait_until(&mut schedule, deadline).timed_out() {
                return schedule.phase == Phase::Idle;
            }
        }
        true
    }

    pub(crate) fn shutdown(&self) {
        let mut schedule = self.schedule.lock();
        schedule.shutdown = true;
        self.wake.notify_all();
        self.idle.notify_all();
    }

    pub(crate) fn carry(&self, object: ObjectRef) {
        self.carried.lock().push(object);
    }

    pub(crate) fn carry_over(&self, objects: Vec<ObjectRef>) {
        self.carried.lock().extend(objects);
    }

    fn take_carried(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.carried.lock())
    }

    pub(crate) fn carried_len(&self) -> usize {
        self.carried.lock().len()
    }

    pub(crate) fn queue_unmark(&self, address: NativeAddress) {
        self.unmark_queue.lock().push(address);
    }

    fn take_unmarks(&self) -> Vec<NativeAddress> {
        std::mem::take(&mut *self.unmark_queue.lock())
    }

    /// Drops every root set; used once the bridge is shut down.
    pub(crate) fn release_roots(&self) -> Vec<ObjectRef> {
        self.unmark_queue.lock().clear();
        self.take_carried()
    }
}

/// Mark sink for one owner during one pass.
struct MarkPass<'a, 'g> {
    shared: &'a Shared,
    guard: &'a GilGuard<'g>,
    current: RefCell<Vec<ObjectRef>>,
    seen: RefCell<HashSet<NativeAddress>>,
    marked: RefCell<HashSet<NativeAddress>>,
}

impl<'a, 'g> MarkPass<'a, 'g> {
    fn new(shared: &'a Shared, guard: &'a GilGuard<'g>) -> Self {
        Self {
            shared,
            guard,
            current: RefCell::new(Vec::new()),
            seen: RefCell::new(HashSet::new()),
            marked: RefCell::new(HashSet::new()),
        }
    }

    fn mark_owner(&self, owner: &Handle) -> Vec<ObjectRef> {
        self.seen.borrow_mut().clear();
        let marker = Marker::new(self);
        mark::with_marker(&marker, || {
            self.shared
                .native
                .mark_owned_references(owner.address(), &marker);
        });
        std::mem::take(&mut *self.current.borrow_mut())
    }

    fn record(&self, handle: &Handle) -> bool {
        let address = handle.address();
        if !self.seen.borrow_mut().insert(address) {
            return false;
        }
        let Some(object) = handle.object() else {
            // Collected already; the reaper owns it now.
            return false;
        };
        self.current.borrow_mut().push(object);
        self.marked.borrow_mut().insert(address);
        true
    }
}

impl MarkSink for MarkPass<'_, '_> {
    fn mark_address(&self, address: NativeAddress) -> bool {
        let handle = self
            .shared
            .registry
            .with(self.guard, |registry| registry.by_address(address));
        match handle {
            Some(handle) => self.record(&handle),
            None => {
                crate::tracing::log_unknown_address("gc_mark", address);
                false
            }
        }
    }

    fn mark_object(&self, object: &ManagedObject) -> bool {
        let handle = self
            .shared
            .registry
            .with(self.guard, |registry| registry.lookup(object.id()));
        handle.is_some_and(|handle| self.record(&handle))
    }
}

/// Runs one cleanup pass. Takes the GIL; never runs the release hook.
pub(crate) fn run_cleanup_pass(shared: &Shared) -> PassStats {
    let start = Instant::now();
    let pass_id = shared.gc.next_pass_id.fetch_add(1, Ordering::Relaxed);
    let _span = crate::tracing::span_cleanup_pass(pass_id);

    let guard = shared.gil.acquire();
    let carried = shared.gc.take_carried();
    let owners = shared.registry.with(&guard, |registry| registry.owners());

    let pass = MarkPass::new(shared, &guard);
    let mut released = Vec::with_capacity(owners.len());
    let mut owners_scanned = 0;
    for owner in &owners {
        // Keep the owner alive while its native memory is scanned.
        let Some(object) = owner.object() else {
            continue;
        };
        let set = pass.mark_owner(owner);
        released.push(owner.retain(set));
        released.push(vec![object]);
        owners_scanned += 1;
    }

    let mut unmark: Vec<NativeAddress> = pass.marked.take().into_iter().collect();
    let objects_marked = unmark.len();
    unmark.extend(shared.gc.take_unmarks());
    unmark.sort_unstable();
    unmark.dedup();
    for address in &unmark {
        shared.native.clear_mark(*address);
    }
    drop(pass);
    guard.release_no_cleanup();

    let stats = PassStats {
        pass_id,
        owners_scanned,
        objects_marked,
        unmarked: unmark.len(),
        carried_released: carried.len(),
        duration: start.elapsed(),
    };
    // Previous retained sets and carried roots drop outside the GIL.
    drop(released);
    drop(carried);

    shared.metrics.record_pass(&stats);
    crate::tracing::log_pass_complete(&stats);
    stats
}

/// Body of the collector thread.
pub(crate) fn run_collector(shared: &Shared) {
    while shared.gc.next_pass() {
        if panic::catch_unwind(AssertUnwindSafe(|| run_cleanup_pass(shared))).is_err() {
            crate::tracing::log_pass_panicked();
        }
        shared.gc.finish_pass();
    }
}
