//! The global execution lock.
//!
//! Native extensions are written against a single-threaded world. [`Gil`] is
//! the re-entrant lock that keeps them there: every native call, upcall and
//! handle-table mutation happens while the current thread holds it.
//!
//! The lock itself knows nothing about cleanup. A bridge registers a
//! *release hook* with [`Gil::set_release_hook`]; the hook runs after the
//! outermost guard drops, outside the lock, and is skipped by
//! [`GilGuard::release_no_cleanup`].

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::GilError;

/// Poll interval used by [`Gil::acquire_interruptibly`] unless configured.
pub const DEFAULT_INTERRUPT_POLL: Duration = Duration::from_millis(5);

type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

static NEXT_GIL_ID: AtomicU64 = AtomicU64::new(1);

struct GilState {
    owner: Option<ThreadId>,
    depth: usize,
    /// Open [`GilCell::with`] calls on the owning thread.
    cell_borrows: usize,
}

/// Re-entrant process-wide execution lock.
pub struct Gil {
    id: u64,
    state: Mutex<GilState>,
    available: Condvar,
    release_hook: RwLock<Option<ReleaseHook>>,
    poll_interval: Duration,
}

impl Default for Gil {
    fn default() -> Self {
        Self::new()
    }
}

impl Gil {
    /// Creates an unlocked GIL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_INTERRUPT_POLL)
    }

    /// Creates an unlocked GIL that re-checks interrupts every `poll_interval`.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            id: NEXT_GIL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GilState {
                owner: None,
                depth: 0,
                cell_borrows: 0,
            }),
            available: Condvar::new(),
            release_hook: RwLock::new(None),
            poll_interval,
        }
    }

    /// Blocks until the current thread holds the lock.
    ///
    /// A thread that already holds it re-enters immediately; every guard
    /// must be dropped before another thread can get in.
    pub fn acquire(&self) -> GilGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !Self::try_enter(&mut state, me) {
            self.available.wait(&mut state);
        }
        drop(state);
        GilGuard::new(self)
    }

    /// Like [`acquire`](Self::acquire), but gives up if `interrupt` fires
    /// while waiting.
    ///
    /// The interrupt is consumed. Lock state is untouched on failure.
    ///
    /// # Errors
    ///
    /// [`GilError::Interrupted`] if the wait was interrupted.
    pub fn acquire_interruptibly(&self, interrupt: &Interrupt) -> Result<GilGuard<'_>, GilError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !Self::try_enter(&mut state, me) {
            if interrupt.take() {
                return Err(GilError::Interrupted);
            }
            self.available.wait_for(&mut state, self.poll_interval);
        }
        drop(state);
        Ok(GilGuard::new(self))
    }

    /// Like [`acquire`](Self::acquire), but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`GilError::TimedOut`] if the lock stayed busy for the whole timeout.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<GilGuard<'_>, GilError> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if Self::try_enter(&mut state, me) {
                break;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                if Self::try_enter(&mut state, me) {
                    break;
                }
                return Err(GilError::TimedOut);
            }
        }
        drop(state);
        Ok(GilGuard::new(self))
    }

    fn try_enter(state: &mut GilState, me: ThreadId) -> bool {
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn exit(&self, run_hook: bool) {
        let me = thread::current().id();
        let fully_released = {
            let mut state = self.state.lock();
            assert_eq!(state.owner, Some(me), "GIL released by a thread that does not hold it");
            state.depth -= 1;
            if state.depth == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };
        if fully_released {
            self.available.notify_one();
            if run_hook {
                self.run_release_hook();
            }
        }
    }

    fn run_release_hook(&self) {
        let hook = self.release_hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Installs the callback run whenever the lock is fully released.
    pub fn set_release_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.release_hook.write() = Some(Arc::new(hook));
    }

    /// Removes the release hook.
    pub fn clear_release_hook(&self) {
        *self.release_hook.write() = None;
    }

    /// Returns `true` if the current thread holds the lock.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Returns `true` if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Runs a foreign blocking call with the lock fully released.
    ///
    /// If the current thread holds the lock at some depth, it is released
    /// entirely while `f` runs and re-taken at the same depth afterwards,
    /// including when `f` panics. Otherwise `f` just runs.
    ///
    /// Guards held by the caller stay alive but cannot reach a [`GilCell`]
    /// while `f` runs.
    ///
    /// # Panics
    ///
    /// If called from inside [`GilCell::with`].
    pub fn blocking_section<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = thread::current().id();
        let depth = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                drop(state);
                return f();
            }
            assert_eq!(
                state.cell_borrows, 0,
                "GIL blocking section entered while a GilCell is borrowed"
            );
            let depth = state.depth;
            state.owner = None;
            state.depth = 0;
            depth
        };
        self.available.notify_one();
        self.run_release_hook();

        let _reenter = Reenter {
            gil: self,
            me,
            depth,
        };
        f()
    }
}

/// Re-takes the lock at a saved depth when a blocking section ends.
struct Reenter<'a> {
    gil: &'a Gil,
    me: ThreadId,
    depth: usize,
}

impl Drop for Reenter<'_> {
    fn drop(&mut self) {
        let mut state = self.gil.state.lock();
        while state.owner.is_some() {
            self.gil.available.wait(&mut state);
        }
        state.owner = Some(self.me);
        state.depth = self.depth;
    }
}

impl fmt::Debug for Gil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Gil")
            .field("id", &self.id)
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a [`Gil`]. `!Send`.
#[must_use = "dropping the guard releases the GIL immediately"]
pub struct GilGuard<'a> {
    gil: &'a Gil,
    run_hook: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> GilGuard<'a> {
    const fn new(gil: &'a Gil) -> Self {
        Self {
            gil,
            run_hook: true,
            _not_send: PhantomData,
        }
    }

    /// Returns the lock this guard holds.
    #[must_use]
    pub const fn gil(&self) -> &'a Gil {
        self.gil
    }

    /// Releases one level; runs the release hook if this was the last one.
    pub fn release(self) {
        drop(self);
    }

    /// Releases one level without running the release hook.
    pub fn release_no_cleanup(mut self) {
        self.run_hook = false;
        drop(self);
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        self.gil.exit(self.run_hook);
    }
}

impl fmt::Debug for GilGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GilGuard").field("gil", &self.gil.id).finish()
    }
}

/// Request to abandon a blocking [`Gil::acquire_interruptibly`].
#[derive(Debug, Default)]
pub struct Interrupt {
    flag: AtomicBool,
}

impl Interrupt {
    /// Creates a cleared interrupt.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Raises the interrupt.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` if raised and not yet consumed.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consumes the interrupt.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Data that may only be touched while holding a particular [`Gil`].
pub struct GilCell<T> {
    gil_id: u64,
    value: RefCell<T>,
}

// SAFETY: `with` checks that the calling thread owns the lock, and the lock
// cannot be handed off by a blocking section while a `with` is open, so at
// most one thread reaches the `RefCell` at a time.
unsafe impl<T: Send> Sync for GilCell<T> {}

impl<T> GilCell<T> {
    /// Creates a cell protected by `gil`.
    pub const fn new(gil: &Gil, value: T) -> Self {
        Self {
            gil_id: gil.id,
            value: RefCell::new(value),
        }
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// # Panics
    ///
    /// If `guard` belongs to a different lock, if the lock is currently
    /// released by a [`Gil::blocking_section`], or if called re-entrantly on
    /// the same cell.
    pub fn with<R>(&self, guard: &GilGuard<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        assert_eq!(guard.gil.id, self.gil_id, "GilCell accessed with a foreign GIL guard");
        let _borrow = CellBorrow::enter(guard.gil);
        f(&mut self.value.borrow_mut())
    }

    /// Returns the value when no other reference exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Counts an open [`GilCell::with`] on the lock's owning thread.
struct CellBorrow<'a> {
    gil: &'a Gil,
}

impl<'a> CellBorrow<'a> {
    fn enter(gil: &'a Gil) -> Self {
        let mut state = gil.state.lock();
        assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "GilCell accessed while its GIL is released"
        );
        state.cell_borrows += 1;
        Self { gil }
    }
}

impl Drop for CellBorrow<'_> {
    fn drop(&mut self) {
        self.gil.state.lock().cell_borrows -= 1;
    }
}

impl<T> fmt::Debug for GilCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GilCell").field("gil", &self.gil_id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reentrant_depth() {
        let gil = Gil::new();
        let outer = gil.acquire();
        let inner = gil.acquire();
        assert!(gil.is_held_by_current_thread());
        inner.release();
        assert!(gil.is_held_by_current_thread());
        outer.release();
        assert!(!gil.is_locked());
    }

    #[test]
    fn test_hook_runs_only_on_full_release() {
        let gil = Gil::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        gil.set_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outer = gil.acquire();
        gil.acquire().release();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        outer.release();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        gil.acquire().release_no_cleanup();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_may_take_the_lock() {
        let gil = Arc::new(Gil::new());
        let weak = Arc::downgrade(&gil);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        gil.set_release_hook(move || {
            if let Some(gil) = weak.upgrade() {
                gil.acquire().release_no_cleanup();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        gil.acquire().release();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        gil.clear_release_hook();
    }

    #[test]
    fn test_blocking_section_restores_depth() {
        let gil = Arc::new(Gil::new());
        let _a = gil.acquire();
        let _b = gil.acquire();
        let other = Arc::clone(&gil);
        gil.blocking_section(|| {
            thread::spawn(move || other.acquire().release_no_cleanup())
                .join()
                .unwrap();
        });
        assert!(gil.is_held_by_current_thread());
    }

    #[test]
    fn test_blocking_section_without_lock_just_runs() {
        let gil = Gil::new();
        assert_eq!(gil.blocking_section(|| 7), 7);
        assert!(!gil.is_locked());
    }

    #[test]
    fn test_gil_cell_counts_nested_borrows() {
        let gil = Gil::new();
        let a = GilCell::new(&gil, 1_u32);
        let b = GilCell::new(&gil, 2_u32);
        let guard = gil.acquire();
        let sum = a.with(&guard, |x| b.with(&guard, |y| *x + *y));
        assert_eq!(sum, 3);
        assert_eq!(gil.state.lock().cell_borrows, 0);
    }

    #[test]
    #[should_panic(expected = "foreign GIL guard")]
    fn test_gil_cell_rejects_foreign_guard() {
        let a = Gil::new();
        let b = Gil::new();
        let cell = GilCell::new(&a, 0_u32);
        let guard = b.acquire();
        cell.with(&guard, |v| *v += 1);
    }
}
