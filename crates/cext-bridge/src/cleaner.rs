//! The cleaner list and the reaper thread.
//!
//! Every live handle sits in a [`CleanerList`]: a doubly linked list threaded
//! through a generational slot arena, so insert and unlink are O(1) and a
//! stale [`SlotKey`] can never reach a reused slot.
//!
//! When a managed object behind a handle is collected, its collection
//! callback sends [`ReaperMessage::Collected`]. The reaper thread blocks on
//! that channel, takes the GIL, drains everything queued and disposes each
//! handle, then releases the GIL without triggering another cleanup.

use std::fmt;
use std::iter::FusedIterator;
use std::time::Instant;

use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};

use crate::bridge::Shared;

/// Stable identity of a list entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Arena index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot had when the entry was inserted.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotKey({}v{})", self.index, self.generation)
    }
}

struct Node<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
    next_free: Option<u32>,
}

/// Doubly linked list over a generational arena.
pub struct CleanerList<T> {
    slots: Vec<Slot<T>>,
    head: Option<u32>,
    free: Option<u32>,
    len: usize,
}

impl<T> Default for CleanerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CleanerList<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            free: None,
            len: 0,
        }
    }

    /// Number of linked entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is linked.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Key of the most recently inserted entry.
    #[must_use]
    pub fn head(&self) -> Option<SlotKey> {
        self.head.map(|index| self.key_at(index))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn key_at(&self, index: u32) -> SlotKey {
        SlotKey {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Links a new entry at the head. `f` receives the entry's key.
    ///
    /// # Panics
    ///
    /// If the arena already holds `u32::MAX` slots.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert_with(&mut self, f: impl FnOnce(SlotKey) -> T) -> SlotKey {
        let index = if let Some(index) = self.free {
            self.free = self.slots[index as usize].next_free.take();
            index
        } else {
            assert!(self.slots.len() < u32::MAX as usize, "cleaner list is full");
            self.slots.push(Slot {
                generation: 0,
                node: None,
                next_free: None,
            });
            (self.slots.len() - 1) as u32
        };

        let key = self.key_at(index);
        let old_head = self.head;
        if let Some(old) = old_head {
            if let Some(node) = self.slots[old as usize].node.as_mut() {
                node.prev = Some(index);
            }
        }
        self.slots[index as usize].node = Some(Node {
            value: f(key),
            prev: None,
            next: old_head,
        });
        self.head = Some(index);
        self.len += 1;
        key
    }

    /// Unlinks the entry at `key` and returns it.
    ///
    /// Returns `None` if the key is stale, so each entry leaves exactly once.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free;
        self.free = Some(key.index);

        match node.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev as usize].node.as_mut() {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        if let Some(next) = node.next {
            if let Some(n) = self.slots[next as usize].node.as_mut() {
                n.prev = node.prev;
            }
        }
        self.len -= 1;
        Some(node.value)
    }

    /// Returns the entry at `key`, if still linked.
    #[must_use]
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_ref().map(|node| &node.value)
    }

    /// Returns `true` if `key` is linked.
    #[must_use]
    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Walks the list from the head.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len,
        }
    }

    /// Unlinks every entry, head first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(key) = self.head() {
            if let Some(value) = self.remove(key) {
                out.push(value);
            }
        }
        out
    }
}

impl<T> fmt::Debug for CleanerList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanerList")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

/// Iterator over a [`CleanerList`], head first.
pub struct Iter<'a, T> {
    list: &'a CleanerList<T>,
    cursor: Option<u32>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (SlotKey, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.slots[index as usize].node.as_ref()?;
        self.cursor = node.next;
        self.remaining -= 1;
        Some((self.list.key_at(index), &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
impl<T> FusedIterator for Iter<'_, T> {}

/// Message delivered to the reaper thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperMessage {
    /// The managed object behind this entry has been collected.
    Collected(SlotKey),
    /// Stop after the current batch.
    Shutdown,
}

/// Counts collection notifications the reaper has not processed yet.
#[derive(Default)]
pub(crate) struct ReaperSync {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl ReaperSync {
    pub(crate) fn delivered(&self) {
        *self.pending.lock() += 1;
    }

    pub(crate) fn processed(&self, n: usize) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(n);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Waits until every delivered notification was processed.
    pub(crate) fn wait_drained(&self, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            if self.drained.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Wakes waiters after shutdown abandons queued notifications.
    pub(crate) fn reset(&self) {
        *self.pending.lock() = 0;
        self.drained.notify_all();
    }
}

/// Body of the reaper thread.
pub(crate) fn run_reaper(shared: &Shared, rx: &Receiver<ReaperMessage>) {
    crate::tracing::log_reaper_started();
    while let Ok(first) = rx.recv() {
        let ReaperMessage::Collected(first) = first else {
            break;
        };

        let guard = shared.gil.acquire();
        let _span = crate::tracing::span_reaper_batch();
        let mut batch = Vec::with_capacity(shared.config.reaper_batch_hint);
        batch.push(first);
        let mut stop = false;
        for message in rx.try_iter() {
            match message {
                ReaperMessage::Collected(key) => batch.push(key),
                ReaperMessage::Shutdown => {
                    stop = true;
                    break;
                }
            }
        }

        let released = shared.reap_batch(&guard, &batch);
        guard.release_no_cleanup();
        // Retained sets of disposed owners drop outside the GIL.
        drop(released);
        shared.reaper_sync.processed(batch.len());

        if stop {
            break;
        }
    }
    crate::tracing::log_reaper_stopped();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &CleanerList<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_insert_links_at_head() {
        let mut list = CleanerList::new();
        let a = list.insert_with(|_| 1);
        let b = list.insert_with(|_| 2);
        assert_eq!(list.head(), Some(b));
        assert_eq!(collect(&list), vec![2, 1]);
        assert_eq!(list.get(a), Some(&1));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_head_middle_tail() {
        let mut list = CleanerList::new();
        let a = list.insert_with(|_| 1);
        let b = list.insert_with(|_| 2);
        let c = list.insert_with(|_| 3);
        let d = list.insert_with(|_| 4);

        assert_eq!(list.remove(d), Some(4));
        assert_eq!(list.head(), Some(c));
        assert_eq!(list.remove(b), Some(2));
        assert_eq!(collect(&list), vec![3, 1]);
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(collect(&list), vec![3]);
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
    }

    #[test]
    fn test_stale_key_is_rejected_after_reuse() {
        let mut list = CleanerList::new();
        let a = list.insert_with(|_| 1);
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(a), None);

        let b = list.insert_with(|_| 2);
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(list.get(a), None);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.get(b), Some(&2));
    }

    #[test]
    fn test_insert_with_sees_own_key() {
        let mut list = CleanerList::new();
        let key = list.insert_with(|k| k.index());
        assert_eq!(list.get(key), Some(&key.index()));
    }

    #[test]
    fn test_drain_empties_list() {
        let mut list = CleanerList::new();
        for i in 0..5 {
            list.insert_with(|_| i);
        }
        let mut drained = list.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
        assert_eq!(list.iter().len(), 0);
    }

    #[test]
    fn test_reaper_sync_waits_for_processing() {
        let sync = std::sync::Arc::new(ReaperSync::default());
        sync.delivered();
        sync.delivered();
        let deadline = Instant::now() + std::time::Duration::from_millis(10);
        assert!(!sync.wait_drained(deadline));

        let worker = std::sync::Arc::clone(&sync);
        let t = std::thread::spawn(move || worker.processed(2));
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        assert!(sync.wait_drained(deadline));
        t.join().unwrap();
        assert_eq!(sync.pending(), 0);
    }
}
