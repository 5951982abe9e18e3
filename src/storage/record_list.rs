//! # Record Lists
//!
//! A record list enumerates the locators that hold (or once held) objects of a
//! single type. It is a chain of fixed-capacity ranges:
//!
//! ```text
//! ranges ──> [ L3 L9 x  L4 ] ──> [ L12 L2 x  x  ] ──> [ L8 _  _  _ ]
//!              capacity 4          has_deletions        next_available_index = 1
//! ```
//!
//! `x` marks a tombstoned entry. Entries are appended to the first range with
//! room; a new range is linked at the tail only when every range is full.
//!
//! ## Locking
//!
//! | Lock         | Taken by                                            |
//! |--------------|-----------------------------------------------------|
//! | chain (read) | `add`, `compact`, iterator moving to the next range |
//! | chain (write)| `add` linking a new tail range, `reset`             |
//! | range (read) | positioned iterators, `request_deletion`            |
//! | range (write)| `add` into that range, `compact`                    |
//!
//! A [`RecordIterator`] owns a shared guard on its current range (an
//! Arc-backed guard, so it can outlive the borrow of the list). Compaction
//! needs the exclusive range lock and therefore waits for positioned
//! iterators instead of moving entries underneath them. `try_compact` skips
//! busy ranges.
//!
//! An iterator always drops its range guard before touching the chain lock,
//! so adders and iterators never wait on each other in a cycle.
//!
//! ## Deletion
//!
//! Deleting marks the entry and the range; nothing moves until compaction.
//! The list keeps an approximate count of tombstones and `start` runs a
//! non-blocking compaction once that count exceeds one range worth.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};

use super::{Locator, INVALID_LOCATOR};

#[derive(Debug)]
struct RecordSlot {
    locator: Locator,
    deleted: AtomicBool,
}

#[derive(Debug)]
pub struct RecordRange {
    slots: Vec<RecordSlot>,
    capacity: usize,
    has_deletions: AtomicBool,
}

impl RecordRange {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            has_deletions: AtomicBool::new(false),
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn next_available_index(&self) -> usize {
        self.slots.len()
    }

    pub fn has_deletions(&self) -> bool {
        self.has_deletions.load(Ordering::Acquire)
    }

    fn push(&mut self, locator: Locator) {
        debug_assert!(!self.is_full(), "range is full");
        self.slots.push(RecordSlot {
            locator,
            deleted: AtomicBool::new(false),
        });
    }

    fn mark_deleted(&self, index: usize) -> bool {
        let newly = !self.slots[index].deleted.swap(true, Ordering::AcqRel);
        if newly {
            self.has_deletions.store(true, Ordering::Release);
        }
        newly
    }

    /// Slides surviving entries down and returns how many were removed.
    fn compact(&mut self) -> usize {
        if !self.has_deletions() {
            return 0;
        }
        let before = self.slots.len();
        self.slots.retain(|slot| !slot.deleted.load(Ordering::Acquire));
        self.has_deletions.store(false, Ordering::Release);
        before - self.slots.len()
    }
}

/// Snapshot of one record list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordData {
    pub locator: Locator,
    pub deleted: bool,
}

/// Cursor over a [`RecordList`]. Holds a shared lock on the range it is
/// positioned in until it moves on, reaches the end, or is dropped.
#[derive(Default)]
pub struct RecordIterator {
    range: Option<ArcRwLockReadGuard<RawRwLock, RecordRange>>,
    range_index: usize,
    index: usize,
}

impl RecordIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_end(&self) -> bool {
        self.range.is_none()
    }
}

impl std::fmt::Debug for RecordIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordIterator")
            .field("range_index", &self.range_index)
            .field("index", &self.index)
            .field("at_end", &self.at_end())
            .finish()
    }
}

#[derive(Debug)]
pub struct RecordList {
    range_size: usize,
    ranges: RwLock<Vec<Arc<RwLock<RecordRange>>>>,
    approximate_deletions: AtomicUsize,
}

impl RecordList {
    pub fn new(range_size: usize) -> Self {
        assert!(range_size > 0, "range size must be greater than 0");
        Self {
            range_size,
            ranges: RwLock::new(vec![Arc::new(RwLock::new(RecordRange::new(range_size)))]),
            approximate_deletions: AtomicUsize::new(0),
        }
    }

    pub fn range_size(&self) -> usize {
        self.range_size
    }

    pub fn range_count(&self) -> usize {
        self.ranges.read().len()
    }

    fn range_at(&self, index: usize) -> Option<Arc<RwLock<RecordRange>>> {
        self.ranges.read().get(index).cloned()
    }

    fn all_ranges(&self) -> Vec<Arc<RwLock<RecordRange>>> {
        self.ranges.read().clone()
    }

    pub fn add(&self, locator: Locator) {
        assert_ne!(locator, INVALID_LOCATOR, "invalid locator added to record list");

        {
            let ranges = self.ranges.read();
            for range in ranges.iter() {
                if range.read().is_full() {
                    continue;
                }
                let mut range = range.write();
                if !range.is_full() {
                    range.push(locator);
                    return;
                }
            }
        }

        let mut ranges = self.ranges.write();
        // Another adder may have linked a tail while we waited.
        if let Some(last) = ranges.last() {
            let mut last = last.write();
            if !last.is_full() {
                last.push(locator);
                return;
            }
        }
        let mut range = RecordRange::new(self.range_size);
        range.push(locator);
        ranges.push(Arc::new(RwLock::new(range)));
    }

    /// Positions `iterator` on the first live entry. Returns `false` if there
    /// is none.
    pub fn start(&self, iterator: &mut RecordIterator) -> bool {
        if self.approximate_deletions.load(Ordering::Relaxed) > self.range_size {
            self.try_compact();
        }

        *iterator = RecordIterator::default();
        match self.range_at(0) {
            Some(first) => iterator.range = Some(first.read_arc()),
            None => return false,
        }
        self.seek_live(iterator)
    }

    pub fn move_next(&self, iterator: &mut RecordIterator) -> bool {
        if iterator.range.is_none() {
            return false;
        }
        iterator.index += 1;
        self.seek_live(iterator)
    }

    fn seek_live(&self, iterator: &mut RecordIterator) -> bool {
        loop {
            let Some(range) = iterator.range.as_ref() else {
                return false;
            };
            while iterator.index < range.slots.len() {
                if !range.slots[iterator.index].deleted.load(Ordering::Acquire) {
                    return true;
                }
                iterator.index += 1;
            }

            let next = iterator.range_index + 1;
            iterator.range = None;
            let Some(next_range) = self.range_at(next) else {
                return false;
            };
            iterator.range = Some(next_range.read_arc());
            iterator.range_index = next;
            iterator.index = 0;
        }
    }

    pub fn get_record_data(&self, iterator: &RecordIterator) -> RecordData {
        let range = iterator
            .range
            .as_ref()
            .unwrap_or_else(|| panic!("iterator is not positioned on a record"));
        let slot = &range.slots[iterator.index];
        RecordData {
            locator: slot.locator,
            deleted: slot.deleted.load(Ordering::Acquire),
        }
    }

    pub fn delete_record_data(&self, iterator: &RecordIterator) {
        let range = iterator
            .range
            .as_ref()
            .unwrap_or_else(|| panic!("iterator is not positioned on a record"));
        if range.mark_deleted(iterator.index) {
            self.approximate_deletions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tombstones the live entry for `locator`, if there is one.
    pub fn request_deletion(&self, locator: Locator) -> bool {
        for range in self.all_ranges() {
            let range = range.read();
            let found = range
                .slots
                .iter()
                .position(|slot| slot.locator == locator && !slot.deleted.load(Ordering::Acquire));
            if let Some(index) = found {
                if range.mark_deleted(index) {
                    self.approximate_deletions.fetch_add(1, Ordering::Relaxed);
                }
                return true;
            }
        }
        false
    }

    /// Removes tombstoned entries from every range, waiting for positioned
    /// iterators to move off each range first.
    pub fn compact(&self) -> usize {
        let removed: usize = self
            .all_ranges()
            .iter()
            .map(|range| range.write().compact())
            .sum();
        self.note_compacted(removed);
        removed
    }

    /// Like [`compact`](Self::compact) but skips ranges that are locked.
    pub fn try_compact(&self) -> usize {
        let removed: usize = self
            .all_ranges()
            .iter()
            .filter_map(|range| range.try_write().map(|mut range| range.compact()))
            .sum();
        self.note_compacted(removed);
        removed
    }

    fn note_compacted(&self, removed: usize) {
        if removed > 0 {
            let _ = self.approximate_deletions.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |count| Some(count.saturating_sub(removed)),
            );
        }
    }

    pub fn reset(&self) {
        let mut ranges = self.ranges.write();
        *ranges = vec![Arc::new(RwLock::new(RecordRange::new(self.range_size)))];
        self.approximate_deletions.store(0, Ordering::Relaxed);
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.all_ranges().iter().map(|r| r.read().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_live(&self) -> usize {
        self.all_ranges()
            .iter()
            .map(|r| {
                r.read()
                    .slots
                    .iter()
                    .filter(|s| !s.deleted.load(Ordering::Acquire))
                    .count()
            })
            .sum()
    }

    pub fn approximate_deletions(&self) -> usize {
        self.approximate_deletions.load(Ordering::Relaxed)
    }

    /// Live locators in list order.
    pub fn live_locators(&self) -> Vec<Locator> {
        let mut out = Vec::new();
        let mut iterator = RecordIterator::new();
        let mut more = self.start(&mut iterator);
        while more {
            out.push(self.get_record_data(&iterator).locator);
            more = self.move_next(&mut iterator);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn iteration_follows_insertion_order_across_ranges() {
        let list = RecordList::new(2);
        for locator in 1..=5 {
            list.add(locator);
        }
        assert_eq!(list.range_count(), 3);
        assert_eq!(list.live_locators(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_list_start_returns_false() {
        let list = RecordList::new(4);
        let mut iterator = RecordIterator::new();
        assert!(!list.start(&mut iterator));
        assert!(iterator.at_end());
        assert!(!list.move_next(&mut iterator));
    }

    #[test]
    fn iteration_skips_tombstones() {
        let list = RecordList::new(4);
        for locator in [10, 11, 12, 13, 14] {
            list.add(locator);
        }

        let mut iterator = RecordIterator::new();
        assert!(list.start(&mut iterator));
        assert!(list.move_next(&mut iterator));
        assert_eq!(list.get_record_data(&iterator).locator, 11);
        list.delete_record_data(&iterator);
        assert!(list.get_record_data(&iterator).deleted);
        drop(iterator);

        assert!(list.request_deletion(14));
        assert!(!list.request_deletion(14));
        assert_eq!(list.live_locators(), vec![10, 12, 13]);
        assert_eq!(list.len(), 5);
        assert_eq!(list.len_live(), 3);
    }

    #[test]
    fn alternating_deletions_across_ranges_survive_compaction() {
        // Half of two full ranges: not enough deletions for start() to
        // compact on its own.
        for parity in [0, 1] {
            let list = RecordList::new(11);
            for locator in 1..=22 {
                list.add(locator);
            }
            assert_eq!(list.range_count(), 2);
            let (deleted, kept): (Vec<Locator>, Vec<Locator>) =
                (1..=22).partition(|locator| locator % 2 == parity);
            for &locator in &deleted {
                assert!(list.request_deletion(locator));
            }

            assert_eq!(list.live_locators(), kept);
            assert_eq!(list.len(), 22);

            assert_eq!(list.compact(), 11);
            assert_eq!(list.len(), kept.len());
            assert_eq!(list.live_locators(), kept);
        }
    }

    #[test]
    fn compaction_preserves_live_entries_and_frees_space() {
        let list = RecordList::new(4);
        for locator in 1..=4 {
            list.add(locator);
        }
        list.request_deletion(1);
        list.request_deletion(3);

        assert_eq!(list.compact(), 2);
        assert_eq!(list.live_locators(), vec![2, 4]);
        assert_eq!(list.approximate_deletions(), 0);

        list.add(5);
        list.add(6);
        assert_eq!(list.range_count(), 1);
        assert_eq!(list.live_locators(), vec![2, 4, 5, 6]);
    }

    #[test]
    fn try_compact_skips_range_held_by_iterator() {
        let list = RecordList::new(4);
        for locator in 1..=3 {
            list.add(locator);
        }
        list.request_deletion(2);

        let mut iterator = RecordIterator::new();
        assert!(list.start(&mut iterator));
        assert_eq!(list.try_compact(), 0);
        assert_eq!(list.get_record_data(&iterator).locator, 1);

        drop(iterator);
        assert_eq!(list.try_compact(), 1);
    }

    #[test]
    fn compaction_waits_for_positioned_iterator() {
        let list = Arc::new(RecordList::new(4));
        for locator in 1..=3 {
            list.add(locator);
        }
        list.request_deletion(1);

        let mut iterator = RecordIterator::new();
        assert!(list.start(&mut iterator));
        assert_eq!(list.get_record_data(&iterator).locator, 2);

        let compactor = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.compact())
        };

        assert!(list.move_next(&mut iterator));
        assert_eq!(list.get_record_data(&iterator).locator, 3);
        assert!(!list.move_next(&mut iterator));

        assert_eq!(compactor.join().unwrap(), 1);
        assert_eq!(list.live_locators(), vec![2, 3]);
    }

    #[test]
    fn start_compacts_after_many_deletions() {
        let list = RecordList::new(2);
        for locator in 1..=8 {
            list.add(locator);
        }
        for locator in 1..=3 {
            list.request_deletion(locator);
        }
        assert_eq!(list.approximate_deletions(), 3);

        let mut iterator = RecordIterator::new();
        assert!(list.start(&mut iterator));
        assert_eq!(list.get_record_data(&iterator).locator, 4);
        drop(iterator);

        assert_eq!(list.approximate_deletions(), 0);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn reset_empties_the_list() {
        let list = RecordList::new(2);
        for locator in 1..=5 {
            list.add(locator);
        }
        list.reset();
        assert!(list.is_empty());
        assert_eq!(list.range_count(), 1);
    }

    #[test]
    fn concurrent_adds_are_all_recorded() {
        let list = Arc::new(RecordList::new(8));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        list.add(t * 1000 + i + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut locators = list.live_locators();
        locators.sort_unstable();
        locators.dedup();
        assert_eq!(locators.len(), 400);
    }
}
