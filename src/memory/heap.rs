//! # Object Heap
//!
//! The object heap is one anonymous memory mapping split into `SLOT_SIZE`
//! allocation units. Every object version lives in a contiguous run of slots
//! and is addressed by its byte offset from the start of the mapping.
//!
//! ```text
//! offset 0        64        128       192       256
//!        +---------+---------+---------+---------+----
//!        | reserved| obj A   | obj B (2 slots)   | ...
//!        +---------+---------+---------+---------+----
//! bitmap:    1         1         1         1        0
//! ```
//!
//! Slot 0 is marked used at construction and never handed out, so offset 0
//! keeps meaning "no object" everywhere above this layer.
//!
//! ## Allocation
//!
//! `allocate` is first-fit starting from a rotating hint (the slot after the
//! previous allocation), wrapping once to the start of the heap. Allocators
//! serialize on a mutex; `free` does not take it and clears its range with
//! per-word CAS, so a concurrent free only ever turns bits off under a running
//! search. The first slot of a run is claimed with `try_set_bit_value` and the
//! search is repeated if that CAS loses to a concurrent free touching the same
//! word.
//!
//! ## Access Discipline
//!
//! Slots are written exactly once, while they are private to the transaction
//! that allocated them. Once a version is published it is immutable until the
//! epoch reclaimer frees it, which only happens after no snapshot can reach it.
//! `read` and `write` are therefore `unsafe`: the caller vouches for that
//! discipline, the heap only checks bounds.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use eyre::{ensure, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;

use super::bitmap::Bitmap;
use crate::config::{MIN_HEAP_SIZE, RESERVED_SLOTS, SLOT_SIZE};
use crate::error::DbError;

/// Byte offset of a slot run inside the heap. `0` is never a valid object.
pub type HeapOffset = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub free_slots: usize,
}

pub struct ObjectHeap {
    base: NonNull<u8>,
    len: usize,
    slots: Bitmap,
    slot_count: usize,
    next_hint: AtomicUsize,
    alloc_lock: Mutex<()>,
    _mmap: MmapMut,
}

// SAFETY: the mapping is owned by the heap and lives as long as it. Concurrent
// access goes through `read`/`write`, whose callers guarantee that no slot is
// written while another thread can read it; the bitmap is atomic.
unsafe impl Send for ObjectHeap {}
unsafe impl Sync for ObjectHeap {}

pub fn slots_for(size: usize) -> usize {
    size.div_ceil(SLOT_SIZE).max(1)
}

impl ObjectHeap {
    pub fn new(heap_size: usize) -> Result<Self> {
        ensure!(
            heap_size >= MIN_HEAP_SIZE,
            "heap size {} is below the minimum of {} bytes",
            heap_size,
            MIN_HEAP_SIZE
        );
        ensure!(
            heap_size % SLOT_SIZE == 0,
            "heap size {} is not a multiple of the {}-byte slot size",
            heap_size,
            SLOT_SIZE
        );

        let mut mmap = MmapMut::map_anon(heap_size)?;
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| eyre::eyre!("anonymous mapping returned a null pointer"))?;

        let slot_count = heap_size / SLOT_SIZE;
        let mut slots = Bitmap::new(slot_count);
        for slot in 0..RESERVED_SLOTS {
            slots.set_bit_value(slot, true);
        }
        // Bits past the last slot belong to the final partial word.
        for slot in slot_count..slots.len_bits() {
            slots.set_bit_value(slot, true);
        }

        Ok(Self {
            base,
            len: heap_size,
            slots,
            slot_count,
            next_hint: AtomicUsize::new(RESERVED_SLOTS),
            alloc_lock: Mutex::new(()),
            _mmap: mmap,
        })
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn allocate(&self, size: usize) -> Result<HeapOffset> {
        let wanted = slots_for(size);
        let _guard = self.alloc_lock.lock();

        let hint = self.next_hint.load(Ordering::Relaxed);
        let first = self
            .claim_run(hint, wanted)
            .or_else(|| self.claim_run(RESERVED_SLOTS, wanted));

        match first {
            Some(slot) => {
                let next = slot + wanted;
                self.next_hint.store(
                    if next >= self.slot_count { RESERVED_SLOTS } else { next },
                    Ordering::Relaxed,
                );
                Ok((slot * SLOT_SIZE) as HeapOffset)
            }
            None => Err(DbError::OutOfMemory { requested: size }.into()),
        }
    }

    fn claim_run(&self, from: usize, wanted: usize) -> Option<usize> {
        let end = self.slot_count;
        let mut pos = from;
        while let Some(first) = self.slots.find_first_unset_bit_from(pos, end) {
            if first + wanted > end {
                return None;
            }
            if let Some(used) = (first + 1..first + wanted).find(|&i| self.slots.is_bit_set(i)) {
                pos = used + 1;
                continue;
            }
            if !self.slots.try_set_bit_value(first, true) {
                pos = first;
                continue;
            }
            if wanted > 1 {
                self.slots.safe_set_bit_range_value(first + 1, wanted - 1, true);
            }
            return Some(first);
        }
        None
    }

    pub fn free(&self, offset: HeapOffset, size: usize) -> Result<()> {
        let (slot, count) = self.slot_range(offset, size)?;
        debug_assert!(
            (slot..slot + count).all(|s| self.slots.is_bit_set(s)),
            "freeing slots that are not allocated"
        );
        self.slots.safe_set_bit_range_value(slot, count, false);
        Ok(())
    }

    pub fn is_allocated(&self, offset: HeapOffset) -> bool {
        let slot = offset as usize / SLOT_SIZE;
        offset as usize % SLOT_SIZE == 0
            && slot >= RESERVED_SLOTS
            && slot < self.slot_count
            && self.slots.is_bit_set(slot)
    }

    fn slot_range(&self, offset: HeapOffset, size: usize) -> Result<(usize, usize)> {
        let offset = offset as usize;
        ensure!(
            offset % SLOT_SIZE == 0,
            "heap offset {} is not slot-aligned",
            offset
        );
        let slot = offset / SLOT_SIZE;
        let count = slots_for(size);
        ensure!(
            slot >= RESERVED_SLOTS && slot + count <= self.slot_count,
            "heap range at offset {} ({} slots) is outside the heap",
            offset,
            count
        );
        Ok((slot, count))
    }

    fn check_bounds(&self, offset: HeapOffset, len: usize) -> Result<usize> {
        let start = offset as usize;
        ensure!(
            start >= RESERVED_SLOTS * SLOT_SIZE
                && start.checked_add(len).is_some_and(|end| end <= self.len),
            "heap access [{}, +{}) out of bounds (heap is {} bytes)",
            start,
            len,
            self.len
        );
        Ok(start)
    }

    /// Copies `len` bytes starting at `offset` out of the heap.
    ///
    /// # Safety
    ///
    /// The range must belong to a published version that cannot be reclaimed
    /// while this call runs (the caller holds a snapshot that can see it), or
    /// to an allocation private to the caller.
    pub unsafe fn read(&self, offset: HeapOffset, len: usize) -> Result<Vec<u8>> {
        let start = self.check_bounds(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; the caller guarantees no concurrent
        // writer for this range.
        std::ptr::copy_nonoverlapping(self.base.as_ptr().add(start), out.as_mut_ptr(), len);
        Ok(out)
    }

    /// Copies `bytes` into the heap at `offset`.
    ///
    /// # Safety
    ///
    /// The range must lie inside an allocation the caller owns and that no
    /// other thread can observe yet.
    pub unsafe fn write(&self, offset: HeapOffset, bytes: &[u8]) -> Result<()> {
        let start = self.check_bounds(offset, bytes.len())?;
        // SAFETY: bounds checked above; the caller guarantees exclusive access.
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(start), bytes.len());
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        let total_slots = self.slot_count - RESERVED_SLOTS;
        let used_slots = self.slots.count_set_bits(Some(self.slot_count)) - RESERVED_SLOTS;
        HeapStats {
            total_slots,
            used_slots,
            free_slots: total_slots - used_slots,
        }
    }
}

impl std::fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("size", &self.len)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::db_error;
    use std::sync::Arc;
    use std::thread;

    fn small_heap() -> ObjectHeap {
        ObjectHeap::new(MIN_HEAP_SIZE).unwrap()
    }

    #[test]
    fn new_heap_rejects_unaligned_size() {
        assert!(ObjectHeap::new(MIN_HEAP_SIZE + 1).is_err());
        assert!(ObjectHeap::new(SLOT_SIZE).is_err());
    }

    #[test]
    fn allocate_never_returns_offset_zero() {
        let heap = small_heap();
        let offset = heap.allocate(10).unwrap();
        assert_ne!(offset, 0);
        assert_eq!(offset as usize % SLOT_SIZE, 0);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let heap = small_heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(10).unwrap();
        assert!(b >= a + 128 || a >= b + 64);
        assert_eq!(heap.stats().used_slots, 3);
    }

    #[test]
    fn free_returns_slots_to_the_pool() {
        let heap = small_heap();
        let offset = heap.allocate(200).unwrap();
        assert_eq!(heap.stats().used_slots, 4);
        heap.free(offset, 200).unwrap();
        assert_eq!(heap.stats().used_slots, 0);
        assert!(!heap.is_allocated(offset));
    }

    #[test]
    fn exhausted_heap_reports_out_of_memory() {
        let heap = small_heap();
        let total = heap.stats().total_slots;
        heap.allocate(total * SLOT_SIZE).unwrap();

        let err = heap.allocate(1).unwrap_err();
        assert_eq!(db_error(&err), Some(&DbError::OutOfMemory { requested: 1 }));
    }

    #[test]
    fn allocation_wraps_around_to_freed_space() {
        let heap = small_heap();
        let total = heap.stats().total_slots;
        let first = heap.allocate(SLOT_SIZE).unwrap();
        heap.allocate((total - 1) * SLOT_SIZE).unwrap();
        heap.free(first, SLOT_SIZE).unwrap();

        assert_eq!(heap.allocate(SLOT_SIZE).unwrap(), first);
    }

    #[test]
    fn write_then_read_returns_same_bytes() {
        let heap = small_heap();
        let offset = heap.allocate(5).unwrap();
        unsafe {
            heap.write(offset, b"hello").unwrap();
            assert_eq!(heap.read(offset, 5).unwrap(), b"hello");
        }
    }

    #[test]
    fn read_past_end_is_rejected() {
        let heap = small_heap();
        let err = unsafe { heap.read(heap.size() as u64 - 8, 16) };
        assert!(err.is_err());
        let err = unsafe { heap.read(0, 8) };
        assert!(err.is_err());
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let heap = Arc::new(small_heap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    (0..50)
                        .map(|_| heap.allocate(SLOT_SIZE * 2).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut offsets: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 2 * SLOT_SIZE as u64);
        }
        assert_eq!(heap.stats().used_slots, 400);
    }
}
