//! # Atomic Bitmap
//!
//! A fixed-size array of `AtomicU64` words where each bit records whether one
//! allocation unit (a heap slot) is in use.
//!
//! ## Mutation Paths
//!
//! | Method                     | Synchronization                            |
//! |----------------------------|--------------------------------------------|
//! | `set_bit_value`            | none, requires `&mut self`                 |
//! | `try_set_bit_value`        | single CAS, may fail under contention      |
//! | `safe_set_bit_value`       | CAS loop until it succeeds                 |
//! | `safe_set_bit_range_value` | CAS loop per word across the range         |
//!
//! `try_set_bit_value` lets a caller back off and pick another target instead
//! of spinning on a hot word. The safe paths never lose updates made by other
//! safe setters to sibling bits of the same word.
//!
//! ## Range Masks
//!
//! A range can start and end in the middle of a word:
//!
//! ```text
//! word 0                word 1                word 2
//! [........XXXXXXXX]    [XXXXXXXXXXXXXXXX]    [XXXX............]
//!          ^ start                                  ^ end (inclusive)
//! ```
//!
//! The first and last words get partial masks; bits outside the range are
//! never touched.
//!
//! ## Scans
//!
//! `count_set_bits`, `find_first_unset_bit` and `find_last_set_bit` read whole
//! words atomically and accept an optional exclusive end bound. A failed search
//! returns `None`; [`NOT_FOUND`] is the raw sentinel returned by the `_raw`
//! variant for callers that store bit indexes in plain integers.
//!
//! ## Panics
//!
//! Index and range preconditions are programmer errors and panic, like slice
//! indexing does.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Sentinel used by [`Bitmap::find_first_unset_bit_raw`] when nothing is found.
pub const NOT_FOUND: usize = usize::MAX;

const ALL_SET: u64 = u64::MAX;

#[inline]
fn apply_mask(word: u64, mask: u64, set: bool) -> u64 {
    if set {
        word | mask
    } else {
        word & !mask
    }
}

#[inline]
fn range_mask(first_bit: usize, bit_count: usize) -> u64 {
    debug_assert!(bit_count > 0 && first_bit + bit_count <= BITS_PER_WORD);
    if bit_count == BITS_PER_WORD {
        ALL_SET
    } else {
        ((1u64 << bit_count) - 1) << first_bit
    }
}

pub struct Bitmap {
    words: Box<[AtomicU64]>,
}

impl Bitmap {
    /// Creates a bitmap able to hold at least `bit_count` bits, all unset.
    pub fn new(bit_count: usize) -> Self {
        assert!(bit_count > 0, "bitmap must hold at least one bit");
        let word_count = bit_count.div_ceil(BITS_PER_WORD);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub fn size_in_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bits(&self) -> usize {
        self.words.len() * BITS_PER_WORD
    }

    #[inline]
    fn locate(&self, index: usize) -> (&AtomicU64, u64) {
        assert!(
            index < self.len_bits(),
            "bit index {} out of range (bitmap holds {} bits)",
            index,
            self.len_bits()
        );
        (&self.words[index / BITS_PER_WORD], 1u64 << (index % BITS_PER_WORD))
    }

    fn resolve_limit(&self, limit: Option<usize>) -> usize {
        match limit {
            None => self.len_bits(),
            Some(end) => {
                assert!(
                    end > 0 && end <= self.len_bits(),
                    "scan limit {} out of range (bitmap holds {} bits)",
                    end,
                    self.len_bits()
                );
                end
            }
        }
    }

    pub fn is_bit_set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Unsynchronized update. The exclusive borrow is the caller's proof that
    /// no other thread is touching the bitmap.
    pub fn set_bit_value(&mut self, index: usize, value: bool) {
        assert!(
            index < self.len_bits(),
            "bit index {} out of range (bitmap holds {} bits)",
            index,
            self.len_bits()
        );
        let word = self.words[index / BITS_PER_WORD].get_mut();
        *word = apply_mask(*word, 1u64 << (index % BITS_PER_WORD), value);
    }

    /// One compare-and-swap attempt. Returns `false` if the containing word
    /// changed between the read and the swap.
    pub fn try_set_bit_value(&self, index: usize, value: bool) -> bool {
        let (word, mask) = self.locate(index);
        try_apply_mask(word, mask, value)
    }

    pub fn safe_set_bit_value(&self, index: usize, value: bool) {
        let (word, mask) = self.locate(index);
        safe_apply_mask(word, mask, value);
    }

    /// Sets or clears `[start, start + count)` with per-word CAS.
    pub fn safe_set_bit_range_value(&self, start: usize, count: usize, value: bool) {
        assert!(count > 0, "bit range must not be empty");
        let end = start.saturating_add(count - 1);
        assert!(
            end < self.len_bits(),
            "bit range [{}, {}] out of range (bitmap holds {} bits)",
            start,
            end,
            self.len_bits()
        );

        let start_word = start / BITS_PER_WORD;
        let end_word = end / BITS_PER_WORD;
        let start_bit = start % BITS_PER_WORD;
        let end_bit = end % BITS_PER_WORD;

        if start_word == end_word {
            safe_apply_mask(&self.words[start_word], range_mask(start_bit, count), value);
            return;
        }

        safe_apply_mask(
            &self.words[start_word],
            range_mask(start_bit, BITS_PER_WORD - start_bit),
            value,
        );

        for word in &self.words[start_word + 1..end_word] {
            safe_apply_mask(word, ALL_SET, value);
        }

        safe_apply_mask(&self.words[end_word], range_mask(0, end_bit + 1), value);
    }

    /// Counts set bits in `[0, limit)`, or in the whole bitmap.
    pub fn count_set_bits(&self, limit: Option<usize>) -> usize {
        let end = self.resolve_limit(limit);
        let full_words = end / BITS_PER_WORD;
        let tail_bits = end % BITS_PER_WORD;

        let mut count: usize = self.words[..full_words]
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum();

        if tail_bits != 0 {
            let word = self.words[full_words].load(Ordering::Acquire);
            count += (word & range_mask(0, tail_bits)).count_ones() as usize;
        }

        count
    }

    pub fn find_first_unset_bit(&self, limit: Option<usize>) -> Option<usize> {
        let end = self.resolve_limit(limit);
        self.find_first_unset_bit_from(0, end)
    }

    pub fn find_first_unset_bit_raw(&self, limit: Option<usize>) -> usize {
        self.find_first_unset_bit(limit).unwrap_or(NOT_FOUND)
    }

    /// First unset bit in `[start, end)`.
    pub fn find_first_unset_bit_from(&self, start: usize, end: usize) -> Option<usize> {
        assert!(
            end <= self.len_bits(),
            "scan end {} out of range (bitmap holds {} bits)",
            end,
            self.len_bits()
        );
        if start >= end {
            return None;
        }

        let mut word_index = start / BITS_PER_WORD;
        let last_word = (end - 1) / BITS_PER_WORD;

        while word_index <= last_word {
            let mut word = self.words[word_index].load(Ordering::Acquire);
            let word_base = word_index * BITS_PER_WORD;

            // Treat bits outside [start, end) as used.
            if word_index == start / BITS_PER_WORD {
                let skip = start % BITS_PER_WORD;
                if skip > 0 {
                    word |= range_mask(0, skip);
                }
            }
            if word_index == last_word {
                let keep = end - word_base;
                if keep < BITS_PER_WORD {
                    word |= !range_mask(0, keep);
                }
            }

            if word != ALL_SET {
                return Some(word_base + (!word).trailing_zeros() as usize);
            }
            word_index += 1;
        }

        None
    }

    /// Last set bit in `[0, limit)`, or in the whole bitmap.
    pub fn find_last_set_bit(&self, limit: Option<usize>) -> Option<usize> {
        let end = self.resolve_limit(limit);
        if end == 0 {
            return None;
        }
        let last_word = (end - 1) / BITS_PER_WORD;
        let tail_bits = end - last_word * BITS_PER_WORD;

        self.words[..=last_word]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, word)| {
                let mut word = word.load(Ordering::Acquire);
                if index == last_word && tail_bits < BITS_PER_WORD {
                    word &= range_mask(0, tail_bits);
                }
                (word != 0).then(|| {
                    index * BITS_PER_WORD + (BITS_PER_WORD - 1 - word.leading_zeros() as usize)
                })
            })
    }

    /// Whether every bit in `[start, start + count)` is unset.
    pub fn is_range_clear(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|index| !self.is_bit_set(index))
    }
}

fn try_apply_mask(word: &AtomicU64, mask: u64, set: bool) -> bool {
    let current = word.load(Ordering::Acquire);
    let updated = apply_mask(current, mask, set);
    word.compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn safe_apply_mask(word: &AtomicU64, mask: u64, set: bool) {
    loop {
        let current = word.load(Ordering::Acquire);
        let updated = apply_mask(current, mask, set);
        match word.compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(_) => continue,
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("bits", &self.len_bits())
            .field("set", &self.count_set_bits(None))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_bitmap_rounds_up_to_whole_words() {
        let bitmap = Bitmap::new(65);
        assert_eq!(bitmap.size_in_words(), 2);
        assert_eq!(bitmap.len_bits(), 128);
        assert_eq!(bitmap.count_set_bits(None), 0);
    }

    #[test]
    fn set_bit_value_sets_and_clears_single_bit() {
        let mut bitmap = Bitmap::new(128);
        bitmap.set_bit_value(70, true);
        assert!(bitmap.is_bit_set(70));
        assert!(!bitmap.is_bit_set(69));
        bitmap.set_bit_value(70, false);
        assert!(!bitmap.is_bit_set(70));
    }

    #[test]
    fn try_set_bit_value_succeeds_without_contention() {
        let bitmap = Bitmap::new(64);
        assert!(bitmap.try_set_bit_value(3, true));
        assert!(bitmap.is_bit_set(3));
    }

    #[test]
    fn safe_set_preserves_sibling_bits_under_contention() {
        let bitmap = Arc::new(Bitmap::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || {
                    for bit in (t..64).step_by(8) {
                        bitmap.safe_set_bit_value(bit, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bitmap.count_set_bits(None), 64);
    }

    #[test]
    fn range_within_single_word_leaves_neighbours_untouched() {
        let bitmap = Bitmap::new(64);
        bitmap.safe_set_bit_value(2, true);
        bitmap.safe_set_bit_value(9, true);

        bitmap.safe_set_bit_range_value(3, 6, true);
        assert_eq!(bitmap.count_set_bits(None), 8);

        bitmap.safe_set_bit_range_value(3, 6, false);
        assert!(bitmap.is_bit_set(2));
        assert!(bitmap.is_bit_set(9));
        assert_eq!(bitmap.count_set_bits(None), 2);
    }

    #[test]
    fn range_spanning_words_round_trips() {
        let bitmap = Bitmap::new(256);
        for bit in [0, 59, 200, 255] {
            bitmap.safe_set_bit_value(bit, true);
        }
        let before = bitmap.count_set_bits(None);

        bitmap.safe_set_bit_range_value(60, 139, true);
        assert_eq!(bitmap.count_set_bits(None), before + 139);
        assert!(bitmap.is_bit_set(60));
        assert!(bitmap.is_bit_set(198));
        assert!(!bitmap.is_bit_set(199));

        bitmap.safe_set_bit_range_value(60, 139, false);
        assert_eq!(bitmap.count_set_bits(None), before);
        for bit in [0, 59, 200, 255] {
            assert!(bitmap.is_bit_set(bit));
        }
    }

    #[test]
    fn range_covering_exact_words() {
        let bitmap = Bitmap::new(192);
        bitmap.safe_set_bit_range_value(64, 64, true);
        assert_eq!(bitmap.count_set_bits(None), 64);
        assert!(!bitmap.is_bit_set(63));
        assert!(!bitmap.is_bit_set(128));
    }

    #[test]
    fn count_set_bits_respects_limit() {
        let bitmap = Bitmap::new(128);
        bitmap.safe_set_bit_range_value(0, 100, true);
        assert_eq!(bitmap.count_set_bits(Some(10)), 10);
        assert_eq!(bitmap.count_set_bits(Some(64)), 64);
        assert_eq!(bitmap.count_set_bits(Some(70)), 70);
        assert_eq!(bitmap.count_set_bits(None), 100);
    }

    #[test]
    fn find_first_unset_bit_skips_set_prefix() {
        let bitmap = Bitmap::new(128);
        bitmap.safe_set_bit_range_value(0, 67, true);
        assert_eq!(bitmap.find_first_unset_bit(None), Some(67));
    }

    #[test]
    fn find_first_unset_bit_on_full_bitmap_is_not_found() {
        let bitmap = Bitmap::new(128);
        bitmap.safe_set_bit_range_value(0, 128, true);
        assert_eq!(bitmap.find_first_unset_bit(None), None);
        assert_eq!(bitmap.find_first_unset_bit_raw(None), NOT_FOUND);
    }

    #[test]
    fn find_first_unset_bit_honours_limit() {
        let bitmap = Bitmap::new(128);
        bitmap.safe_set_bit_range_value(0, 10, true);
        assert_eq!(bitmap.find_first_unset_bit(Some(10)), None);
        assert_eq!(bitmap.find_first_unset_bit(Some(11)), Some(10));
    }

    #[test]
    fn find_first_unset_bit_from_starts_mid_word() {
        let bitmap = Bitmap::new(128);
        bitmap.safe_set_bit_range_value(5, 10, true);
        assert_eq!(bitmap.find_first_unset_bit_from(5, 128), Some(15));
        assert_eq!(bitmap.find_first_unset_bit_from(2, 128), Some(2));
        assert_eq!(bitmap.find_first_unset_bit_from(5, 15), None);
    }

    #[test]
    fn find_last_set_bit_scans_backwards() {
        let bitmap = Bitmap::new(256);
        assert_eq!(bitmap.find_last_set_bit(None), None);
        bitmap.safe_set_bit_value(3, true);
        bitmap.safe_set_bit_value(130, true);
        assert_eq!(bitmap.find_last_set_bit(None), Some(130));
    }

    #[test]
    fn find_last_set_bit_honours_limit() {
        let bitmap = Bitmap::new(256);
        bitmap.safe_set_bit_value(3, true);
        bitmap.safe_set_bit_value(70, true);
        bitmap.safe_set_bit_value(130, true);
        assert_eq!(bitmap.find_last_set_bit(Some(130)), Some(70));
        assert_eq!(bitmap.find_last_set_bit(Some(131)), Some(130));
        assert_eq!(bitmap.find_last_set_bit(Some(64)), Some(3));
        assert_eq!(bitmap.find_last_set_bit(Some(3)), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_index_panics() {
        let bitmap = Bitmap::new(64);
        bitmap.is_bit_set(64);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_range_panics() {
        let bitmap = Bitmap::new(64);
        bitmap.safe_set_bit_range_value(0, 0, true);
    }
}
