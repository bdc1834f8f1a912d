//! Bookkeeping for free and reserved byte ranges inside a fixed-capacity
//! memory region.
//!
//! `SlotTracker` never touches memory itself. It hands out byte offsets into
//! a region of `capacity` bytes and takes them back, so the owner of the
//! actual buffer can translate offsets into pointers.
//!
//! # Features
//!
//! - **Best-fit reservation**: the smallest free run able to hold the request
//!   (after aligning its start) is used; ties go to the lowest offset
//! - **Automatic merging**: released slots are merged with adjacent free runs
//! - **Misuse detection**: releasing a range that is not exactly a reserved
//!   slot is rejected and logged instead of corrupting the state
//! - **Diagnostics**: [`MemoryTracking`] flags turn on action logging and
//!   self-validation after every mutation
//!
//! # Examples
//!
//! ```
//! use slot_tracker::{MemoryTracking, SlotTracker};
//!
//! let mut tracker = SlotTracker::new(1024, MemoryTracking::empty());
//!
//! let a = tracker.reserve(100, 16).unwrap();
//! let b = tracker.reserve(200, 16).unwrap();
//! assert_eq!(tracker.total_reserved(), 300);
//!
//! assert!(tracker.release(a, 100));
//! assert!(tracker.release(b, 200));
//! assert!(tracker.is_empty());
//! assert_eq!(tracker.maximum_available(), 1024); // Free runs are merged
//! ```
//!
//! # Performance
//!
//! - Reserve: O(log n) for typical requests, where n is the number of free
//!   runs; a run that is large enough but cannot satisfy the alignment is
//!   skipped, so heavily over-aligned requests may scan further
//! - Release: O(log n)
//! - Capacity queries: O(1), largest free run: O(log n)

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
};

use bitflags::bitflags;
use log::{error, info, warn};

bitflags! {
    /// Diagnostic switches shared by every layer of the allocator.
    ///
    /// The flags are purely observational: they never change which offsets
    /// are handed out. An empty set means tracking is off.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryTracking: u32 {
        /// Log every reserve, release and block lifecycle event.
        const REPORT_ACTIONS = 1 << 0;
        /// Validate the tracker after every mutation and log inconsistencies.
        const CHECK_ACTIONS = 1 << 1;
    }
}

/// Free/reserved state of one contiguous region of `capacity` bytes.
///
/// Free runs are kept twice: keyed by offset for merging on release, and
/// ordered by `(length, offset)` for best-fit search on reserve. Reserved
/// slots are keyed by offset so that a release can be checked against what
/// was actually handed out.
///
/// # Invariants
///
/// - free runs and reserved slots never overlap and together cover
///   `0..capacity` without gaps
/// - no two free runs are adjacent
/// - `total_reserved() + total_available() == capacity()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTracker {
    capacity: usize,
    reserved_size: usize,
    free_runs: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
    reserved: BTreeMap<usize, usize>,
    tracking: MemoryTracking,
}

/// Zero-sized requests still occupy one byte so every live slot has its own
/// offset.
fn slot_size(size: usize) -> usize {
    size.max(1)
}

impl SlotTracker {
    /// Creates a tracker whose whole capacity is one free run.
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_tracker::{MemoryTracking, SlotTracker};
    ///
    /// let tracker = SlotTracker::new(4096, MemoryTracking::empty());
    /// assert!(tracker.is_empty());
    /// assert_eq!(tracker.total_available(), 4096);
    /// ```
    #[must_use]
    pub fn new(capacity: usize, tracking: MemoryTracking) -> Self {
        let mut this = Self {
            capacity,
            reserved_size: 0,
            free_runs: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            reserved: BTreeMap::new(),
            tracking,
        };
        this.insert_free(0, capacity);
        this
    }

    /// Returns the total number of bytes tracked.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes currently reserved.
    #[must_use]
    pub fn total_reserved(&self) -> usize {
        self.reserved_size
    }

    /// Returns the number of bytes not currently reserved.
    #[must_use]
    pub fn total_available(&self) -> usize {
        self.capacity - self.reserved_size
    }

    /// Returns the length of the largest contiguous free run.
    ///
    /// This is the largest request (with alignment 1) that [`reserve`] can
    /// currently satisfy.
    ///
    /// [`reserve`]: Self::reserve
    #[must_use]
    pub fn maximum_available(&self) -> usize {
        self.free_by_size.last().map_or(0, |&(len, _)| len)
    }

    /// Returns `true` if no bytes are reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reserved_size == 0
    }

    /// Returns the number of live slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.reserved.len()
    }

    #[must_use]
    pub fn memory_tracking(&self) -> MemoryTracking {
        self.tracking
    }

    pub fn set_memory_tracking(&mut self, tracking: MemoryTracking) {
        self.tracking = tracking;
    }

    /// Returns an iterator over the free runs in offset order.
    pub fn free_slots(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.free_runs
            .iter()
            .map(|(&offset, &len)| offset..offset + len)
    }

    /// Returns an iterator over the reserved slots in offset order.
    pub fn reserved_slots(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.reserved
            .iter()
            .map(|(&offset, &len)| offset..offset + len)
    }

    /// Reserves `size` bytes whose offset is a multiple of `alignment`.
    ///
    /// The smallest free run that can hold the aligned request is split;
    /// any padding in front of the slot remains free. An `alignment` of zero
    /// is treated as one.
    ///
    /// # Returns
    ///
    /// * `Some(offset)` - the start of the reserved slot
    /// * `None` - no free run can hold the request, or `alignment` is not a
    ///   power of two
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_tracker::{MemoryTracking, SlotTracker};
    ///
    /// let mut tracker = SlotTracker::new(256, MemoryTracking::empty());
    /// assert_eq!(tracker.reserve(10, 1), Some(0));
    /// assert_eq!(tracker.reserve(10, 64), Some(64));
    /// assert_eq!(tracker.reserve(512, 1), None);
    /// ```
    pub fn reserve(&mut self, size: usize, alignment: usize) -> Option<usize> {
        let size = slot_size(size);
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            warn!("slot reserve rejected: alignment {alignment} is not a power of two");
            return None;
        }

        let Some((run_offset, run_len, offset)) = self.find_fit(size, alignment) else {
            if self.tracking.contains(MemoryTracking::REPORT_ACTIONS) {
                info!(
                    "slot reserve({size}, {alignment}) missed: largest free run is {} bytes",
                    self.maximum_available()
                );
            }
            return None;
        };

        self.remove_free(run_offset, run_len);
        self.insert_free(run_offset, offset - run_offset);
        let end = offset + size;
        self.insert_free(end, run_offset + run_len - end);

        self.reserved.insert(offset, size);
        self.reserved_size += size;

        if self.tracking.contains(MemoryTracking::REPORT_ACTIONS) {
            info!("slot reserve({size}, {alignment}) -> offset {offset}");
        }
        self.check_consistency("reserve");
        Some(offset)
    }

    /// Releases the slot previously reserved at `offset` with `size` bytes.
    ///
    /// The freed range is merged with the free runs directly before and
    /// after it.
    ///
    /// # Returns
    ///
    /// `false` (with a warning logged) if no slot of exactly `size` bytes is
    /// reserved at `offset`, e.g. on a double free. The tracker is left
    /// untouched in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_tracker::{MemoryTracking, SlotTracker};
    ///
    /// let mut tracker = SlotTracker::new(256, MemoryTracking::empty());
    /// let offset = tracker.reserve(32, 8).unwrap();
    /// assert!(tracker.release(offset, 32));
    /// assert!(!tracker.release(offset, 32)); // Double free is rejected
    /// ```
    pub fn release(&mut self, offset: usize, size: usize) -> bool {
        let size = slot_size(size);
        match self.reserved.get(&offset) {
            Some(&reserved) if reserved == size => {}
            Some(&reserved) => {
                warn!(
                    "slot release({offset}, {size}) rejected: slot at offset {offset} holds {reserved} bytes"
                );
                return false;
            }
            None => {
                warn!("slot release({offset}, {size}) rejected: no slot reserved at offset {offset}");
                return false;
            }
        }

        self.reserved.remove(&offset);
        self.reserved_size -= size;

        let mut start = offset;
        let mut end = offset + size;

        let prev = self
            .free_runs
            .range(..start)
            .next_back()
            .map(|(&run_offset, &run_len)| (run_offset, run_len));
        if let Some((prev_offset, prev_len)) = prev.filter(|&(o, l)| o + l == start) {
            self.remove_free(prev_offset, prev_len);
            start = prev_offset;
        }

        if let Some(next_len) = self.free_runs.get(&end).copied() {
            self.remove_free(end, next_len);
            end += next_len;
        }

        self.insert_free(start, end - start);

        if self.tracking.contains(MemoryTracking::REPORT_ACTIONS) {
            info!("slot release({offset}, {size}) -> free run {start}..{end}");
        }
        self.check_consistency("release");
        true
    }

    /// Checks every structural invariant of the tracker.
    ///
    /// Returns `false` if free runs and slots overlap or leave gaps, if two
    /// free runs are adjacent, if the size index disagrees with the free
    /// runs, or if the reserved total is off.
    #[must_use]
    pub fn validate(&self) -> bool {
        let mut ranges = self
            .free_slots()
            .map(|r| (r, true))
            .chain(self.reserved_slots().map(|r| (r, false)))
            .collect::<Vec<_>>();
        ranges.sort_by_key(|(r, _)| r.start);

        let mut cursor = 0;
        let mut prev_free = false;
        for (range, is_free) in ranges {
            if range.start != cursor || range.is_empty() || (is_free && prev_free) {
                return false;
            }
            cursor = range.end;
            prev_free = is_free;
        }

        cursor == self.capacity
            && self.free_by_size.len() == self.free_runs.len()
            && self
                .free_runs
                .iter()
                .all(|(&offset, &len)| self.free_by_size.contains(&(len, offset)))
            && self.reserved.values().sum::<usize>() == self.reserved_size
    }

    fn find_fit(&self, size: usize, alignment: usize) -> Option<(usize, usize, usize)> {
        self.free_by_size
            .range((size, 0)..)
            .find_map(|&(run_len, run_offset)| {
                let offset = run_offset.checked_next_multiple_of(alignment)?;
                let needed = (offset - run_offset).checked_add(size)?;
                (needed <= run_len).then_some((run_offset, run_len, offset))
            })
    }

    fn insert_free(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.free_runs.insert(offset, len);
        self.free_by_size.insert((len, offset));
    }

    fn remove_free(&mut self, offset: usize, len: usize) {
        self.free_runs.remove(&offset);
        self.free_by_size.remove(&(len, offset));
    }

    fn check_consistency(&self, action: &str) {
        if self.tracking.contains(MemoryTracking::CHECK_ACTIONS) && !self.validate() {
            error!(
                "slot tracker inconsistent after {action}: capacity = {}, reserved = {}, free runs = {:?}",
                self.capacity, self.reserved_size, self.free_runs
            );
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tracker(capacity: usize) -> SlotTracker {
        SlotTracker::new(capacity, MemoryTracking::CHECK_ACTIONS)
    }

    #[test]
    fn test_new_tracker_is_one_free_run() {
        let tracker = tracker(1024);
        assert!(tracker.is_empty());
        assert_eq!(tracker.capacity(), 1024);
        assert_eq!(tracker.total_available(), 1024);
        assert_eq!(tracker.maximum_available(), 1024);
        assert_eq!(tracker.free_slots().collect::<Vec<_>>(), vec![0..1024]);
        assert!(tracker.validate());
    }

    #[test]
    fn test_zero_capacity() {
        let mut tracker = tracker(0);
        assert_eq!(tracker.reserve(1, 1), None);
        assert_eq!(tracker.maximum_available(), 0);
        assert!(tracker.validate());
    }

    #[test]
    fn test_reserve_sequential() {
        let mut tracker = tracker(1024);
        assert_eq!(tracker.reserve(100, 1), Some(0));
        assert_eq!(tracker.reserve(200, 1), Some(100));
        assert_eq!(tracker.total_reserved(), 300);
        assert_eq!(tracker.total_available(), 724);
        assert_eq!(tracker.slot_count(), 2);
    }

    #[test]
    fn test_reserve_zero_size_takes_one_byte() {
        let mut tracker = tracker(16);
        let a = tracker.reserve(0, 1).unwrap();
        let b = tracker.reserve(0, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(tracker.total_reserved(), 2);
        assert!(tracker.release(a, 0));
        assert!(tracker.release(b, 0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reserve_alignment_keeps_padding_free() {
        let mut tracker = tracker(1024);
        assert_eq!(tracker.reserve(10, 1), Some(0));
        assert_eq!(tracker.reserve(10, 64), Some(64));
        assert_eq!(
            tracker.free_slots().collect::<Vec<_>>(),
            vec![10..64, 74..1024]
        );
        // The padding is still usable by small requests.
        assert_eq!(tracker.reserve(54, 1), Some(10));
    }

    #[test]
    fn test_reserve_rejects_non_power_of_two_alignment() {
        let mut tracker = tracker(1024);
        assert_eq!(tracker.reserve(8, 3), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reserve_zero_alignment_is_byte_aligned() {
        let mut tracker = tracker(64);
        assert_eq!(tracker.reserve(3, 0), Some(0));
        assert_eq!(tracker.reserve(3, 0), Some(3));
    }

    #[test]
    fn test_reserve_best_fit() {
        let mut tracker = tracker(1024);
        let a = tracker.reserve(300, 1).unwrap();
        let _b = tracker.reserve(8, 1).unwrap();
        let c = tracker.reserve(50, 1).unwrap();
        let _d = tracker.reserve(8, 1).unwrap();
        assert!(tracker.release(a, 300));
        assert!(tracker.release(c, 50));

        // The 50 byte hole is the tightest fit, even though the 300 byte hole
        // comes first.
        assert_eq!(tracker.reserve(40, 1), Some(c));
    }

    #[test]
    fn test_reserve_exhausted() {
        let mut tracker = tracker(128);
        assert_eq!(tracker.reserve(128, 1), Some(0));
        assert_eq!(tracker.reserve(1, 1), None);
        assert_eq!(tracker.total_available(), 0);
    }

    #[test]
    fn test_reserve_fragmented_failure() {
        let mut tracker = tracker(256);
        let slots = (0..4)
            .map(|_| tracker.reserve(64, 1).unwrap())
            .collect::<Vec<_>>();
        assert!(tracker.release(slots[1], 64));
        assert!(tracker.release(slots[3], 64));

        assert_eq!(tracker.total_available(), 128);
        assert_eq!(tracker.maximum_available(), 64);
        assert_eq!(tracker.reserve(128, 1), None);
    }

    #[test]
    fn test_release_merges_with_previous_and_next() {
        let mut tracker = tracker(300);
        let a = tracker.reserve(100, 1).unwrap();
        let b = tracker.reserve(100, 1).unwrap();
        let c = tracker.reserve(100, 1).unwrap();

        assert!(tracker.release(a, 100));
        assert!(tracker.release(c, 100));
        assert_eq!(
            tracker.free_slots().collect::<Vec<_>>(),
            vec![0..100, 200..300]
        );

        assert!(tracker.release(b, 100));
        assert_eq!(tracker.free_slots().collect::<Vec<_>>(), vec![0..300]);
        assert_eq!(tracker.reserve(300, 1), Some(0));
    }

    #[test]
    fn test_release_adjacent_split_ranges_restores_union() {
        let mut tracker = tracker(1024);
        let a = tracker.reserve(100, 1).unwrap();
        let b = tracker.reserve(100, 1).unwrap();
        let _guard = tracker.reserve(824, 1).unwrap();

        assert!(tracker.release(a, 100));
        assert!(tracker.release(b, 100));
        assert_eq!(tracker.reserve(200, 1), Some(0));
    }

    #[test]
    fn test_release_double_free_is_rejected() {
        let mut tracker = tracker(256);
        let a = tracker.reserve(32, 1).unwrap();
        assert!(tracker.release(a, 32));
        let before = tracker.clone();
        assert!(!tracker.release(a, 32));
        assert_eq!(tracker, before);
    }

    #[test]
    fn test_release_wrong_size_is_rejected() {
        let mut tracker = tracker(256);
        let a = tracker.reserve(32, 1).unwrap();
        assert!(!tracker.release(a, 16));
        assert!(!tracker.release(a + 1, 31));
        assert_eq!(tracker.total_reserved(), 32);
        assert!(tracker.release(a, 32));
    }

    #[test]
    fn test_release_never_reserved() {
        let mut tracker = tracker(256);
        assert!(!tracker.release(0, 10));
        assert!(tracker.validate());
    }

    #[test]
    fn test_reserved_slots() {
        let mut tracker = tracker(256);
        tracker.reserve(10, 1).unwrap();
        tracker.reserve(20, 16).unwrap();
        assert_eq!(
            tracker.reserved_slots().collect::<Vec<_>>(),
            vec![0..10, 16..36]
        );
    }

    #[test]
    fn test_memory_tracking_does_not_change_outcome() {
        let mut quiet = SlotTracker::new(512, MemoryTracking::empty());
        let mut loud = SlotTracker::new(512, MemoryTracking::all());
        for size in [10, 20, 30, 400, 100] {
            assert_eq!(quiet.reserve(size, 8), loud.reserve(size, 8));
        }
        loud.set_memory_tracking(MemoryTracking::empty());
        assert_eq!(loud.memory_tracking(), MemoryTracking::empty());
        assert_eq!(quiet.free_slots().collect::<Vec<_>>(), loud.free_slots().collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn test_random_reserve_release_keeps_invariants(
            ops in prop::collection::vec(
                (1_usize..512, 0_u32..6, any::<bool>(), any::<prop::sample::Index>()),
                1..200,
            )
        ) {
            let mut tracker = SlotTracker::new(8192, MemoryTracking::empty());
            let mut live: Vec<(usize, usize)> = Vec::new();

            for (size, align_shift, release, index) in ops {
                if release && !live.is_empty() {
                    let (offset, size) = live.swap_remove(index.index(live.len()));
                    prop_assert!(tracker.release(offset, size));
                } else if let Some(offset) = tracker.reserve(size, 1 << align_shift) {
                    prop_assert_eq!(offset % (1 << align_shift), 0);
                    prop_assert!(offset + size <= tracker.capacity());
                    for &(o, s) in &live {
                        prop_assert!(offset + size <= o || o + s <= offset);
                    }
                    live.push((offset, size));
                }

                prop_assert_eq!(
                    tracker.total_reserved() + tracker.total_available(),
                    tracker.capacity()
                );
                prop_assert_eq!(
                    tracker.total_reserved(),
                    live.iter().map(|&(_, s)| s).sum::<usize>()
                );
                prop_assert!(tracker.validate());
            }

            for (offset, size) in live {
                prop_assert!(tracker.release(offset, size));
            }
            prop_assert!(tracker.is_empty());
            prop_assert_eq!(tracker.maximum_available(), tracker.capacity());
        }
    }
}
