//! Memory blocks.
//!
//! A [`MemoryBlock`] owns one raw, aligned buffer obtained from the system
//! allocator and sub-allocates it through a [`SlotTracker`]. The tracker only
//! deals in byte offsets; the block is the only place where offsets are
//! turned into pointers and back.
//!
//! # Memory Layout
//!
//! ```text
//! base (aligned to block_alignment)                       base + capacity
//! ┌──────────┬─────────┬──────────────┬──────────┬───────────────────────┐
//! │ slot     │ padding │ slot         │ free     │ free                  │
//! │ (offset) │ (free)  │ (aligned)    │ run      │ run                   │
//! └──────────┴─────────┴──────────────┴──────────┴───────────────────────┘
//! ```
//!
//! The buffer is released with exactly the layout it was allocated with.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use log::{info, warn};
use slot_tracker::{MemoryTracking, SlotTracker};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    error::{AllocError, BlockAllocationSnafu, InvalidAlignmentSnafu, InvalidLayoutSnafu},
    stats::BlockStats,
};

/// Lower bound of the alignment of every block buffer.
pub const MIN_BLOCK_ALIGNMENT: usize = 16;

/// Natural alignment of the largest primitive type.
const NATURAL_ALIGNMENT: usize = align_of::<u128>();

/// One raw memory region sub-allocated into slots.
///
/// Every pointer handed out by [`allocate`](Self::allocate) lies within
/// `base..base + capacity`, is aligned to [`alignment`](Self::alignment) and
/// corresponds to exactly one reserved slot.
#[derive(Debug)]
pub struct MemoryBlock {
    memory: NonNull<u8>,
    layout: Layout,
    alignment: usize,
    slots: SlotTracker,
}

// The block exclusively owns its buffer.
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    /// Allocates a new block of `capacity` bytes whose slots are aligned to
    /// `alignment`.
    ///
    /// The buffer itself is aligned to the largest of `alignment`, the
    /// natural machine alignment and 16 bytes. A zero `capacity` is rounded
    /// up to one byte and a zero `alignment` to one.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidAlignment`] if `alignment` is not a power of two
    /// - [`AllocError::InvalidLayout`] if the buffer size overflows
    /// - [`AllocError::BlockAllocation`] if the system allocator fails
    pub fn new(
        capacity: usize,
        alignment: usize,
        tracking: MemoryTracking,
    ) -> Result<Self, AllocError> {
        let alignment = alignment.max(1);
        ensure!(
            alignment.is_power_of_two(),
            InvalidAlignmentSnafu { align: alignment }
        );

        let block_alignment = alignment.max(NATURAL_ALIGNMENT).max(MIN_BLOCK_ALIGNMENT);
        let capacity = capacity.max(1);
        let layout =
            Layout::from_size_align(capacity, block_alignment).context(InvalidLayoutSnafu)?;

        let memory = NonNull::new(unsafe { alloc::alloc(layout) }).context(BlockAllocationSnafu {
            size: capacity,
            align: block_alignment,
        })?;

        if tracking.contains(MemoryTracking::REPORT_ACTIONS) {
            info!("memory block {memory:p}: allocated {capacity} bytes aligned to {block_alignment}");
        }

        Ok(Self {
            memory,
            layout,
            alignment,
            slots: SlotTracker::new(capacity, tracking),
        })
    }

    /// Returns the start of the buffer.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.memory
    }

    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.memory.as_ptr().addr()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the alignment of every slot.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Returns the alignment the buffer was allocated with.
    #[must_use]
    pub fn block_alignment(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub fn slots(&self) -> &SlotTracker {
        &self.slots
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_memory_tracking(&mut self, tracking: MemoryTracking) {
        self.slots.set_memory_tracking(tracking);
    }

    /// Returns `true` if `ptr` lies inside the buffer.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.base_addr();
        (base..base + self.capacity()).contains(&ptr.as_ptr().addr())
    }

    /// Reserves a slot of `size` bytes.
    ///
    /// Returns `None` if no free run of the block can hold the request. This
    /// is the normal signal for the caller to try another block.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let offset = self.slots.reserve(size, self.alignment)?;
        // `offset` lies inside the buffer.
        Some(unsafe { self.memory.add(offset) })
    }

    /// Releases the slot starting at `ptr`.
    ///
    /// # Returns
    ///
    /// `false` if `ptr` lies outside the block, or if no slot of `size`
    /// bytes starts at `ptr` (logged as a warning; the block is unchanged).
    ///
    /// # Safety
    ///
    /// If the slot is released, the memory behind `ptr` must no longer be
    /// used, since it may be handed out again.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
        if !self.contains(ptr) {
            return false;
        }

        let offset = ptr.as_ptr().addr() - self.base_addr();
        if !self.slots.release(offset, size) {
            warn!(
                "memory block {:p}: could not release {ptr:p} ({size} bytes)",
                self.memory
            );
            return false;
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> BlockStats {
        BlockStats {
            base: self.base_addr(),
            capacity: self.capacity(),
            reserved: self.slots.total_reserved(),
            available: self.slots.total_available(),
            maximum_available: self.slots.maximum_available(),
            slot_count: self.slots.slot_count(),
        }
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if self
            .slots
            .memory_tracking()
            .contains(MemoryTracking::REPORT_ACTIONS)
        {
            info!(
                "memory block {:p}: freed {} bytes",
                self.memory,
                self.capacity()
            );
        }
        unsafe { alloc::dealloc(self.memory.as_ptr(), self.layout) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn new_block(capacity: usize, alignment: usize) -> MemoryBlock {
        MemoryBlock::new(capacity, alignment, MemoryTracking::CHECK_ACTIONS).unwrap()
    }

    #[test]
    fn test_block_alignment_floor() {
        let block = new_block(1024, 1);
        assert_eq!(block.alignment(), 1);
        assert_eq!(block.block_alignment(), MIN_BLOCK_ALIGNMENT.max(NATURAL_ALIGNMENT));
        assert!(block.base_addr().is_multiple_of(MIN_BLOCK_ALIGNMENT));

        let block = new_block(1024, 256);
        assert_eq!(block.block_alignment(), 256);
        assert!(block.base_addr().is_multiple_of(256));
    }

    #[test]
    fn test_zero_capacity_is_rounded_up() {
        let mut block = new_block(0, 8);
        assert_eq!(block.capacity(), 1);
        assert!(block.allocate(1).is_some());
        assert!(block.allocate(1).is_none());
    }

    #[test]
    fn test_invalid_alignment() {
        let err = MemoryBlock::new(1024, 24, MemoryTracking::empty()).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAlignment { align: 24, .. }));
    }

    #[test]
    fn test_invalid_layout() {
        let err = MemoryBlock::new(usize::MAX, 16, MemoryTracking::empty()).unwrap_err();
        assert!(matches!(err, AllocError::InvalidLayout { .. }));
    }

    #[test]
    fn test_allocate_within_bounds_and_aligned() {
        let mut block = new_block(4096, 32);
        let mut ptrs = Vec::new();
        for size in [1, 7, 64, 100, 333] {
            let ptr = block.allocate(size).unwrap();
            assert!(block.contains(ptr));
            assert!(ptr.as_ptr().addr().is_multiple_of(32));
            assert!(ptr.as_ptr().addr() + size <= block.base_addr() + block.capacity());
            unsafe { ptr.as_ptr().write_bytes(0x33, size) };
            ptrs.push((ptr, size));
        }
        for (ptr, size) in ptrs {
            assert!(unsafe { block.deallocate(ptr, size) });
        }
        assert!(block.is_empty());
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut block = new_block(256, 1);
        assert!(block.allocate(256).is_some());
        assert!(block.allocate(1).is_none());
    }

    #[test]
    fn test_deallocate_foreign_pointer() {
        let mut block = new_block(256, 8);
        let mut other = new_block(256, 8);
        let ptr = other.allocate(16).unwrap();
        assert!(!block.contains(ptr));
        assert!(!unsafe { block.deallocate(ptr, 16) });
        assert!(unsafe { other.deallocate(ptr, 16) });
    }

    #[test]
    fn test_deallocate_one_past_the_end() {
        let mut block = new_block(256, 8);
        let end = unsafe { block.base().add(block.capacity()) };
        assert!(!block.contains(end));
        assert!(!unsafe { block.deallocate(end, 1) });

        let last = unsafe { block.base().add(block.capacity() - 1) };
        assert!(block.contains(last));
    }

    #[test]
    fn test_double_free_is_reported() {
        let mut block = new_block(256, 8);
        let ptr = block.allocate(32).unwrap();
        assert!(unsafe { block.deallocate(ptr, 32) });
        assert!(!unsafe { block.deallocate(ptr, 32) });
        assert!(block.slots().validate());
    }

    #[test]
    fn test_stats() {
        let mut block = new_block(1024, 8);
        block.allocate(100).unwrap();
        let stats = block.stats();
        assert_eq!(stats.base, block.base_addr());
        assert_eq!(stats.capacity, 1024);
        assert_eq!(stats.reserved, 100);
        assert_eq!(stats.available, 924);
        assert_eq!(stats.maximum_available, 924);
        assert_eq!(stats.slot_count, 1);
    }
}
