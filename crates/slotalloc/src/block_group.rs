//! Memory block groups.
//!
//! A [`MemoryBlockGroup`] owns every [`MemoryBlock`] that serves one
//! affinity. It combines the blocks the same way a fixed-size block allocator
//! combines its per-size lists with a fallback: try the cheap candidate
//! first, then the others, and only then ask the system for more memory.
//!
//! # Algorithm
//!
//! - **Allocation**: the most recently used block is tried first, then the
//!   remaining blocks from newest to oldest. If none has room, a new block of
//!   `max(size, block_size)` bytes is allocated and becomes the most recently
//!   used one.
//! - **Deallocation**: blocks are keyed by base address, so the owner of a
//!   pointer is the block with the greatest base address not above it
//!   (provided the pointer is inside that block).
//! - **Compaction**: empty blocks are only released on an explicit
//!   [`delete_empty_memory_blocks`](MemoryBlockGroup::delete_empty_memory_blocks)
//!   call, never as a side effect of deallocation.

use std::{collections::BTreeMap, ptr::NonNull};

use log::info;
use slot_tracker::MemoryTracking;
use snafu::OptionExt as _;

use crate::{
    affinity::Affinity,
    error::{AllocError, BlockAllocationSnafu},
    memory_block::MemoryBlock,
    stats::GroupStats,
};

/// All memory blocks serving one affinity.
///
/// Blocks are disjoint memory regions keyed by their base address. The
/// cached most-recently-used entry is only a key into that map; it is
/// cleared whenever the block it names is removed.
#[derive(Debug)]
pub struct MemoryBlockGroup {
    name: String,
    block_size: usize,
    alignment: usize,
    blocks: BTreeMap<usize, MemoryBlock>,
    /// Base addresses in creation order.
    creation_order: Vec<usize>,
    latest: Option<usize>,
}

impl MemoryBlockGroup {
    /// Creates an empty group. No memory is allocated until the first
    /// [`allocate`](Self::allocate) call.
    #[must_use]
    pub fn new(name: impl Into<String>, block_size: usize, alignment: usize) -> Self {
        Self {
            name: name.into(),
            block_size,
            alignment,
            blocks: BTreeMap::new(),
            creation_order: Vec::new(),
            latest: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.values()
    }

    /// Sets the minimum capacity of blocks created from now on.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    /// Changes the settings applied to blocks created from now on.
    ///
    /// Existing blocks keep the alignment they were created with.
    pub fn configure(&mut self, name: impl Into<String>, block_size: usize, alignment: usize) {
        self.name = name.into();
        self.block_size = block_size;
        self.alignment = alignment;
    }

    pub fn set_memory_tracking(&mut self, tracking: MemoryTracking) {
        for block in self.blocks.values_mut() {
            block.set_memory_tracking(tracking);
        }
    }

    /// Allocates `size` bytes from the group, growing it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error only if a new block has to be created and that
    /// fails. A full group is not an error.
    pub fn allocate(
        &mut self,
        size: usize,
        tracking: MemoryTracking,
    ) -> Result<NonNull<u8>, AllocError> {
        if let Some(block) = self.latest.and_then(|base| self.blocks.get_mut(&base)) {
            if let Some(ptr) = block.allocate(size) {
                return Ok(ptr);
            }
        }

        for &base in self.creation_order.iter().rev() {
            if Some(base) == self.latest {
                continue;
            }
            let Some(block) = self.blocks.get_mut(&base) else {
                continue;
            };
            if let Some(ptr) = block.allocate(size) {
                self.latest = Some(base);
                return Ok(ptr);
            }
        }

        let capacity = size.max(self.block_size);
        let mut block = MemoryBlock::new(capacity, self.alignment, tracking)?;
        // A fresh block starts with one aligned free run of at least `size` bytes.
        let ptr = block.allocate(size).context(BlockAllocationSnafu {
            size: capacity,
            align: self.alignment,
        })?;

        let base = block.base_addr();
        if tracking.contains(MemoryTracking::REPORT_ACTIONS) {
            info!(
                "{}: allocate({size}) needed a new memory block of {} bytes at {base:#x}",
                self.name,
                block.capacity()
            );
        }
        self.blocks.insert(base, block);
        self.creation_order.push(base);
        self.latest = Some(base);
        Ok(ptr)
    }

    /// Releases `size` bytes at `ptr` if one of the group's blocks owns it.
    ///
    /// # Returns
    ///
    /// `true` if a block of this group contains `ptr`. A release the block
    /// rejects (double free, wrong size) is logged by the block but the
    /// pointer is still claimed, so callers never hand it to another
    /// allocator.
    ///
    /// # Safety
    ///
    /// If `ptr` belongs to this group it must have been returned by
    /// [`allocate`](Self::allocate) with the same `size`, and the memory must
    /// not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
        let addr = ptr.as_ptr().addr();
        let Some((_, block)) = self.blocks.range_mut(..=addr).next_back() else {
            return false;
        };
        if !block.contains(ptr) {
            return false;
        }
        unsafe { block.deallocate(ptr, size) };
        true
    }

    /// Releases every block without live slots.
    ///
    /// Returns the number of bytes given back to the system.
    pub fn delete_empty_memory_blocks(&mut self, tracking: MemoryTracking) -> usize {
        let mut freed = 0;
        let name = &self.name;
        self.blocks.retain(|&base, block| {
            if !block.is_empty() {
                return true;
            }
            if tracking.contains(MemoryTracking::REPORT_ACTIONS) {
                info!(
                    "{name}: removing empty memory block {base:#x} ({} bytes)",
                    block.capacity()
                );
            }
            freed += block.capacity();
            false
        });
        self.creation_order
            .retain(|base| self.blocks.contains_key(base));
        if self
            .latest
            .is_some_and(|base| !self.blocks.contains_key(&base))
        {
            self.latest = None;
        }
        freed
    }

    #[must_use]
    pub fn total_available_size(&self) -> usize {
        self.blocks
            .values()
            .map(|b| b.slots().total_available())
            .sum()
    }

    #[must_use]
    pub fn total_reserved_size(&self) -> usize {
        self.blocks
            .values()
            .map(|b| b.slots().total_reserved())
            .sum()
    }

    #[must_use]
    pub fn total_memory_size(&self) -> usize {
        self.blocks.values().map(MemoryBlock::capacity).sum()
    }

    #[must_use]
    pub fn stats(&self, affinity: Affinity) -> GroupStats {
        GroupStats {
            affinity,
            name: self.name.clone(),
            block_size: self.block_size,
            alignment: self.alignment,
            blocks: self.blocks.values().map(MemoryBlock::stats).collect(),
        }
    }
}
