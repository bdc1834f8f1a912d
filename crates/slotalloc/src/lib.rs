//! Pooled block sub-allocator with per-affinity memory groups.
//!
//! Memory is obtained from the system in large blocks and carved into slots.
//! Requests name an [`Affinity`], a small integer that routes them to a
//! dedicated [`MemoryBlockGroup`](block_group::MemoryBlockGroup), so that
//! objects of one kind end up next to each other and a subsystem's memory can
//! be accounted for and compacted on its own.
//!
//! # Layers
//!
//! ## [`SlotTracker`]
//!
//! Offset-only bookkeeping of free and reserved ranges inside one region.
//! Best-fit placement with alignment padding, merging of adjacent free runs
//! and rejection of mismatched releases.
//!
//! ## [`MemoryBlock`](memory_block::MemoryBlock)
//!
//! One aligned system buffer sub-allocated through a `SlotTracker`.
//!
//! ## [`MemoryBlockGroup`](block_group::MemoryBlockGroup)
//!
//! A growable set of blocks sharing a name, a minimum block size and a slot
//! alignment. The most recently successful block is tried first, and a new
//! block is created only when no existing one can hold the request.
//!
//! ## [`Allocator`]
//!
//! Maps affinities to groups behind one lock, falls back on a chain of
//! [`AllocationStrategy`] implementations when a group cannot grow, and
//! reports accounting for every group and block.
//!
//! # Usage Examples
//!
//! ```rust
//! use slotalloc::{Affinity, Allocator, AllocatorConfig, GroupConfig, MemoryTracking};
//!
//! let config = AllocatorConfig::default()
//!     .with_memory_tracking(MemoryTracking::CHECK_ACTIONS)
//!     .with_group(GroupConfig::new(Affinity::new(8), 64 * 1024).with_name("audio"));
//! let allocator = Allocator::new(config);
//!
//! let a = allocator.allocate(100, Affinity::new(8)).unwrap();
//! let b = allocator.allocate(200, Affinity::OBJECTS).unwrap();
//! assert_eq!(allocator.total_reserved_size(), 300);
//!
//! unsafe {
//!     assert!(allocator.deallocate(a, 100));
//!     assert!(allocator.deallocate(b, 200));
//! }
//! assert_eq!(allocator.total_reserved_size(), 0);
//!
//! let mut report = Vec::new();
//! allocator.report(&mut report).unwrap();
//! ```
//!
//! Typed values can be placed in a group with [`PoolBox`]. A process-wide
//! instance is available through [`instance`], [`allocate`] and
//! [`deallocate`].
//!
//! # Thread Safety
//!
//! [`Allocator`] is `Send + Sync`. Every operation takes a single
//! `spin::Mutex`, so the allocator suits workloads where allocation is rare
//! compared to work on the allocated objects.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use slot_tracker::{MemoryTracking, SlotTracker};

pub use self::{
    affinity::Affinity,
    allocator::Allocator,
    config::{AllocatorConfig, GroupConfig},
    error::AllocError,
    fallback::{AllocationStrategy, FallbackMode},
    global::{allocate, deallocate, init, instance},
    pooled::PoolBox,
    stats::{AllocatorStats, BlockStats, GroupStats},
};

pub mod affinity;
pub mod allocator;
pub mod block_group;
pub mod config;
pub mod error;
pub mod fallback;
pub mod global;
pub mod memory_block;
pub mod pooled;
pub mod stats;
