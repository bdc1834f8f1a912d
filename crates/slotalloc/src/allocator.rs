//! The affinity router.
//!
//! [`Allocator`] maps each [`Affinity`] to a [`MemoryBlockGroup`], creating
//! groups lazily, and owns the fallback chain consulted when a group cannot
//! grow. All state sits behind a single lock: allocation is assumed to be far
//! rarer than work on the allocated objects, so one coarse lock is preferred
//! over finer-grained schemes.
//!
//! # Usage Example
//!
//! ```rust
//! use slotalloc::{Affinity, Allocator, AllocatorConfig};
//!
//! let allocator = Allocator::new(AllocatorConfig::default());
//!
//! let ptr = allocator.allocate(100, Affinity::NODES).unwrap();
//! assert_eq!(allocator.total_reserved_size(), 100);
//!
//! unsafe {
//!     assert!(allocator.deallocate(ptr, 100));
//! }
//! assert_eq!(allocator.total_reserved_size(), 0);
//! assert_eq!(allocator.delete_empty_memory_blocks(), 1024 * 1024);
//! ```

use std::{collections::BTreeMap, io, ptr::NonNull};

use log::{error, info, warn};
use slot_tracker::MemoryTracking;
use spin::Mutex;

use crate::{
    affinity::Affinity,
    block_group::MemoryBlockGroup,
    config::{AllocatorConfig, GroupConfig},
    error::AllocError,
    fallback::{AllocationStrategy, FallbackMode},
    stats::{AllocatorStats, GroupStats},
};

/// Pooled allocator routing requests by affinity.
///
/// The allocator is `Sync`; every operation takes the internal lock for its
/// whole duration.
pub struct Allocator {
    state: Mutex<AllocatorState>,
}

/// Links of the fallback chain an operation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    /// Groups, nested strategies and the terminal system strategy.
    Full,
    /// Groups and nested strategies only. An allocator nested inside another
    /// one leaves system memory to the outer allocator's terminal strategy,
    /// since a terminal strategy claims every pointer it is offered.
    Owned,
}

struct AllocatorState {
    groups: BTreeMap<Affinity, MemoryBlockGroup>,
    default_alignment: usize,
    default_block_size: usize,
    memory_tracking: MemoryTracking,
    fallback_mode: FallbackMode,
    nested: Vec<Box<dyn AllocationStrategy>>,
    terminal: Option<Box<dyn AllocationStrategy>>,
}

impl AllocatorState {
    fn new(config: AllocatorConfig, nested: Vec<Box<dyn AllocationStrategy>>) -> Self {
        let AllocatorConfig {
            default_alignment,
            memory_tracking,
            fallback,
            default_block_size,
            groups,
        } = config;

        let groups = groups
            .into_iter()
            .map(|g| {
                let alignment = g.alignment.unwrap_or(default_alignment);
                (
                    g.affinity,
                    MemoryBlockGroup::new(g.name, g.block_size, alignment),
                )
            })
            .collect::<BTreeMap<_, _>>();

        // System memory must satisfy the strictest configured group.
        let terminal_alignment = groups
            .values()
            .map(MemoryBlockGroup::alignment)
            .filter(|align| align.is_power_of_two())
            .fold(default_alignment, usize::max);

        Self {
            groups,
            default_alignment,
            default_block_size,
            memory_tracking,
            fallback_mode: fallback,
            nested,
            terminal: fallback.strategy(terminal_alignment),
        }
    }

    fn reports(&self) -> bool {
        self.memory_tracking
            .contains(MemoryTracking::REPORT_ACTIONS)
    }

    fn strategies(&self, chain: Chain) -> impl Iterator<Item = &dyn AllocationStrategy> {
        let terminal = match chain {
            Chain::Full => self.terminal.as_deref(),
            Chain::Owned => None,
        };
        self.nested
            .iter()
            .map(|strategy| &**strategy)
            .chain(terminal)
    }

    fn group_or_create(&mut self, affinity: Affinity) -> &mut MemoryBlockGroup {
        let block_size = self.default_block_size;
        let alignment = self.default_alignment;
        let reports = self.reports();
        self.groups.entry(affinity).or_insert_with(|| {
            if reports {
                info!("creating memory block group for {affinity} ({block_size} byte blocks)");
            }
            MemoryBlockGroup::new(affinity.default_name(), block_size, alignment)
        })
    }

    fn allocate(
        &mut self,
        size: usize,
        affinity: Affinity,
        chain: Chain,
    ) -> Result<NonNull<u8>, AllocError> {
        let tracking = self.memory_tracking;
        let group = self.group_or_create(affinity);
        let alignment = group.alignment();
        let err = match group.allocate(size, tracking) {
            Ok(ptr) => {
                if tracking.contains(MemoryTracking::REPORT_ACTIONS) {
                    info!(
                        "allocated {ptr:p} ({size} bytes, {affinity}) from {}",
                        group.name()
                    );
                }
                return Ok(ptr);
            }
            Err(err) => err,
        };

        warn!("allocate({size}, {affinity}) could not use its memory block group: {err}");
        for strategy in self.strategies(chain) {
            let Some(ptr) = strategy.allocate(size, affinity) else {
                continue;
            };
            if alignment.is_power_of_two() && !ptr.as_ptr().addr().is_multiple_of(alignment) {
                warn!(
                    "fallback {} returned {ptr:p}, which is not aligned to {alignment}",
                    strategy.name()
                );
                unsafe { strategy.deallocate(ptr, size) };
                continue;
            }
            warn!(
                "allocated {ptr:p} ({size} bytes, {affinity}) from fallback {}",
                strategy.name()
            );
            return Ok(ptr);
        }

        error!("allocate({size}, {affinity}) failed: every fallback is exhausted");
        Err(err)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, chain: Chain) -> bool {
        for group in self.groups.values_mut() {
            if unsafe { group.deallocate(ptr, size) } {
                if self
                    .memory_tracking
                    .contains(MemoryTracking::REPORT_ACTIONS)
                {
                    info!("deallocated {ptr:p} ({size} bytes) from {}", group.name());
                }
                return true;
            }
        }

        for strategy in self.strategies(chain) {
            if unsafe { strategy.deallocate(ptr, size) } {
                if self.reports() {
                    info!(
                        "deallocated {ptr:p} ({size} bytes) through fallback {}",
                        strategy.name()
                    );
                }
                return true;
            }
        }

        if chain == Chain::Full {
            error!("deallocate({ptr:p}, {size}): pointer is not owned by this allocator");
        }
        false
    }
}

impl Allocator {
    /// Creates an allocator. Groups listed in `config` are registered
    /// immediately but allocate no memory until first used.
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            state: Mutex::new(AllocatorState::new(config, Vec::new())),
        }
    }

    /// Creates an allocator that falls back on `nested` before using its
    /// terminal system strategy.
    ///
    /// `nested` serves and claims memory from its own groups and nested
    /// strategies only; its terminal strategy is never used.
    #[must_use]
    pub fn with_nested(config: AllocatorConfig, nested: Self) -> Self {
        Self {
            state: Mutex::new(AllocatorState::new(config, vec![Box::new(nested)])),
        }
    }

    /// Appends `strategy` to the nested fallbacks, behind any already
    /// present and in front of the terminal system strategy.
    pub fn push_fallback(&self, strategy: Box<dyn AllocationStrategy>) {
        self.state.lock().nested.push(strategy);
    }

    /// Allocates `size` bytes from the group of `affinity`.
    ///
    /// The group is created on first use. If the group cannot grow, the
    /// fallback chain is tried in order.
    ///
    /// # Errors
    ///
    /// Returns the group's error if it cannot grow and no fallback can serve
    /// the request either. This is the out-of-memory condition.
    pub fn allocate(&self, size: usize, affinity: Affinity) -> Result<NonNull<u8>, AllocError> {
        self.state.lock().allocate(size, affinity, Chain::Full)
    }

    /// Returns `size` bytes at `ptr` to whichever group or fallback owns
    /// them.
    ///
    /// Every group is asked first, then the nested fallbacks, then the
    /// terminal system strategy, which claims any pointer nobody else did.
    ///
    /// # Returns
    ///
    /// `false` (with an error logged) only if nothing claimed the pointer,
    /// which requires [`FallbackMode::Disabled`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) of this
    /// allocator with the same `size`, and must not be used afterwards. With
    /// a system fallback configured, a foreign pointer is handed to the
    /// system allocator.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> bool {
        unsafe { self.state.lock().deallocate(ptr, size, Chain::Full) }
    }

    /// Releases every block without live slots in every group.
    ///
    /// Returns the number of bytes given back to the system.
    pub fn delete_empty_memory_blocks(&self) -> usize {
        let mut state = self.state.lock();
        let tracking = state.memory_tracking;
        let freed = state
            .groups
            .values_mut()
            .map(|group| group.delete_empty_memory_blocks(tracking))
            .sum();
        if tracking.contains(MemoryTracking::REPORT_ACTIONS) {
            info!("delete_empty_memory_blocks() freed {freed} bytes");
        }
        freed
    }

    #[must_use]
    pub fn total_available_size(&self) -> usize {
        let state = self.state.lock();
        state
            .groups
            .values()
            .map(MemoryBlockGroup::total_available_size)
            .sum()
    }

    #[must_use]
    pub fn total_reserved_size(&self) -> usize {
        let state = self.state.lock();
        state
            .groups
            .values()
            .map(MemoryBlockGroup::total_reserved_size)
            .sum()
    }

    #[must_use]
    pub fn total_memory_size(&self) -> usize {
        let state = self.state.lock();
        state
            .groups
            .values()
            .map(MemoryBlockGroup::total_memory_size)
            .sum()
    }

    /// Sets the minimum capacity of new blocks for `affinity`, creating its
    /// group if needed.
    pub fn set_block_size(&self, affinity: Affinity, block_size: usize) {
        self.state
            .lock()
            .group_or_create(affinity)
            .set_block_size(block_size);
    }

    /// Creates the group described by `config`, or updates the name, block
    /// size and alignment of an existing one.
    pub fn configure_group(&self, config: GroupConfig) {
        let mut state = self.state.lock();
        let alignment = config.alignment.unwrap_or(state.default_alignment);
        state
            .group_or_create(config.affinity)
            .configure(config.name, config.block_size, alignment);
    }

    /// Changes the diagnostic flags of the allocator and of every existing
    /// group and block.
    pub fn set_memory_tracking(&self, tracking: MemoryTracking) {
        let mut state = self.state.lock();
        state.memory_tracking = tracking;
        for group in state.groups.values_mut() {
            group.set_memory_tracking(tracking);
        }
    }

    #[must_use]
    pub fn memory_tracking(&self) -> MemoryTracking {
        self.state.lock().memory_tracking
    }

    #[must_use]
    pub fn default_alignment(&self) -> usize {
        self.state.lock().default_alignment
    }

    #[must_use]
    pub fn fallback_mode(&self) -> FallbackMode {
        self.state.lock().fallback_mode
    }

    /// Returns the slot alignment used for `affinity`.
    #[must_use]
    pub fn alignment_for(&self, affinity: Affinity) -> usize {
        let state = self.state.lock();
        state
            .groups
            .get(&affinity)
            .map_or(state.default_alignment, MemoryBlockGroup::alignment)
    }

    #[must_use]
    pub fn group_stats(&self, affinity: Affinity) -> Option<GroupStats> {
        let state = self.state.lock();
        state
            .groups
            .get(&affinity)
            .map(|group| group.stats(affinity))
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            groups: state
                .groups
                .iter()
                .map(|(&affinity, group)| group.stats(affinity))
                .collect(),
        }
    }

    /// Writes a human-readable accounting of every group and block.
    ///
    /// The snapshot is taken under the lock; writing happens after it is
    /// released.
    ///
    /// # Errors
    ///
    /// Returns any error of `out`.
    pub fn report<W>(&self, out: &mut W) -> io::Result<()>
    where
        W: io::Write + ?Sized,
    {
        let stats = self.stats();
        write!(out, "{stats}")
    }

    /// Drops every group and block and installs `config`. Nested fallbacks
    /// are kept.
    ///
    /// # Safety
    ///
    /// No pointer handed out from a pooled group may be used or deallocated
    /// afterwards.
    pub unsafe fn reset(&self, config: AllocatorConfig) {
        let mut state = self.state.lock();
        let nested = std::mem::take(&mut state.nested);
        *state = AllocatorState::new(config, nested);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

/// As a fallback, an allocator serves requests from its own groups and nested
/// strategies only. Its terminal strategy is skipped in both directions, so
/// it only claims pointers it can prove it handed out.
impl AllocationStrategy for Allocator {
    fn name(&self) -> &str {
        "nested allocator"
    }

    fn allocate(&self, size: usize, affinity: Affinity) -> Option<NonNull<u8>> {
        self.state
            .lock()
            .allocate(size, affinity, Chain::Owned)
            .ok()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> bool {
        unsafe { self.state.lock().deallocate(ptr, size, Chain::Owned) }
    }
}
