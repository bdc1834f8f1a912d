//! Allocator configuration.
//!
//! Configuration is a plain value handed to [`Allocator::new`]; nothing is
//! read from the environment. The defaults reproduce the usual setup of four
//! predefined groups:
//!
//! | Affinity  | Block size | Alignment |
//! |-----------|------------|-----------|
//! | `OBJECTS` | 1 MiB      | default   |
//! | `DATA`    | 16 MiB     | default   |
//! | `NODES`   | 1 MiB      | default   |
//! | `PHYSICS` | 1 MiB      | 16        |
//!
//! [`Allocator::new`]: crate::Allocator::new

use slot_tracker::MemoryTracking;

use crate::{affinity::Affinity, fallback::FallbackMode};

pub const MEGABYTE: usize = 1024 * 1024;

/// Alignment used for groups that do not configure their own.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Block size used for groups created lazily on first use.
pub const DEFAULT_BLOCK_SIZE: usize = MEGABYTE;

/// Settings of one memory block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub affinity: Affinity,
    /// Name shown in logs and reports.
    pub name: String,
    /// Minimum capacity of each new block.
    pub block_size: usize,
    /// Slot alignment; `None` uses the allocator default.
    pub alignment: Option<usize>,
}

impl GroupConfig {
    #[must_use]
    pub fn new(affinity: Affinity, block_size: usize) -> Self {
        Self {
            affinity,
            name: affinity.default_name().into_owned(),
            block_size,
            alignment: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

/// Settings of an [`Allocator`](crate::Allocator).
///
/// # Examples
///
/// ```
/// use slotalloc::{Affinity, AllocatorConfig, FallbackMode, GroupConfig, MemoryTracking};
///
/// let config = AllocatorConfig::default()
///     .with_memory_tracking(MemoryTracking::REPORT_ACTIONS)
///     .with_fallback(FallbackMode::MallocFree)
///     .with_group(GroupConfig::new(Affinity::new(8), 64 * 1024).with_name("particles"));
/// assert_eq!(config.groups.len(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub default_alignment: usize,
    pub memory_tracking: MemoryTracking,
    pub fallback: FallbackMode,
    /// Block size of groups without an entry in `groups`.
    pub default_block_size: usize,
    /// Groups created up front.
    pub groups: Vec<GroupConfig>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::empty()
            .with_group(GroupConfig::new(Affinity::OBJECTS, MEGABYTE))
            .with_group(GroupConfig::new(Affinity::DATA, 16 * MEGABYTE))
            .with_group(GroupConfig::new(Affinity::NODES, MEGABYTE))
            .with_group(GroupConfig::new(Affinity::PHYSICS, MEGABYTE).with_alignment(16))
    }
}

impl AllocatorConfig {
    /// Returns a configuration without predefined groups.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            default_alignment: DEFAULT_ALIGNMENT,
            memory_tracking: MemoryTracking::empty(),
            fallback: FallbackMode::default(),
            default_block_size: DEFAULT_BLOCK_SIZE,
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_default_alignment(mut self, alignment: usize) -> Self {
        self.default_alignment = alignment;
        self
    }

    #[must_use]
    pub fn with_memory_tracking(mut self, tracking: MemoryTracking) -> Self {
        self.memory_tracking = tracking;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_default_block_size(mut self, block_size: usize) -> Self {
        self.default_block_size = block_size;
        self
    }

    /// Adds a predefined group, replacing any entry for the same affinity.
    #[must_use]
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.retain(|g| g.affinity != group.affinity);
        self.groups.push(group);
        self
    }

    #[must_use]
    pub fn group(&self, affinity: Affinity) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.affinity == affinity)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_groups() {
        let config = AllocatorConfig::default();
        assert_eq!(config.default_alignment, DEFAULT_ALIGNMENT);
        assert!(config.fallback.is_system_new_delete());
        assert_eq!(config.group(Affinity::DATA).unwrap().block_size, 16 * MEGABYTE);
        assert_eq!(config.group(Affinity::PHYSICS).unwrap().alignment, Some(16));
        assert_eq!(config.group(Affinity::OBJECTS).unwrap().name, "objects");
        assert!(config.group(Affinity::new(4)).is_none());
    }

    #[test]
    fn test_with_group_replaces_existing_entry() {
        let config =
            AllocatorConfig::default().with_group(GroupConfig::new(Affinity::DATA, 4096));
        assert_eq!(config.groups.len(), 4);
        assert_eq!(config.group(Affinity::DATA).unwrap().block_size, 4096);
    }

    #[test]
    fn test_empty_config() {
        let config = AllocatorConfig::empty().with_default_block_size(512);
        assert!(config.groups.is_empty());
        assert_eq!(config.default_block_size, 512);
    }
}
