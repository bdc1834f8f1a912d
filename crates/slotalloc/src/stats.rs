//! Snapshots of allocator accounting.
//!
//! Snapshots are taken under the allocator lock and formatted afterwards, so
//! writing a report never happens while the lock is held.

use std::fmt;

use crate::affinity::Affinity;

/// Accounting of one memory block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStats {
    /// Address of the first byte of the block.
    pub base: usize,
    pub capacity: usize,
    pub reserved: usize,
    pub available: usize,
    /// Largest contiguous free run.
    pub maximum_available: usize,
    pub slot_count: usize,
}

/// Accounting of one memory block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub affinity: Affinity,
    pub name: String,
    pub block_size: usize,
    pub alignment: usize,
    /// Blocks in address order.
    pub blocks: Vec<BlockStats>,
}

impl GroupStats {
    #[must_use]
    pub fn total_available_size(&self) -> usize {
        self.blocks.iter().map(|b| b.available).sum()
    }

    #[must_use]
    pub fn total_reserved_size(&self) -> usize {
        self.blocks.iter().map(|b| b.reserved).sum()
    }

    #[must_use]
    pub fn total_memory_size(&self) -> usize {
        self.blocks.iter().map(|b| b.capacity).sum()
    }
}

/// Accounting of a whole allocator, one entry per group in affinity order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    pub groups: Vec<GroupStats>,
}

impl AllocatorStats {
    #[must_use]
    pub fn total_available_size(&self) -> usize {
        self.groups.iter().map(GroupStats::total_available_size).sum()
    }

    #[must_use]
    pub fn total_reserved_size(&self) -> usize {
        self.groups.iter().map(GroupStats::total_reserved_size).sum()
    }

    #[must_use]
    pub fn total_memory_size(&self) -> usize {
        self.groups.iter().map(GroupStats::total_memory_size).sum()
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "allocator report: {} groups", self.groups.len())?;
        writeln!(
            f,
            "total available = {}, total reserved = {}, total memory = {}",
            self.total_available_size(),
            self.total_reserved_size(),
            self.total_memory_size()
        )?;

        let total_reserved = self.total_reserved_size();
        for group in &self.groups {
            let reserved = group.total_reserved_size();
            write!(f, "{} used = {reserved}", group.name)?;
            if total_reserved > 0 {
                #[expect(clippy::cast_precision_loss)]
                let share = reserved as f64 / total_reserved as f64 * 100.0;
                write!(f, ", {share:.1}% of total used")?;
            }
            writeln!(f)?;
        }

        for group in &self.groups {
            write!(f, "{} {} blocks", group.name, group.blocks.len())?;
            for block in &group.blocks {
                write!(
                    f,
                    " [used = {}, avail = {}]",
                    block.reserved, block.maximum_available
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn block(capacity: usize, reserved: usize) -> BlockStats {
        BlockStats {
            base: 0x1000,
            capacity,
            reserved,
            available: capacity - reserved,
            maximum_available: capacity - reserved,
            slot_count: usize::from(reserved > 0),
        }
    }

    #[test]
    fn test_report_format() {
        let stats = AllocatorStats {
            groups: vec![
                GroupStats {
                    affinity: Affinity::OBJECTS,
                    name: "objects".to_owned(),
                    block_size: 1024,
                    alignment: 8,
                    blocks: vec![block(1024, 300), block(1024, 0)],
                },
                GroupStats {
                    affinity: Affinity::DATA,
                    name: "data".to_owned(),
                    block_size: 4096,
                    alignment: 8,
                    blocks: vec![block(4096, 100)],
                },
            ],
        };

        assert_eq!(stats.total_reserved_size(), 400);
        assert_eq!(stats.total_memory_size(), 6144);
        assert_eq!(stats.total_available_size(), 5744);
        assert_eq!(
            stats.to_string(),
            "allocator report: 2 groups\n\
             total available = 5744, total reserved = 400, total memory = 6144\n\
             objects used = 300, 75.0% of total used\n\
             data used = 100, 25.0% of total used\n\
             objects 2 blocks [used = 300, avail = 724] [used = 0, avail = 1024]\n\
             data 1 blocks [used = 100, avail = 3996]\n"
        );
    }

    #[test]
    fn test_report_without_reservations() {
        let stats = AllocatorStats { groups: Vec::new() };
        assert_eq!(
            stats.to_string(),
            "allocator report: 0 groups\n\
             total available = 0, total reserved = 0, total memory = 0\n"
        );
    }
}
