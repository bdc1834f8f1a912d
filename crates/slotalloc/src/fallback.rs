//! Fallback allocation strategies.
//!
//! When a memory block group cannot grow, the [`Allocator`] walks a chain of
//! [`AllocationStrategy`] implementations: first any nested strategies (for
//! instance another [`Allocator`]), then the terminal system strategy chosen
//! by [`FallbackMode`]. Deallocation walks the same chain in the same order,
//! so a pointer always returns to the strategy that produced it.
//!
//! The terminal strategy cannot tell whether it owns a pointer, so it claims
//! every pointer nobody else recognised. For the same reason a nested
//! [`Allocator`] never uses its own terminal strategy, and only the outermost
//! allocator's terminal sits at the end of the chain. The allocation and deallocation
//! sides of one mode are always paired (`std::alloc` with the same layout,
//! or `malloc` with `free`).
//!
//! [`Allocator`]: crate::Allocator

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use derive_more::{Display, IsVariant};
use log::{error, warn};

use crate::affinity::Affinity;

/// A source of memory that the allocator can fall back on.
pub trait AllocationStrategy: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Allocates `size` bytes, returning `None` if the strategy cannot.
    fn allocate(&self, size: usize, affinity: Affinity) -> Option<NonNull<u8>>;

    /// Returns `ptr` to the strategy.
    ///
    /// Returns `false` if the strategy does not own `ptr`.
    ///
    /// # Safety
    ///
    /// If the strategy owns `ptr`, it must have been returned by its
    /// `allocate` with the same `size` and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> bool;
}

/// Terminal system strategy used when pooled allocation fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, IsVariant)]
pub enum FallbackMode {
    /// `std::alloc::alloc` / `std::alloc::dealloc` with a recorded layout.
    #[default]
    #[display("system-new-delete")]
    SystemNewDelete,
    /// `malloc` / `free` from the C library.
    #[display("malloc-free")]
    MallocFree,
    /// No system fallback: growth failures are returned to the caller and
    /// unknown pointers are reported.
    #[display("none")]
    Disabled,
}

impl FallbackMode {
    pub(crate) fn strategy(self, alignment: usize) -> Option<Box<dyn AllocationStrategy>> {
        match self {
            Self::SystemNewDelete => Some(Box::new(SystemStrategy::new(alignment))),
            Self::MallocFree => Some(Box::new(MallocStrategy::new(alignment))),
            Self::Disabled => None,
        }
    }
}

/// Allocates through `std::alloc` with `Layout(size, alignment)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStrategy {
    alignment: usize,
}

impl SystemStrategy {
    #[must_use]
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }

    fn layout(&self, size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), self.alignment).ok()
    }
}

impl AllocationStrategy for SystemStrategy {
    fn name(&self) -> &str {
        "system-new-delete"
    }

    fn allocate(&self, size: usize, _affinity: Affinity) -> Option<NonNull<u8>> {
        let layout = self.layout(size)?;
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let Some(layout) = self.layout(size) else {
            error!("system-new-delete: no valid layout for {ptr:p} ({size} bytes)");
            return false;
        };
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        true
    }
}

/// Allocates through `malloc` and releases through `free`.
///
/// Results that do not meet `alignment` are handed back to `free` and
/// reported as a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocStrategy {
    alignment: usize,
}

impl MallocStrategy {
    #[must_use]
    pub fn new(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }
}

impl AllocationStrategy for MallocStrategy {
    fn name(&self) -> &str {
        "malloc-free"
    }

    fn allocate(&self, size: usize, _affinity: Affinity) -> Option<NonNull<u8>> {
        let ptr = NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast::<u8>())?;
        if !ptr.as_ptr().addr().is_multiple_of(self.alignment) {
            warn!(
                "malloc-free: {ptr:p} does not meet alignment {}, releasing it",
                self.alignment
            );
            unsafe { libc::free(ptr.as_ptr().cast()) };
            return None;
        }
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) -> bool {
        unsafe { libc::free(ptr.as_ptr().cast()) };
        true
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(strategy: &dyn AllocationStrategy, size: usize, align: usize) {
        let ptr = strategy.allocate(size, Affinity::OBJECTS).unwrap();
        assert!(ptr.as_ptr().addr().is_multiple_of(align));
        unsafe {
            ptr.as_ptr().write_bytes(0x33, size);
            assert!(strategy.deallocate(ptr, size));
        }
    }

    #[test]
    fn test_system_strategy() {
        let strategy = SystemStrategy::new(64);
        round_trip(&strategy, 100, 64);
        round_trip(&strategy, 0, 64);
        assert_eq!(strategy.name(), "system-new-delete");
    }

    #[test]
    fn test_malloc_strategy() {
        let strategy = MallocStrategy::new(8);
        round_trip(&strategy, 100, 8);
        round_trip(&strategy, 0, 8);
        assert_eq!(strategy.name(), "malloc-free");
    }

    #[test]
    fn test_fallback_mode_strategy() {
        assert_eq!(
            FallbackMode::SystemNewDelete.strategy(8).unwrap().name(),
            "system-new-delete"
        );
        assert_eq!(
            FallbackMode::MallocFree.strategy(8).unwrap().name(),
            "malloc-free"
        );
        assert!(FallbackMode::Disabled.strategy(8).is_none());
    }

    #[test]
    fn test_fallback_mode_display() {
        assert_eq!(FallbackMode::SystemNewDelete.to_string(), "system-new-delete");
        assert_eq!(FallbackMode::MallocFree.to_string(), "malloc-free");
        assert_eq!(FallbackMode::Disabled.to_string(), "none");
        assert!(FallbackMode::Disabled.is_disabled());
    }
}
