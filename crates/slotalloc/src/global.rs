//! Process-wide allocator instance.
//!
//! The instance is created on first use with [`AllocatorConfig::default`],
//! unless [`init`] runs first. It lives for the rest of the process and is
//! never torn down.

use std::ptr::NonNull;

use log::warn;
use spin::Once;

use crate::{affinity::Affinity, allocator::Allocator, config::AllocatorConfig, error::AllocError};

static INSTANCE: Once<Allocator> = Once::new();

/// Returns the process-wide allocator, creating it if needed.
pub fn instance() -> &'static Allocator {
    INSTANCE.call_once(Allocator::default)
}

/// Creates the process-wide allocator from `config`.
///
/// Returns `false` (and leaves the instance unchanged) if it already exists.
pub fn init(config: AllocatorConfig) -> bool {
    let mut created = false;
    INSTANCE.call_once(|| {
        created = true;
        Allocator::new(config)
    });
    if !created {
        warn!("global allocator is already initialized, ignoring the new configuration");
    }
    created
}

/// Allocates from the process-wide allocator.
///
/// # Errors
///
/// See [`Allocator::allocate`].
pub fn allocate(size: usize, affinity: Affinity) -> Result<NonNull<u8>, AllocError> {
    instance().allocate(size, affinity)
}

/// Deallocates through the process-wide allocator.
///
/// # Safety
///
/// See [`Allocator::deallocate`].
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) -> bool {
    unsafe { instance().deallocate(ptr, size) }
}
