//! Values stored in pooled memory.

use std::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use snafu::ensure;

use crate::{
    affinity::Affinity,
    allocator::Allocator,
    error::{AllocError, UnsupportedAlignmentSnafu},
};

/// An owned `T` living in a slot of an [`Allocator`].
///
/// The slot is taken from the group of the affinity given at construction
/// and is returned when the box is dropped.
///
/// ```rust
/// use slotalloc::{Affinity, Allocator, AllocatorConfig, PoolBox};
///
/// let allocator = Allocator::new(AllocatorConfig::default());
/// let mut node = PoolBox::new_in([1_u32, 2, 3], Affinity::NODES, &allocator).unwrap();
/// node[1] = 20;
/// assert_eq!(*node, [1, 20, 3]);
/// assert_eq!(allocator.total_reserved_size(), 12);
///
/// assert_eq!(PoolBox::into_inner(node), [1, 20, 3]);
/// assert_eq!(allocator.total_reserved_size(), 0);
/// ```
pub struct PoolBox<'a, T> {
    ptr: NonNull<T>,
    allocator: &'a Allocator,
}

// The box owns its `T` exclusively, like `Box<T>`.
unsafe impl<T: Send> Send for PoolBox<'_, T> {}
unsafe impl<T: Sync> Sync for PoolBox<'_, T> {}

impl<'a, T> PoolBox<'a, T> {
    /// Moves `value` into a slot of the `affinity` group of `allocator`.
    ///
    /// # Errors
    ///
    /// - [`AllocError::UnsupportedAlignment`] if `T` needs a stricter
    ///   alignment than the group provides
    /// - any error of [`Allocator::allocate`]
    pub fn new_in(value: T, affinity: Affinity, allocator: &'a Allocator) -> Result<Self, AllocError> {
        let align = align_of::<T>();
        let group_align = allocator.alignment_for(affinity);
        ensure!(
            align <= group_align,
            UnsupportedAlignmentSnafu {
                affinity,
                align,
                group_align,
            }
        );

        let ptr = allocator.allocate(size_of::<T>(), affinity)?.cast::<T>();
        // A fallback strategy may hand out memory with a weaker alignment.
        if !ptr.is_aligned() {
            unsafe { allocator.deallocate(ptr.cast(), size_of::<T>()) };
            return UnsupportedAlignmentSnafu {
                affinity,
                align,
                group_align,
            }
            .fail();
        }

        unsafe { ptr.write(value) };
        Ok(Self { ptr, allocator })
    }

    /// Moves the value out and returns its slot.
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        unsafe {
            let value = this.ptr.read();
            this.allocator.deallocate(this.ptr.cast(), size_of::<T>());
            value
        }
    }

    /// Returns the address of the value.
    #[must_use]
    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }
}

impl<T> Deref for PoolBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<'_, T> {
    fn drop(&mut self) {
        unsafe {
            self.ptr.drop_in_place();
            self.allocator.deallocate(self.ptr.cast(), size_of::<T>());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
