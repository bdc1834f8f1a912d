//! Allocation affinity tags.

use std::{borrow::Cow, fmt};

use derive_more::From;

/// Category tag that decides which memory block group serves a request.
///
/// Affinities only group allocations with similar size and lifetime so they
/// end up next to each other; they carry no other meaning. The set is open:
/// any `u32` is a valid affinity and gets its own group on first use.
///
/// # Examples
///
/// ```
/// use slotalloc::Affinity;
///
/// assert_eq!(Affinity::NODES.to_string(), "nodes");
/// assert_eq!(Affinity::new(7).to_string(), "affinity_7");
/// assert_eq!(Affinity::from(1), Affinity::DATA);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct Affinity(u32);

impl Affinity {
    /// General objects.
    pub const OBJECTS: Self = Self(0);
    /// Bulk data buffers.
    pub const DATA: Self = Self(1);
    /// Scene graph nodes.
    pub const NODES: Self = Self(2);
    /// Physics data.
    pub const PHYSICS: Self = Self(3);

    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Returns the name used for the group of this affinity unless one is
    /// configured explicitly.
    #[must_use]
    pub fn default_name(self) -> Cow<'static, str> {
        match self {
            Self::OBJECTS => Cow::Borrowed("objects"),
            Self::DATA => Cow::Borrowed("data"),
            Self::NODES => Cow::Borrowed("nodes"),
            Self::PHYSICS => Cow::Borrowed("physics"),
            Self(index) => Cow::Owned(format!("affinity_{index}")),
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.default_name())
    }
}
