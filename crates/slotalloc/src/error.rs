use std::{alloc::LayoutError, fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

use crate::affinity::Affinity;

/// Source location captured when an [`AllocError`] is created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Fatal allocation failures.
///
/// A request that merely does not fit into an existing block is not an
/// error; it is answered by growing the group. These variants are what is
/// left when growing (and every configured fallback) fails.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("failed to allocate a memory block of {size} bytes aligned to {align}"))]
    BlockAllocation {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid memory block layout: {source}"))]
    InvalidLayout {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: LayoutError,
    },
    #[snafu(display("alignment {align} is not a power of two"))]
    InvalidAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "alignment {align} exceeds the {group_align} byte alignment of the {affinity} group"
    ))]
    UnsupportedAlignment {
        affinity: Affinity,
        align: usize,
        group_align: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::BlockAllocation { location, .. }
            | Self::InvalidLayout { location, .. }
            | Self::InvalidAlignment { location, .. }
            | Self::UnsupportedAlignment { location, .. } => *location,
        }
    }
}
