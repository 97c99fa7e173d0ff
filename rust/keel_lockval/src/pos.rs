//! Source position capture for acquisition sites.

use std::fmt::{Display, Formatter};
use std::panic::Location;

/// The source position of a lock operation.
///
/// Captured at the outermost user-facing call via `#[track_caller]`, so the
/// position names the caller of the primitive rather than its internals.
/// Positions identify `static`-style locks in the per-position class cache
/// and annotate ownership records for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SrcPos {
    /// Source file of the call site.
    pub file: &'static str,
    /// 1-based line of the call site.
    pub line: u32,
    /// 1-based column of the call site.
    pub column: u32,
}

impl SrcPos {
    /// Captures the position of the caller.
    #[inline]
    #[must_use]
    #[track_caller]
    pub fn here() -> Self {
        Location::caller().into()
    }

    /// A position that names no source location.
    pub const NONE: Self = Self {
        file: "<unknown>",
        line: 0,
        column: 0,
    };
}

impl From<&'_ Location<'static>> for SrcPos {
    #[inline]
    fn from(loc: &Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl Display for SrcPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}
