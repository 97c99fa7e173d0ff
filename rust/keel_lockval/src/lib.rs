//! Runtime lock validation for the keel synchronization primitives.
//!
//! The validator observes every acquire, release and signal of the
//! primitives in `keel_sync` and refuses operations that would deadlock,
//! invert an established locking order, upgrade a read lock, release out of
//! order within a strict class, or signal an event from an unauthorized
//! thread. It is an observation and policy layer: it never blocks on behalf
//! of a primitive and keeps no state across the process lifetime.
//!
//! The pieces:
//!
//! - [`class`] — named equivalence classes of locks with learned or
//!   declared precedence.
//! - [`record`] — per-lock ownership records the primitives attach.
//! - [`detector`] — the order checks and the wait-graph cycle search.
//! - [`thread`] — thread identities, auto-adoption and held-lock stacks.
//! - [`error`] — the closed status-code space shared with the primitives.

pub mod class;
pub mod detector;
pub mod error;
pub mod pos;
pub mod record;
pub mod thread;

pub use class::{ClassHandle, ClassId, LockClass, SubClass};
pub use detector::BlockGuard;
pub use error::{SyncError, SyncResult};
pub use pos::SrcPos;
pub use record::{ExclRecord, ShrdRecord};
pub use thread::{current as current_thread, current_id as current_thread_id, ThreadId};

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);
static QUIET: AtomicBool = AtomicBool::new(false);
static MAY_PANIC: AtomicBool = AtomicBool::new(false);

/// Whether validation is enabled process-wide.
#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Enables or disables validation process-wide. Returns the previous
/// setting.
pub fn set_enabled(enabled: bool) -> bool {
    ENABLED.swap(enabled, Ordering::Relaxed)
}

/// Whether violation diagnostics are suppressed.
#[inline]
pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

/// Suppresses or restores violation diagnostics. Returns the previous
/// setting.
pub fn set_quiet(quiet: bool) -> bool {
    QUIET.swap(quiet, Ordering::Relaxed)
}

/// Whether a detected violation panics in addition to being returned.
#[inline]
pub fn may_panic() -> bool {
    MAY_PANIC.load(Ordering::Relaxed)
}

/// Makes detected violations panic (or not). Returns the previous setting.
pub fn set_may_panic(may_panic: bool) -> bool {
    MAY_PANIC.swap(may_panic, Ordering::Relaxed)
}
