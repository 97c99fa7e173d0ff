//! Validated synchronization primitives of the keel runtime.
//!
//! Four primitive families over a futex-shaped [`Waker`](waker::Waker) and
//! a shared atomic state word each:
//!
//! - [`Mutex`] — recursive mutual exclusion.
//! - [`AutoResetEvent`] — single-permit event, one waiter per signal.
//! - [`ManualResetEvent`] — sticky event, broadcast until reset.
//! - [`RwLock`] — reentrant reader/writer lock with writer-side read
//!   recursion.
//!
//! Every blocking, enter, leave and signal operation is observed by the
//! lock validator in [`keel_lockval`], which can refuse it with one of the
//! `SEM_LV` verdicts before any state changes hands. Waits take the full
//! extended flag set (relative/absolute, milliseconds/nanoseconds,
//! resuming or not) via [`WaitSpec`], or plain milliseconds with
//! [`INDEFINITE_WAIT`] as the forever value.

pub mod deadline;
pub mod event;
pub mod mutex;
pub mod rwlock;
pub mod waker;

mod spin_wait;

/// The validator crate, re-exported for class and policy control.
pub use keel_lockval as lockval;

pub use deadline::{monotonic_ns, Deadline, OnInterrupt, TimeUnit, Timing, WaitSpec};
pub use event::{AutoResetEvent, ManualResetEvent};
pub use keel_lockval::{
    ClassHandle, LockClass, SrcPos, SubClass, SyncError, SyncResult, ThreadId,
};
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{Direction, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use waker::{WakeOutcome, Waker};

/// Sentinel for the millisecond-based wait entry points: block without a
/// time limit.
pub const INDEFINITE_WAIT: u32 = u32::MAX;
