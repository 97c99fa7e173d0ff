//! Status codes shared by the synchronization primitives and the validator.

use std::fmt::{Display, Formatter};

/// Result of a synchronization or validation operation.
pub type SyncResult<T> = Result<T, SyncError>;

/// The closed set of failure kinds produced by the primitives and the
/// validator.
///
/// Validator verdicts ([`WrongOrder`], [`Deadlock`], ...) are returned before
/// any state mutation the failed operation would have performed, so the
/// primitive is left in a consistent state. [`Destroyed`] is never
/// recoverable for the caller.
///
/// [`WrongOrder`]: SyncError::WrongOrder
/// [`Deadlock`]: SyncError::Deadlock
/// [`Destroyed`]: SyncError::Destroyed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SyncError {
    /// The wait deadline was reached before the operation could complete.
    Timeout,
    /// The underlying wait was interrupted and the caller opted out of
    /// automatic resumption.
    Interrupted,
    /// The primitive is still owned and cannot be destroyed.
    Busy,
    /// The primitive was destroyed, either before the call or while the
    /// caller was blocked in it.
    Destroyed,
    /// The calling thread does not own the lock it tried to release.
    NotOwner,
    /// Acquiring the lock would violate the established locking order.
    WrongOrder,
    /// The lock was released out of order within a strict-release-order
    /// class.
    WrongReleaseOrder,
    /// Blocking on the lock would close a cycle in the wait graph.
    Deadlock,
    /// A thread holding a read lock tried to upgrade it to a write lock.
    IllegalUpgrade,
    /// The calling thread is not registered as a signaller of the event.
    NotSignaller,
    /// The handle does not refer to a live primitive.
    InvalidHandle,
    /// An argument was outside its valid domain.
    InvalidParameter,
    /// A permanent allocation failed.
    NoMemory,
    /// A temporary allocation failed.
    NoTmpMemory,
}

impl SyncError {
    /// The symbolic name of the error kind.
    pub const fn name(self) -> &'static str {
        match self {
            SyncError::Timeout => "TIMEOUT",
            SyncError::Interrupted => "INTERRUPTED",
            SyncError::Busy => "SEM_BUSY",
            SyncError::Destroyed => "SEM_DESTROYED",
            SyncError::NotOwner => "NOT_OWNER",
            SyncError::WrongOrder => "SEM_LV_WRONG_ORDER",
            SyncError::WrongReleaseOrder => "SEM_LV_WRONG_RELEASE_ORDER",
            SyncError::Deadlock => "SEM_LV_DEADLOCK",
            SyncError::IllegalUpgrade => "SEM_LV_ILLEGAL_UPGRADE",
            SyncError::NotSignaller => "SEM_LV_NOT_SIGNALLER",
            SyncError::InvalidHandle => "INVALID_HANDLE",
            SyncError::InvalidParameter => "INVALID_PARAMETER",
            SyncError::NoMemory => "NO_MEMORY",
            SyncError::NoTmpMemory => "NO_TMP_MEMORY",
        }
    }

    /// Whether the error was produced by a validator check rather than by
    /// the primitive itself.
    pub const fn is_validator_verdict(self) -> bool {
        matches!(
            self,
            SyncError::WrongOrder
                | SyncError::WrongReleaseOrder
                | SyncError::Deadlock
                | SyncError::IllegalUpgrade
                | SyncError::NotSignaller
                | SyncError::NotOwner
        )
    }

    /// Whether the error is a normal contention outcome.
    pub const fn is_contention(self) -> bool {
        matches!(self, SyncError::Timeout | SyncError::Interrupted)
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            SyncError::Timeout => "the wait timed out",
            SyncError::Interrupted => "the wait was interrupted",
            SyncError::Busy => "the semaphore is busy",
            SyncError::Destroyed => "the semaphore was destroyed",
            SyncError::NotOwner => "the calling thread is not the owner",
            SyncError::WrongOrder => "lock acquired in the wrong order",
            SyncError::WrongReleaseOrder => "lock released in the wrong order",
            SyncError::Deadlock => "blocking would dead lock the thread",
            SyncError::IllegalUpgrade => "illegal read to write lock upgrade",
            SyncError::NotSignaller => "the calling thread is not a permitted signaller",
            SyncError::InvalidHandle => "invalid semaphore handle",
            SyncError::InvalidParameter => "invalid parameter",
            SyncError::NoMemory => "out of memory",
            SyncError::NoTmpMemory => "out of temporary memory",
        };
        write!(f, "{} ({})", description, self.name())
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(SyncError::Deadlock.is_validator_verdict());
        assert!(SyncError::WrongReleaseOrder.is_validator_verdict());
        assert!(!SyncError::Timeout.is_validator_verdict());

        assert!(SyncError::Timeout.is_contention());
        assert!(SyncError::Interrupted.is_contention());
        assert!(!SyncError::Destroyed.is_contention());
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(SyncError::Deadlock.name(), "SEM_LV_DEADLOCK");
        assert_eq!(SyncError::Busy.name(), "SEM_BUSY");
    }
}
