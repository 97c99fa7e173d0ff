//! Deadline arithmetic for extended waits.
//!
//! An extended wait is described by a [`WaitSpec`] plus a 64-bit timeout
//! value; [`Deadline::new`] folds both into either "poll only", "never" or
//! an absolute monotonic instant. Overflow at any point saturates to
//! "never". The wall clock is not consulted for waits.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// How the timeout value is anchored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timing {
    /// Wait forever; the timeout value is ignored.
    Indefinite,
    /// The value is a span from now.
    Relative,
    /// The value is a point on the monotonic clock, see [`monotonic_ns`].
    Absolute,
}

/// The unit of the timeout value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeUnit {
    /// Milliseconds.
    Millis,
    /// Nanoseconds.
    Nanos,
}

/// What to do when the underlying wait is interrupted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OnInterrupt {
    /// Recompute the remaining time and resume the wait.
    Resume,
    /// Report [`SyncError::Interrupted`](keel_lockval::SyncError::Interrupted)
    /// to the caller.
    Return,
}

/// The full flag set of an extended wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    /// Anchoring of the timeout value.
    pub timing: Timing,
    /// Unit of the timeout value.
    pub unit: TimeUnit,
    /// Interruption policy.
    pub on_interrupt: OnInterrupt,
}

impl WaitSpec {
    /// An indefinite, resumable wait.
    pub const INDEFINITE: Self = Self {
        timing: Timing::Indefinite,
        unit: TimeUnit::Millis,
        on_interrupt: OnInterrupt::Resume,
    };

    /// A resumable wait relative to now, in milliseconds.
    pub const RELATIVE_MILLIS: Self = Self {
        timing: Timing::Relative,
        unit: TimeUnit::Millis,
        on_interrupt: OnInterrupt::Resume,
    };

    /// A resumable wait relative to now, in nanoseconds.
    pub const RELATIVE_NANOS: Self = Self {
        timing: Timing::Relative,
        unit: TimeUnit::Nanos,
        on_interrupt: OnInterrupt::Resume,
    };

    /// A resumable wait until an absolute monotonic time, in nanoseconds.
    pub const ABSOLUTE_NANOS: Self = Self {
        timing: Timing::Absolute,
        unit: TimeUnit::Nanos,
        on_interrupt: OnInterrupt::Resume,
    };

    /// The same spec with interruptions surfaced to the caller.
    #[must_use]
    pub const fn no_resume(mut self) -> Self {
        self.on_interrupt = OnInterrupt::Return;
        self
    }

    /// Whether interruptions resume silently.
    #[inline]
    pub const fn resumes(&self) -> bool {
        matches!(self.on_interrupt, OnInterrupt::Resume)
    }
}

/// The monotonic reference used for [`Timing::Absolute`] values.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the monotonic clock since the process reference
/// point. Absolute wait values are expressed on this scale.
pub fn monotonic_ns() -> u64 {
    let nanos = epoch().elapsed().as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

/// A resolved wait deadline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Deadline {
    /// Do not block at all; fail with timeout if the operation cannot
    /// complete immediately.
    Poll,
    /// Block without a time limit.
    Never,
    /// Block until the given monotonic instant.
    At(Instant),
}

impl Deadline {
    /// Resolves a wait spec and timeout value.
    pub fn new(spec: WaitSpec, value: u64) -> Self {
        let to_duration = |value: u64| match spec.unit {
            TimeUnit::Millis => Duration::from_millis(value),
            TimeUnit::Nanos => Duration::from_nanos(value),
        };

        match spec.timing {
            Timing::Indefinite => Deadline::Never,
            Timing::Relative => {
                if value == 0 {
                    return Deadline::Poll;
                }
                match Instant::now().checked_add(to_duration(value)) {
                    Some(at) => Deadline::At(at),
                    None => Deadline::Never,
                }
            }
            Timing::Absolute => {
                let target = to_duration(value);
                let now = Instant::now();
                match epoch().checked_add(target) {
                    Some(at) if at > now => Deadline::At(at),
                    Some(_) => Deadline::Poll,
                    None => Deadline::Never,
                }
            }
        }
    }

    /// Whether the caller asked for a pure poll.
    #[inline]
    pub fn is_poll(&self) -> bool {
        matches!(self, Deadline::Poll)
    }

    /// Whether the deadline lies in the past.
    pub fn has_expired(&self) -> bool {
        match self {
            Deadline::Poll => true,
            Deadline::Never => false,
            Deadline::At(at) => *at <= Instant::now(),
        }
    }

    /// Time left until the deadline; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Poll => Some(Duration::ZERO),
            Deadline::Never => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// The absolute instant, when there is one.
    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(*at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_relative_is_a_poll() {
        let deadline = Deadline::new(WaitSpec::RELATIVE_MILLIS, 0);
        assert!(deadline.is_poll());
        assert!(deadline.has_expired());
    }

    #[test]
    fn indefinite_ignores_the_value() {
        assert_eq!(Deadline::new(WaitSpec::INDEFINITE, 0), Deadline::Never);
        assert_eq!(Deadline::new(WaitSpec::INDEFINITE, u64::MAX), Deadline::Never);
        assert!(!Deadline::new(WaitSpec::INDEFINITE, 5).has_expired());
    }

    #[test]
    fn relative_deadlines_lie_in_the_future() {
        let deadline = Deadline::new(WaitSpec::RELATIVE_MILLIS, 200);
        let remaining = deadline.remaining().unwrap();
        assert!(remaining > Duration::from_millis(100));
        assert!(remaining <= Duration::from_millis(200));
    }

    #[test]
    fn absolute_deadlines_use_the_monotonic_scale() {
        let soon = monotonic_ns() + Duration::from_millis(100).as_nanos() as u64;
        let deadline = Deadline::new(WaitSpec::ABSOLUTE_NANOS, soon);
        assert!(matches!(deadline, Deadline::At(_)));
        assert!(!deadline.has_expired());
    }

    #[test]
    fn past_absolute_deadlines_poll() {
        let before = monotonic_ns().saturating_sub(1);
        let deadline = Deadline::new(WaitSpec::ABSOLUTE_NANOS, before);
        assert!(deadline.is_poll());
    }

    #[test]
    fn overflow_saturates_to_never() {
        let deadline = Deadline::new(WaitSpec::RELATIVE_NANOS.no_resume(), u64::MAX);
        // Either the instant fits or the deadline saturates; it must not
        // wrap into the past.
        assert!(!deadline.has_expired());
    }

    #[test]
    fn no_resume_flag_round_trips() {
        assert!(WaitSpec::RELATIVE_MILLIS.resumes());
        assert!(!WaitSpec::RELATIVE_MILLIS.no_resume().resumes());
    }
}
