//! The OS-level blocking primitive behind every semaphore.
//!
//! A [`Waker`] parks a thread until the paired state word changes, with an
//! optional deadline. The contract is futex shaped: a wake that happens
//! after the waiter's check of the state word but before it suspends must
//! not be lost. On Linux the implementation is the futex syscall; elsewhere
//! a mutex/condvar pair provides the same guarantees (minus interruption
//! reporting, which only the syscall path can observe).

use crate::deadline::Deadline;
use std::sync::atomic::AtomicU32;

/// Why a wait returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Woken, or the state word no longer matched; the caller re-examines
    /// its state. Spurious wakeups report this as well.
    Woke,
    /// The deadline was reached.
    TimedOut,
    /// The blocking syscall was interrupted.
    Interrupted,
}

/// A single wakeup object.
#[derive(Debug, Default)]
pub struct Waker {
    inner: imp::Waker,
}

impl Waker {
    /// Creates a wakeup object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `state` no longer holds `expected`, a wakeup arrives,
    /// or the deadline passes.
    ///
    /// Returns [`WakeOutcome::Woke`] immediately when the state word does
    /// not match. A `Poll` deadline never suspends.
    pub fn wait(&self, state: &AtomicU32, expected: u32, deadline: &Deadline) -> WakeOutcome {
        if deadline.is_poll() {
            return WakeOutcome::TimedOut;
        }
        self.inner.wait(state, expected, deadline)
    }

    /// Wakes one waiter of `state`.
    pub fn wake_one(&self, state: &AtomicU32) {
        self.inner.wake(state, false);
    }

    /// Wakes every waiter of `state`.
    pub fn wake_all(&self, state: &AtomicU32) {
        self.inner.wake(state, true);
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::WakeOutcome;
    use crate::deadline::Deadline;
    use std::sync::atomic::AtomicU32;

    // Kept local rather than taken from a binding crate, the constants are
    // part of the stable kernel ABI.
    const FUTEX_WAIT: libc::c_int = 0;
    const FUTEX_WAKE: libc::c_int = 1;
    const FUTEX_PRIVATE_FLAG: libc::c_int = 128;

    /// Futex-backed wakeup object. The futex word is the caller's state
    /// atomic, so the object itself carries no state.
    #[derive(Debug, Default)]
    pub(super) struct Waker;

    impl Waker {
        pub fn wait(&self, state: &AtomicU32, expected: u32, deadline: &Deadline) -> WakeOutcome {
            // Relative timeout, recomputed from the monotonic deadline on
            // every call so interrupted and resumed waits stay accurate.
            let mut timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            let timeout_ptr = match deadline.remaining() {
                None => std::ptr::null::<libc::timespec>(),
                Some(left) => {
                    if left.is_zero() {
                        return WakeOutcome::TimedOut;
                    }
                    timeout.tv_sec = left.as_secs().min(libc::time_t::MAX as u64) as libc::time_t;
                    timeout.tv_nsec = left.subsec_nanos() as libc::c_long;
                    &timeout
                }
            };

            // SAFETY: The futex word outlives the call and all pointer
            // arguments are valid for its duration.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    state.as_ptr(),
                    FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
                    expected,
                    timeout_ptr,
                )
            };
            if rc == 0 {
                return WakeOutcome::Woke;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ETIMEDOUT) => WakeOutcome::TimedOut,
                Some(libc::EINTR) => WakeOutcome::Interrupted,
                // EAGAIN: the word changed before we could sleep.
                _ => WakeOutcome::Woke,
            }
        }

        pub fn wake(&self, state: &AtomicU32, all: bool) {
            let count = if all { libc::c_int::MAX } else { 1 };
            // SAFETY: Plain futex wake on a live word; no memory is
            // accessed through the pointer.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    state.as_ptr(),
                    FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
                    count,
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::WakeOutcome;
    use crate::deadline::Deadline;
    use parking_lot::{Condvar, Mutex};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Portable wakeup object over a mutex/condvar pair.
    ///
    /// The state check happens under the internal mutex and wakers notify
    /// under the same mutex, which closes the lost-wakeup window.
    #[derive(Debug, Default)]
    pub(super) struct Waker {
        lock: Mutex<()>,
        cond: Condvar,
    }

    impl Waker {
        pub fn wait(&self, state: &AtomicU32, expected: u32, deadline: &Deadline) -> WakeOutcome {
            let mut guard = self.lock.lock();
            if state.load(Ordering::Acquire) != expected {
                return WakeOutcome::Woke;
            }
            match deadline.instant() {
                None => {
                    self.cond.wait(&mut guard);
                    WakeOutcome::Woke
                }
                Some(at) => {
                    if self.cond.wait_until(&mut guard, at).timed_out() {
                        WakeOutcome::TimedOut
                    } else {
                        WakeOutcome::Woke
                    }
                }
            }
        }

        pub fn wake(&self, state: &AtomicU32, all: bool) {
            let _ = state;
            // Taking the mutex orders this wake after a concurrent waiter's
            // state check.
            drop(self.lock.lock());
            if all {
                self.cond.notify_all();
            } else {
                self.cond.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::{Deadline, WaitSpec};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_times_out() {
        let waker = Waker::new();
        let state = AtomicU32::new(0);

        let started = Instant::now();
        let deadline = Deadline::new(WaitSpec::RELATIVE_MILLIS, 30);
        loop {
            match waker.wait(&state, 0, &deadline) {
                WakeOutcome::TimedOut => break,
                WakeOutcome::Woke | WakeOutcome::Interrupted => {
                    if deadline.has_expired() {
                        break;
                    }
                }
            }
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn mismatched_state_does_not_sleep() {
        let waker = Waker::new();
        let state = AtomicU32::new(7);
        let outcome = waker.wait(&state, 0, &Deadline::Never);
        assert_eq!(outcome, WakeOutcome::Woke);
    }

    #[test]
    fn wake_one_releases_a_waiter() {
        struct Shared {
            waker: Waker,
            state: AtomicU32,
        }
        let shared = Arc::new(Shared {
            waker: Waker::new(),
            state: AtomicU32::new(0),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || loop {
                if shared.state.load(Ordering::Acquire) == 1 {
                    break;
                }
                shared.waker.wait(&shared.state, 0, &Deadline::Never);
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        shared.state.store(1, Ordering::Release);
        shared.waker.wake_one(&shared.state);
        worker.join().unwrap();
    }

    #[test]
    fn poll_never_blocks() {
        let waker = Waker::new();
        let state = AtomicU32::new(0);
        assert_eq!(waker.wait(&state, 0, &Deadline::Poll), WakeOutcome::TimedOut);
    }
}
