//! Recursive mutex semaphore.

use crate::deadline::{Deadline, WaitSpec};
use crate::spin_wait::SpinWait;
use crate::waker::{WakeOutcome, Waker};
use crate::INDEFINITE_WAIT;
use keel_lockval::{self as lockval, ClassHandle, ExclRecord, SrcPos, SubClass, SyncError, SyncResult};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const ALIVE: u32 = 0x3ba3_198f;
const DEAD: u32 = !ALIVE;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const LOCKED_WAITERS: u32 = 2;

/// A recursive mutual-exclusion semaphore.
///
/// The owning thread may re-enter the mutex; releases must balance the
/// acquisitions. Every acquire and release is reported to the lock
/// validator unless validation was opted out at creation.
///
/// The state machine is a three-value word: unlocked, locked without
/// waiters, locked with waiters. Contended acquisition parks on the
/// [`Waker`]; release wakes one waiter iff the waiters value was observed.
pub struct Mutex {
    magic: AtomicU32,
    state: AtomicU32,
    /// Raw id of the owning thread, zero when unowned. Only written under
    /// a held state word.
    owner: AtomicU64,
    recursion: AtomicU32,
    waker: Waker,
    record: Option<Arc<ExclRecord>>,
    name: String,
}

/// Configures a [`Mutex`] before creation.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    class: Option<ClassHandle>,
    sub_class: SubClass,
    no_validation: bool,
    bootstrap: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default settings: no class, sub-class
    /// `NONE`, validation enabled.
    pub fn new() -> Self {
        Self {
            name: None,
            class: None,
            sub_class: SubClass::NONE,
            no_validation: false,
            bootstrap: false,
        }
    }

    /// Names the mutex for diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Places the mutex in a lock class.
    pub fn class(mut self, class: ClassHandle) -> Self {
        self.class = Some(class);
        self
    }

    /// Binds the sub-class.
    pub fn sub_class(mut self, sub_class: SubClass) -> Self {
        self.sub_class = sub_class;
        self
    }

    /// Opts the mutex out of lock validation.
    pub fn no_validation(mut self) -> Self {
        self.no_validation = true;
        self
    }

    /// Allows creation before the runtime is fully initialized, with
    /// reduced checks. Implies no validation.
    pub fn bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    /// Builds the mutex.
    pub fn build(self) -> SyncResult<Mutex> {
        if !self.sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        let name = self.name.unwrap_or_else(|| String::from("mutex"));
        let record = if self.no_validation || self.bootstrap {
            None
        } else {
            Some(ExclRecord::new(
                name.clone(),
                self.class,
                self.sub_class,
                true,
            )?)
        };
        Ok(Mutex {
            magic: AtomicU32::new(ALIVE),
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
            waker: Waker::new(),
            record,
            name,
        })
    }
}

impl Mutex {
    /// Creates an unowned mutex with the default settings.
    pub fn new() -> Self {
        // The default sub-class is always valid.
        match Builder::new().build() {
            Ok(mutex) => mutex,
            Err(_) => unreachable!(),
        }
    }

    /// Returns a builder for a mutex with a class, sub-class or name.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The diagnostic name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == ALIVE
    }

    /// Acquires the mutex, waiting up to `millis` milliseconds.
    /// [`INDEFINITE_WAIT`] blocks forever; an interrupted wait resumes.
    #[track_caller]
    pub fn request(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_inner(spec, value, SrcPos::here())
    }

    /// Like [`request`](Mutex::request), but an interrupted wait returns
    /// [`SyncError::Interrupted`] instead of resuming.
    #[track_caller]
    pub fn request_no_resume(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_inner(spec.no_resume(), value, SrcPos::here())
    }

    /// Acquires the mutex with the full extended-wait flag set.
    #[track_caller]
    pub fn request_ex(&self, spec: WaitSpec, value: u64) -> SyncResult<()> {
        self.request_inner(spec, value, SrcPos::here())
    }

    /// Polls the mutex without blocking.
    #[track_caller]
    pub fn try_request(&self) -> SyncResult<()> {
        self.request_inner(WaitSpec::RELATIVE_MILLIS, 0, SrcPos::here())
    }

    /// Acquires the mutex and returns a guard releasing it on drop.
    #[track_caller]
    pub fn acquire(&self) -> SyncResult<MutexGuard<'_>> {
        self.request_inner(WaitSpec::INDEFINITE, 0, SrcPos::here())?;
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    fn request_inner(&self, spec: WaitSpec, value: u64, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();

        // Recursive entry by the owner.
        if self.owner.load(Ordering::Acquire) == thread.id().raw() {
            if let Some(rec) = &self.record {
                rec.enter_recursion(&thread, pos)?;
            }
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(rec) = &self.record {
            rec.check_order(&thread, pos)?;
        }

        let deadline = Deadline::new(spec, value);
        let mut spin = SpinWait::new();
        loop {
            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(thread.id().raw(), Ordering::Relaxed);
                self.recursion.store(1, Ordering::Relaxed);
                if let Some(rec) = &self.record {
                    rec.set_owner(&thread, pos);
                }
                return Ok(());
            }

            if deadline.is_poll() {
                return Err(SyncError::Timeout);
            }

            let state = self.state.load(Ordering::Relaxed);
            if state == UNLOCKED {
                continue;
            }
            if state == LOCKED {
                // A short spin beats parking while the holder is quick.
                if spin.spin() {
                    continue;
                }
                if self
                    .state
                    .compare_exchange(LOCKED, LOCKED_WAITERS, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
            }
            if deadline.has_expired() {
                return Err(SyncError::Timeout);
            }

            let block = match &self.record {
                Some(rec) => Some(rec.check_blocking(&thread, pos)?),
                None => None,
            };
            let outcome = self.waker.wait(&self.state, LOCKED_WAITERS, &deadline);
            drop(block);

            if !self.is_alive() {
                return Err(SyncError::Destroyed);
            }
            match outcome {
                WakeOutcome::TimedOut => return Err(SyncError::Timeout),
                WakeOutcome::Interrupted if !spec.resumes() => {
                    return Err(SyncError::Interrupted)
                }
                WakeOutcome::Woke | WakeOutcome::Interrupted => {}
            }
            spin.reset();
        }
    }

    /// Releases one level of ownership.
    pub fn release(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();
        if self.owner.load(Ordering::Acquire) != thread.id().raw() {
            return Err(SyncError::NotOwner);
        }

        let depth = self.recursion.load(Ordering::Relaxed);
        if let Some(rec) = &self.record {
            if depth > 1 {
                rec.leave_recursion(&thread)?;
            } else {
                rec.release_owner(&thread)?;
            }
        }

        if depth > 1 {
            self.recursion.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        let state = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert_ne!(state, UNLOCKED);
        if state == LOCKED_WAITERS {
            self.waker.wake_one(&self.state);
        }
        Ok(())
    }

    /// Destroys the mutex.
    ///
    /// Fails with [`SyncError::Busy`] while owned. Threads blocked in
    /// [`request`](Mutex::request) observe [`SyncError::Destroyed`].
    pub fn destroy(&self) -> SyncResult<()> {
        if self.owner.load(Ordering::Acquire) != 0 {
            return Err(SyncError::Busy);
        }
        if self
            .magic
            .compare_exchange(ALIVE, DEAD, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Destroyed);
        }
        if let Some(rec) = &self.record {
            rec.kill();
        }
        self.state.store(UNLOCKED, Ordering::Release);
        self.waker.wake_all(&self.state);
        Ok(())
    }

    /// Whether any thread owns the mutex.
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Whether the calling thread owns the mutex.
    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == lockval::current_thread_id().raw()
    }

    /// The current recursion depth; zero when unowned.
    pub fn recursion_depth(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }

    /// The current validator sub-class, if the mutex is validated.
    pub fn sub_class(&self) -> Option<SubClass> {
        self.record.as_ref().map(|rec| rec.sub_class())
    }

    /// Rebinds the validator sub-class, returning the previous value.
    pub fn set_sub_class(&self, sub_class: SubClass) -> SyncResult<SubClass> {
        match &self.record {
            Some(rec) => rec.set_sub_class(sub_class),
            None => Err(SyncError::InvalidHandle),
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Mutex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("recursion", &self.recursion.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // An exclusive reference proves no other user exists; just flag the
        // record for stale handles.
        if let Some(rec) = &self.record {
            rec.kill();
        }
    }
}

/// Scoped ownership of a [`Mutex`], released on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a> {
    lock: &'a Mutex,
    _not_send: PhantomData<*const ()>,
}

impl MutexGuard<'_> {
    /// Releases the mutex, surfacing any validator verdict.
    pub fn release(self) -> SyncResult<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.lock.release()
    }
}

impl Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            log::error!("releasing mutex '{}' failed: {}", self.lock.name, err);
        }
    }
}

pub(crate) fn millis_spec(millis: u32) -> (WaitSpec, u64) {
    if millis == INDEFINITE_WAIT {
        (WaitSpec::INDEFINITE, 0)
    } else {
        (WaitSpec::RELATIVE_MILLIS, u64::from(millis))
    }
}
