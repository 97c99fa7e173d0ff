//! Event semaphores.
//!
//! Two flavors: [`AutoResetEvent`] hands one permit to one waiter per
//! signal; [`ManualResetEvent`] stays signalled and releases every waiter
//! until reset. Both can restrict who may signal them through a shared
//! validator record: the permit list is unenforced until the first
//! signaller is registered, and editable without holding any user lock.

use crate::deadline::{Deadline, WaitSpec};
use crate::mutex::millis_spec;
use crate::waker::{WakeOutcome, Waker};
use keel_lockval::{
    self as lockval, ClassHandle, ShrdRecord, SrcPos, SubClass, SyncError, SyncResult, ThreadId,
};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const AUTO_ALIVE: u32 = 0x51c9_07aa;
const AUTO_DEAD: u32 = !AUTO_ALIVE;
const MULTI_ALIVE: u32 = 0x60d2_4e1b;
const MULTI_DEAD: u32 = !MULTI_ALIVE;

// Manual-reset state machine.
const NOT_SIGNALLED: u32 = 0;
const NOT_SIGNALLED_WAITERS: u32 = 1;
const SIGNALLED: u32 = 2;

/// Configures an event before creation.
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
    /// `ANY`, validation enabled.
    pub fn new() -> Self {
        Self {
            name: None,
            class: None,
            sub_class: SubClass::ANY,
            no_validation: false,
            bootstrap: false,
        }
    }

    /// Names the event for diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Places the event in a lock class.
    pub fn class(mut self, class: ClassHandle) -> Self {
        self.class = Some(class);
        self
    }

    /// Binds the sub-class.
    pub fn sub_class(mut self, sub_class: SubClass) -> Self {
        self.sub_class = sub_class;
        self
    }

    /// Opts the event out of lock validation.
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

    fn record(&self, name: &str) -> SyncResult<Option<Arc<ShrdRecord>>> {
        if self.no_validation || self.bootstrap {
            return Ok(None);
        }
        Ok(Some(ShrdRecord::new(
            name,
            self.class.clone(),
            self.sub_class,
            true,
            true,
        )?))
    }

    /// Builds an auto-reset event.
    pub fn build_auto(self) -> SyncResult<AutoResetEvent> {
        if !self.sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        let name = self.name.clone().unwrap_or_else(|| String::from("event"));
        let record = self.record(&name)?;
        Ok(AutoResetEvent {
            magic: AtomicU32::new(AUTO_ALIVE),
            signalled: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            waker: Waker::new(),
            record,
            name,
        })
    }

    /// Builds a manual-reset event.
    pub fn build_manual(self) -> SyncResult<ManualResetEvent> {
        if !self.sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| String::from("event-multi"));
        let record = self.record(&name)?;
        Ok(ManualResetEvent {
            magic: AtomicU32::new(MULTI_ALIVE),
            state: AtomicU32::new(NOT_SIGNALLED),
            serial: AtomicU32::new(0),
            waker: Waker::new(),
            record,
            name,
        })
    }
}

/// Decrements the waiter count when a wait ends, however it ends.
struct WaiterCount<'a>(&'a AtomicU32);

impl Drop for WaiterCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A single-permit event: each signal releases at most one waiter and the
/// permit is consumed by the release.
pub struct AutoResetEvent {
    magic: AtomicU32,
    /// 1 while a permit is pending.
    signalled: AtomicU32,
    waiters: AtomicU32,
    waker: Waker,
    record: Option<Arc<ShrdRecord>>,
    name: String,
}

impl AutoResetEvent {
    /// Creates an unsignalled event with the default settings.
    pub fn new() -> Self {
        match Builder::new().build_auto() {
            Ok(event) => event,
            Err(_) => unreachable!(),
        }
    }

    /// Returns a builder for an event with a class, sub-class or name.
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
        self.magic.load(Ordering::Acquire) == AUTO_ALIVE
    }

    /// Posts one permit, releasing one waiter if any is parked.
    pub fn signal(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            let thread = lockval::thread::current();
            rec.check_signaller(&thread)?;
        }
        self.signalled.store(1, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.waker.wake_one(&self.signalled);
        }
        Ok(())
    }

    /// Waits up to `millis` milliseconds for a permit.
    /// [`INDEFINITE_WAIT`](crate::INDEFINITE_WAIT) blocks forever.
    #[track_caller]
    pub fn wait(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.wait_inner(spec, value, SrcPos::here())
    }

    /// Like [`wait`](AutoResetEvent::wait), but an interrupted wait returns
    /// [`SyncError::Interrupted`] instead of resuming.
    #[track_caller]
    pub fn wait_no_resume(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.wait_inner(spec.no_resume(), value, SrcPos::here())
    }

    /// Waits with the full extended-wait flag set.
    #[track_caller]
    pub fn wait_ex(&self, spec: WaitSpec, value: u64) -> SyncResult<()> {
        self.wait_inner(spec, value, SrcPos::here())
    }

    fn wait_inner(&self, spec: WaitSpec, value: u64, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();
        let deadline = Deadline::new(spec, value);

        self.waiters.fetch_add(1, Ordering::AcqRel);
        let _count = WaiterCount(&self.waiters);

        loop {
            if !self.is_alive() {
                return Err(SyncError::Destroyed);
            }
            if self
                .signalled
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            if deadline.is_poll() || deadline.has_expired() {
                return Err(SyncError::Timeout);
            }

            let block = match &self.record {
                Some(rec) if rec.signalling_restricted() => {
                    Some(rec.check_blocking(&thread, pos)?)
                }
                _ => None,
            };
            let outcome = self.waker.wait(&self.signalled, 0, &deadline);
            drop(block);

            match outcome {
                WakeOutcome::TimedOut => {
                    // A signal racing the deadline still counts.
                    if self
                        .signalled
                        .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Ok(());
                    }
                    return Err(SyncError::Timeout);
                }
                WakeOutcome::Interrupted if !spec.resumes() => {
                    return Err(SyncError::Interrupted)
                }
                WakeOutcome::Woke | WakeOutcome::Interrupted => {}
            }
        }
    }

    /// Destroys the event. Parked waiters observe
    /// [`SyncError::Destroyed`] in bounded time.
    pub fn destroy(&self) -> SyncResult<()> {
        if self
            .magic
            .compare_exchange(AUTO_ALIVE, AUTO_DEAD, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Destroyed);
        }
        if let Some(rec) = &self.record {
            rec.kill();
        }
        self.waker.wake_all(&self.signalled);
        Ok(())
    }

    /// Restricts signalling to `thread`, replacing any previous permit
    /// list and arming the check.
    pub fn set_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.set_signaller(thread);
        }
        Ok(())
    }

    /// Adds `thread` to the permit list.
    pub fn add_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.add_signaller(thread);
        }
        Ok(())
    }

    /// Removes `thread` from the permit list. The check stays armed.
    pub fn remove_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.remove_signaller(thread);
        }
        Ok(())
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for AutoResetEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoResetEvent")
            .field("name", &self.name)
            .field("signalled", &self.signalled.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for AutoResetEvent {
    fn drop(&mut self) {
        if let Some(rec) = &self.record {
            rec.kill();
        }
    }
}

/// A sticky event: once signalled it releases every waiter, current and
/// future, until it is explicitly reset.
pub struct ManualResetEvent {
    magic: AtomicU32,
    state: AtomicU32,
    /// Bumped on every signal; consumed by assertions only.
    serial: AtomicU32,
    waker: Waker,
    record: Option<Arc<ShrdRecord>>,
    name: String,
}

impl ManualResetEvent {
    /// Creates an unsignalled event with the default settings.
    pub fn new() -> Self {
        match Builder::new().build_manual() {
            Ok(event) => event,
            Err(_) => unreachable!(),
        }
    }

    /// Returns a builder for an event with a class, sub-class or name.
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
        self.magic.load(Ordering::Acquire) == MULTI_ALIVE
    }

    /// Signals the event, releasing all current waiters and letting later
    /// waits succeed immediately until the next reset.
    pub fn signal(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            let thread = lockval::thread::current();
            rec.check_signaller(&thread)?;
        }
        self.serial.fetch_add(1, Ordering::Relaxed);
        let previous = self.state.swap(SIGNALLED, Ordering::AcqRel);
        if previous == NOT_SIGNALLED_WAITERS {
            self.waker.wake_all(&self.state);
        }
        Ok(())
    }

    /// Takes the event back to the unsignalled state.
    pub fn reset(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            let thread = lockval::thread::current();
            rec.check_signaller(&thread)?;
        }
        let _ = self.state.compare_exchange(
            SIGNALLED,
            NOT_SIGNALLED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// The number of signals so far.
    pub fn signal_serial(&self) -> u32 {
        self.serial.load(Ordering::Relaxed)
    }

    /// Waits up to `millis` milliseconds for the event to be signalled.
    /// [`INDEFINITE_WAIT`](crate::INDEFINITE_WAIT) blocks forever.
    #[track_caller]
    pub fn wait(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.wait_inner(spec, value, SrcPos::here())
    }

    /// Like [`wait`](ManualResetEvent::wait), but an interrupted wait
    /// returns [`SyncError::Interrupted`] instead of resuming.
    #[track_caller]
    pub fn wait_no_resume(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.wait_inner(spec.no_resume(), value, SrcPos::here())
    }

    /// Waits with the full extended-wait flag set.
    #[track_caller]
    pub fn wait_ex(&self, spec: WaitSpec, value: u64) -> SyncResult<()> {
        self.wait_inner(spec, value, SrcPos::here())
    }

    fn wait_inner(&self, spec: WaitSpec, value: u64, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();
        let deadline = Deadline::new(spec, value);

        loop {
            if !self.is_alive() {
                return Err(SyncError::Destroyed);
            }
            let state = self.state.load(Ordering::Acquire);
            if state == SIGNALLED {
                return Ok(());
            }
            if state == NOT_SIGNALLED
                && self
                    .state
                    .compare_exchange(
                        NOT_SIGNALLED,
                        NOT_SIGNALLED_WAITERS,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_err()
            {
                continue;
            }
            if deadline.is_poll() || deadline.has_expired() {
                // Signals racing the deadline still win.
                if self.state.load(Ordering::Acquire) == SIGNALLED {
                    return Ok(());
                }
                return Err(SyncError::Timeout);
            }

            let block = match &self.record {
                Some(rec) if rec.signalling_restricted() => {
                    Some(rec.check_blocking(&thread, pos)?)
                }
                _ => None,
            };
            let outcome = self.waker.wait(&self.state, NOT_SIGNALLED_WAITERS, &deadline);
            drop(block);

            match outcome {
                WakeOutcome::TimedOut => {
                    if self.state.load(Ordering::Acquire) == SIGNALLED {
                        return Ok(());
                    }
                    return Err(SyncError::Timeout);
                }
                WakeOutcome::Interrupted if !spec.resumes() => {
                    return Err(SyncError::Interrupted)
                }
                WakeOutcome::Woke | WakeOutcome::Interrupted => {}
            }
        }
    }

    /// Destroys the event. Parked waiters observe
    /// [`SyncError::Destroyed`] in bounded time.
    pub fn destroy(&self) -> SyncResult<()> {
        if self
            .magic
            .compare_exchange(MULTI_ALIVE, MULTI_DEAD, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Destroyed);
        }
        if let Some(rec) = &self.record {
            rec.kill();
        }
        self.waker.wake_all(&self.state);
        Ok(())
    }

    /// Restricts signalling to `thread`, replacing any previous permit
    /// list and arming the check.
    pub fn set_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.set_signaller(thread);
        }
        Ok(())
    }

    /// Adds `thread` to the permit list.
    pub fn add_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.add_signaller(thread);
        }
        Ok(())
    }

    /// Removes `thread` from the permit list. The check stays armed.
    pub fn remove_signaller(&self, thread: ThreadId) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        if let Some(rec) = &self.record {
            rec.remove_signaller(thread);
        }
        Ok(())
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ManualResetEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualResetEvent")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for ManualResetEvent {
    fn drop(&mut self) {
        if let Some(rec) = &self.record {
            rec.kill();
        }
    }
}
