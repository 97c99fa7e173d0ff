//! Reentrant reader/writer semaphore.
//!
//! The whole lock state lives in one 64-bit word so direction, reader
//! count, writer count and waiting-reader count move under a single CAS:
//!
//! ```text
//! bits  0..14  reader count (active plus queued)
//! bits 16..30  writer count (the holder plus queued)
//! bit  31      direction (0 = read, 1 = write)
//! bits 32..46  queued reader count
//! ```
//!
//! The writer side parks on a single-wakeup word, the reader side on a
//! broadcast word that the last admitted reader resets. A writer may
//! recursively take the lock for reading; those reads must be unwound
//! before its final write release.

use crate::deadline::{Deadline, WaitSpec};
use crate::mutex::millis_spec;
use crate::waker::{WakeOutcome, Waker};
use keel_lockval::{
    self as lockval, record::link_siblings, ClassHandle, ExclRecord, ShrdRecord, SrcPos, SubClass,
    SyncError, SyncResult,
};
use static_assertions::const_assert;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const ALIVE: u32 = 0x7c2d_90e4;
const DEAD: u32 = !ALIVE;

const CNT_MASK: u64 = 0x7fff;
const RD_SHIFT: u32 = 0;
const RD_MASK: u64 = CNT_MASK << RD_SHIFT;
const WR_SHIFT: u32 = 16;
const WR_MASK: u64 = CNT_MASK << WR_SHIFT;
const DIR_SHIFT: u32 = 31;
const DIR_MASK: u64 = 1 << DIR_SHIFT;
const WAIT_RD_SHIFT: u32 = 32;
const WAIT_RD_MASK: u64 = CNT_MASK << WAIT_RD_SHIFT;

const ONE_READER: u64 = 1 << RD_SHIFT;
const ONE_WRITER: u64 = 1 << WR_SHIFT;
const ONE_WAITING_READER: u64 = 1 << WAIT_RD_SHIFT;

const_assert!(RD_MASK & WR_MASK == 0);
const_assert!((RD_MASK | WR_MASK) & DIR_MASK == 0);
const_assert!((RD_MASK | WR_MASK | DIR_MASK) & WAIT_RD_MASK == 0);

/// The current mode of the lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Readers are admitted.
    Read,
    /// A writer holds or is about to hold the lock.
    Write,
}

#[inline]
const fn readers(s: u64) -> u64 {
    (s & RD_MASK) >> RD_SHIFT
}

#[inline]
const fn writers(s: u64) -> u64 {
    (s & WR_MASK) >> WR_SHIFT
}

#[inline]
const fn waiting_readers(s: u64) -> u64 {
    (s & WAIT_RD_MASK) >> WAIT_RD_SHIFT
}

#[inline]
const fn direction(s: u64) -> Direction {
    if s & DIR_MASK == 0 {
        Direction::Read
    } else {
        Direction::Write
    }
}

enum WakeSide {
    Nobody,
    OneWriter,
    AllReaders,
}

/// A reentrant reader/writer semaphore with validator integration.
pub struct RwLock {
    magic: AtomicU32,
    state: AtomicU64,
    /// Raw id of the write owner, zero while nobody holds the write side.
    writer: AtomicU64,
    write_recursions: AtomicU32,
    /// Read acquisitions by the current writer (mixed recursion).
    writer_reads: AtomicU32,
    /// Single-wakeup word for queued writers.
    wr_wake: AtomicU32,
    /// Broadcast word for queued readers; sticky until the last admitted
    /// reader resets it.
    rd_wake: AtomicU32,
    rd_needs_reset: AtomicBool,
    wr_waker: Waker,
    rd_waker: Waker,
    write_record: Option<Arc<ExclRecord>>,
    read_record: Option<Arc<ShrdRecord>>,
    name: String,
}

/// Configures a [`RwLock`] before creation.
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

    /// Names the lock for diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Places the lock in a class. The reader and writer records share it.
    pub fn class(mut self, class: ClassHandle) -> Self {
        self.class = Some(class);
        self
    }

    /// Binds the sub-class of both sides.
    pub fn sub_class(mut self, sub_class: SubClass) -> Self {
        self.sub_class = sub_class;
        self
    }

    /// Opts the lock out of lock validation.
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

    /// Builds the lock.
    pub fn build(self) -> SyncResult<RwLock> {
        if !self.sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        let name = self.name.unwrap_or_else(|| String::from("rwlock"));
        let (write_record, read_record) = if self.no_validation || self.bootstrap {
            (None, None)
        } else {
            let write_record =
                ExclRecord::new(name.clone(), self.class.clone(), self.sub_class, true)?;
            let read_record =
                ShrdRecord::new(name.clone(), self.class, self.sub_class, false, true)?;
            link_siblings(&write_record, &read_record);
            (Some(write_record), Some(read_record))
        };
        Ok(RwLock {
            magic: AtomicU32::new(ALIVE),
            state: AtomicU64::new(0),
            writer: AtomicU64::new(0),
            write_recursions: AtomicU32::new(0),
            writer_reads: AtomicU32::new(0),
            wr_wake: AtomicU32::new(0),
            rd_wake: AtomicU32::new(0),
            rd_needs_reset: AtomicBool::new(false),
            wr_waker: Waker::new(),
            rd_waker: Waker::new(),
            write_record,
            read_record,
            name,
        })
    }
}

impl RwLock {
    /// Creates an idle lock with the default settings.
    pub fn new() -> Self {
        match Builder::new().build() {
            Ok(lock) => lock,
            Err(_) => unreachable!(),
        }
    }

    /// Returns a builder for a lock with a class, sub-class or name.
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

    fn signal_writer(&self) {
        self.wr_wake.store(1, Ordering::Release);
        self.wr_waker.wake_one(&self.wr_wake);
    }

    fn broadcast_readers(&self) {
        self.rd_needs_reset.store(true, Ordering::Release);
        self.rd_wake.store(1, Ordering::Release);
        self.rd_waker.wake_all(&self.rd_wake);
    }

    // ----- read side -----

    /// Acquires the lock for reading, waiting up to `millis` milliseconds.
    /// [`INDEFINITE_WAIT`](crate::INDEFINITE_WAIT) blocks forever.
    #[track_caller]
    pub fn request_read(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_read_inner(spec, value, SrcPos::here())
    }

    /// Like [`request_read`](RwLock::request_read), but an interrupted
    /// wait returns [`SyncError::Interrupted`] instead of resuming.
    #[track_caller]
    pub fn request_read_no_resume(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_read_inner(spec.no_resume(), value, SrcPos::here())
    }

    /// Acquires the lock for reading with the full extended-wait flag set.
    #[track_caller]
    pub fn request_read_ex(&self, spec: WaitSpec, value: u64) -> SyncResult<()> {
        self.request_read_inner(spec, value, SrcPos::here())
    }

    /// Polls the read side without blocking.
    #[track_caller]
    pub fn try_request_read(&self) -> SyncResult<()> {
        self.request_read_inner(WaitSpec::RELATIVE_MILLIS, 0, SrcPos::here())
    }

    /// Acquires the read side and returns a guard releasing it on drop.
    #[track_caller]
    pub fn acquire_read(&self) -> SyncResult<RwLockReadGuard<'_>> {
        self.request_read_inner(WaitSpec::INDEFINITE, 0, SrcPos::here())?;
        Ok(RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    fn request_read_inner(&self, spec: WaitSpec, value: u64, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();

        // A writer taking its own lock for reading is a mixed recursion,
        // tracked on the writer record.
        if self.writer.load(Ordering::Acquire) == thread.id().raw() {
            if let Some(rec) = &self.write_record {
                rec.enter_recursion(&thread, pos)?;
            }
            self.writer_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(rec) = &self.read_record {
            rec.check_order(&thread, pos)?;
        }

        let deadline = Deadline::new(spec, value);
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if direction(s) == Direction::Read || (readers(s) == 0 && writers(s) == 0) {
                let r = readers(s);
                debug_assert!(r < CNT_MASK / 2);
                let ns = (s & !(RD_MASK | DIR_MASK)) | ((r + 1) << RD_SHIFT);
                match self
                    .state
                    .compare_exchange_weak(s, ns, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => {
                        if let Some(rec) = &self.read_record {
                            rec.add_owner(&thread, pos);
                        }
                        return Ok(());
                    }
                    Err(actual) => {
                        s = actual;
                        continue;
                    }
                }
            }

            // Write direction and not ours.
            if deadline.is_poll() || deadline.has_expired() {
                return Err(SyncError::Timeout);
            }
            debug_assert!(readers(s) < CNT_MASK / 2);
            debug_assert!(waiting_readers(s) < CNT_MASK / 2);
            match self.state.compare_exchange_weak(
                s,
                s + ONE_READER + ONE_WAITING_READER,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => s = actual,
            }
        }

        // Queued; wait for the direction to flip to read.
        loop {
            let block = match &self.write_record {
                Some(rec) => match rec.check_blocking(&thread, pos) {
                    Ok(guard) => Some(guard),
                    Err(err) => {
                        self.retract_waiting_reader();
                        return Err(err);
                    }
                },
                None => None,
            };
            let outcome = self.rd_waker.wait(&self.rd_wake, 0, &deadline);
            drop(block);

            if !self.is_alive() {
                return Err(SyncError::Destroyed);
            }

            let mut s = self.state.load(Ordering::Acquire);
            if direction(s) == Direction::Read {
                // Admitted: the reader count already includes us, only the
                // waiting count goes down.
                loop {
                    let waiting = waiting_readers(s);
                    debug_assert!(waiting > 0);
                    match self.state.compare_exchange_weak(
                        s,
                        s - ONE_WAITING_READER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            if waiting == 1 && self.rd_needs_reset.swap(false, Ordering::AcqRel) {
                                self.rd_wake.store(0, Ordering::Release);
                            }
                            if let Some(rec) = &self.read_record {
                                rec.add_owner(&thread, pos);
                            }
                            return Ok(());
                        }
                        Err(actual) => s = actual,
                    }
                }
            }

            match outcome {
                WakeOutcome::TimedOut => {
                    self.retract_waiting_reader();
                    return Err(SyncError::Timeout);
                }
                WakeOutcome::Interrupted if !spec.resumes() => {
                    self.retract_waiting_reader();
                    return Err(SyncError::Interrupted);
                }
                WakeOutcome::Woke | WakeOutcome::Interrupted => {}
            }
        }
    }

    /// Takes one queued reader back out, keeping the reader and waiting
    /// counts in step and handing the lock over if it was the last one.
    fn retract_waiting_reader(&self) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(readers(s) > 0);
            debug_assert!(waiting_readers(s) > 0);
            let mut ns = s - ONE_READER - ONE_WAITING_READER;
            let mut wake = false;
            if readers(ns) == 0 && writers(ns) > 0 && direction(ns) == Direction::Read {
                ns |= DIR_MASK;
                wake = true;
            }
            match self
                .state
                .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wake {
                        self.signal_writer();
                    }
                    return;
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Releases one read acquisition.
    pub fn release_read(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();

        if self.writer.load(Ordering::Acquire) == thread.id().raw() {
            // Unwinding a mixed recursion.
            if self.writer_reads.load(Ordering::Relaxed) == 0 {
                return Err(SyncError::NotOwner);
            }
            if let Some(rec) = &self.write_record {
                rec.leave_recursion(&thread)?;
            }
            self.writer_reads.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(rec) = &self.read_record {
            rec.check_and_release(&thread)?;
        }

        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if readers(s) == 0 {
                return Err(SyncError::NotOwner);
            }
            let mut ns = s - ONE_READER;
            let mut wake = false;
            if readers(ns) == 0 && writers(ns) > 0 {
                ns |= DIR_MASK;
                wake = true;
            }
            match self
                .state
                .compare_exchange_weak(s, ns, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wake {
                        self.signal_writer();
                    }
                    return Ok(());
                }
                Err(actual) => s = actual,
            }
        }
    }

    // ----- write side -----

    /// Acquires the lock for writing, waiting up to `millis` milliseconds.
    /// [`INDEFINITE_WAIT`](crate::INDEFINITE_WAIT) blocks forever.
    #[track_caller]
    pub fn request_write(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_write_inner(spec, value, SrcPos::here())
    }

    /// Like [`request_write`](RwLock::request_write), but an interrupted
    /// wait returns [`SyncError::Interrupted`] instead of resuming.
    #[track_caller]
    pub fn request_write_no_resume(&self, millis: u32) -> SyncResult<()> {
        let (spec, value) = millis_spec(millis);
        self.request_write_inner(spec.no_resume(), value, SrcPos::here())
    }

    /// Acquires the lock for writing with the full extended-wait flag set.
    #[track_caller]
    pub fn request_write_ex(&self, spec: WaitSpec, value: u64) -> SyncResult<()> {
        self.request_write_inner(spec, value, SrcPos::here())
    }

    /// Polls the write side without blocking.
    #[track_caller]
    pub fn try_request_write(&self) -> SyncResult<()> {
        self.request_write_inner(WaitSpec::RELATIVE_MILLIS, 0, SrcPos::here())
    }

    /// Acquires the write side and returns a guard releasing it on drop.
    #[track_caller]
    pub fn acquire_write(&self) -> SyncResult<RwLockWriteGuard<'_>> {
        self.request_write_inner(WaitSpec::INDEFINITE, 0, SrcPos::here())?;
        Ok(RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    fn request_write_inner(&self, spec: WaitSpec, value: u64, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();
        let raw = thread.id().raw();

        // Write recursion.
        if self.writer.load(Ordering::Acquire) == raw {
            if let Some(rec) = &self.write_record {
                rec.enter_recursion(&thread, pos)?;
            }
            self.write_recursions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(rec) = &self.write_record {
            rec.check_order(&thread, pos)?;
        }

        let deadline = Deadline::new(spec, value);
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if readers(s) == 0 && writers(s) == 0 {
                // Claim the owner slot first; queued writers may only claim
                // it while the state word shows write direction, so an idle
                // word plus the slot is exclusive.
                if self
                    .writer
                    .compare_exchange(0, raw, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    s = self.state.load(Ordering::Relaxed);
                    continue;
                }
                match self.state.compare_exchange_weak(
                    s,
                    DIR_MASK | ONE_WRITER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.grant_write(&thread, pos);
                        return Ok(());
                    }
                    Err(actual) => {
                        self.writer.store(0, Ordering::Release);
                        s = actual;
                        continue;
                    }
                }
            }

            if deadline.is_poll() || deadline.has_expired() {
                return Err(SyncError::Timeout);
            }
            debug_assert!(writers(s) < CNT_MASK / 2);
            match self.state.compare_exchange_weak(
                s,
                s + ONE_WRITER,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => s = actual,
            }
        }

        // Queued; wait for the lock to be handed to the writer side, then
        // race the other queued writers for the owner slot.
        loop {
            let _ = self
                .wr_wake
                .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed);
            if self.try_claim_write(raw) {
                self.grant_write(&thread, pos);
                return Ok(());
            }
            if deadline.has_expired() {
                self.retract_writer();
                return Err(SyncError::Timeout);
            }

            let block = match &self.write_record {
                Some(rec) => match rec.check_blocking(&thread, pos) {
                    Ok(guard) => Some(guard),
                    Err(err) => {
                        self.retract_writer();
                        return Err(err);
                    }
                },
                None => None,
            };
            let outcome = self.wr_waker.wait(&self.wr_wake, 0, &deadline);
            drop(block);

            if !self.is_alive() {
                return Err(SyncError::Destroyed);
            }
            match outcome {
                WakeOutcome::TimedOut => {
                    // A handoff racing the deadline still counts.
                    if self.try_claim_write(raw) {
                        self.grant_write(&thread, pos);
                        return Ok(());
                    }
                    self.retract_writer();
                    return Err(SyncError::Timeout);
                }
                WakeOutcome::Interrupted if !spec.resumes() => {
                    self.retract_writer();
                    return Err(SyncError::Interrupted);
                }
                WakeOutcome::Woke | WakeOutcome::Interrupted => {}
            }
        }
    }

    fn try_claim_write(&self, raw: u64) -> bool {
        let s = self.state.load(Ordering::Acquire);
        direction(s) == Direction::Write
            && self
                .writer
                .compare_exchange(0, raw, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    fn grant_write(&self, thread: &Arc<lockval::thread::ThreadInfo>, pos: SrcPos) {
        self.write_recursions.store(1, Ordering::Relaxed);
        self.writer_reads.store(0, Ordering::Relaxed);
        if let Some(rec) = &self.write_record {
            rec.set_owner(thread, pos);
        }
    }

    /// Takes one queued writer back out, flipping the direction to the
    /// readers when it was the last one and nobody claimed the lock.
    fn retract_writer(&self) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(writers(s) > 0);
            let mut ns = s - ONE_WRITER;
            let mut wake = false;
            if writers(ns) == 0
                && direction(ns) == Direction::Write
                && self.writer.load(Ordering::Acquire) == 0
            {
                ns &= !DIR_MASK;
                wake = readers(ns) > 0;
            }
            match self
                .state
                .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wake {
                        self.broadcast_readers();
                    }
                    return;
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Releases one write acquisition.
    ///
    /// The final release fails with [`SyncError::WrongReleaseOrder`] while
    /// recursive reads of the writer are still outstanding.
    pub fn release_write(&self) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::InvalidHandle);
        }
        let thread = lockval::thread::current();
        if self.writer.load(Ordering::Acquire) != thread.id().raw() {
            return Err(SyncError::NotOwner);
        }

        let depth = self.write_recursions.load(Ordering::Relaxed);
        if depth <= 1 && self.writer_reads.load(Ordering::Relaxed) > 0 {
            return Err(SyncError::WrongReleaseOrder);
        }

        if let Some(rec) = &self.write_record {
            if depth > 1 {
                rec.leave_recursion(&thread)?;
            } else {
                rec.release_owner(&thread)?;
            }
        }

        if depth > 1 {
            self.write_recursions.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.write_recursions.store(0, Ordering::Relaxed);
        self.writer.store(0, Ordering::Release);

        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(writers(s) > 0);
            debug_assert!(direction(s) == Direction::Write);
            let mut ns = s - ONE_WRITER;
            let wake = if writers(ns) > 0 {
                WakeSide::OneWriter
            } else if readers(ns) > 0 {
                ns &= !DIR_MASK;
                WakeSide::AllReaders
            } else {
                ns &= !DIR_MASK;
                WakeSide::Nobody
            };
            match self
                .state
                .compare_exchange_weak(s, ns, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    match wake {
                        WakeSide::OneWriter => self.signal_writer(),
                        WakeSide::AllReaders => self.broadcast_readers(),
                        WakeSide::Nobody => {}
                    }
                    return Ok(());
                }
                Err(actual) => s = actual,
            }
        }
    }

    // ----- queries and management -----

    /// The current direction of the lock.
    pub fn direction(&self) -> Direction {
        direction(self.state.load(Ordering::Acquire))
    }

    /// The number of threads currently admitted for reading.
    pub fn read_count(&self) -> u32 {
        let s = self.state.load(Ordering::Acquire);
        readers(s).saturating_sub(waiting_readers(s)) as u32
    }

    /// The write recursion depth of the current writer; zero when the
    /// write side is free.
    pub fn write_recursion(&self) -> u32 {
        self.write_recursions.load(Ordering::Relaxed)
    }

    /// The number of recursive read acquisitions by the current writer.
    pub fn writer_read_recursion(&self) -> u32 {
        self.writer_reads.load(Ordering::Relaxed)
    }

    /// Whether the calling thread holds the write side.
    pub fn is_write_owner(&self) -> bool {
        self.writer.load(Ordering::Acquire) == lockval::current_thread_id().raw()
    }

    /// Whether the calling thread holds the read side.
    ///
    /// Without validation the reader identities are unknown; `wanna_hear`
    /// is returned in that case, so assertions can pick their polarity.
    pub fn is_read_owner(&self, wanna_hear: bool) -> bool {
        let thread = lockval::thread::current();
        if self.writer.load(Ordering::Acquire) == thread.id().raw() {
            return self.writer_reads.load(Ordering::Relaxed) > 0;
        }
        match &self.read_record {
            Some(rec) if rec.is_alive() && lockval::is_enabled() => rec.is_owner(thread.id()),
            _ => wanna_hear,
        }
    }

    /// The current validator sub-class, if the lock is validated.
    pub fn sub_class(&self) -> Option<SubClass> {
        self.write_record.as_ref().map(|rec| rec.sub_class())
    }

    /// Rebinds the validator sub-class of both sides, returning the
    /// previous value of the writer side.
    pub fn set_sub_class(&self, sub_class: SubClass) -> SyncResult<SubClass> {
        let (Some(write_record), Some(read_record)) = (&self.write_record, &self.read_record)
        else {
            return Err(SyncError::InvalidHandle);
        };
        read_record.set_sub_class(sub_class)?;
        write_record.set_sub_class(sub_class)
    }

    /// Destroys the lock.
    ///
    /// Fails with [`SyncError::Busy`] while read or write held. Parked
    /// threads observe [`SyncError::Destroyed`].
    pub fn destroy(&self) -> SyncResult<()> {
        let s = self.state.load(Ordering::Acquire);
        if s & (RD_MASK | WR_MASK) != 0 {
            return Err(SyncError::Busy);
        }
        if self
            .magic
            .compare_exchange(ALIVE, DEAD, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Destroyed);
        }
        if let Some(rec) = &self.write_record {
            rec.kill();
        }
        if let Some(rec) = &self.read_record {
            rec.kill();
        }
        self.rd_waker.wake_all(&self.rd_wake);
        self.wr_waker.wake_all(&self.wr_wake);
        Ok(())
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RwLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("RwLock")
            .field("name", &self.name)
            .field("direction", &direction(s))
            .field("readers", &readers(s))
            .field("writers", &writers(s))
            .field("waiting_readers", &waiting_readers(s))
            .finish_non_exhaustive()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        if let Some(rec) = &self.write_record {
            rec.kill();
        }
        if let Some(rec) = &self.read_record {
            rec.kill();
        }
    }
}

/// Scoped read ownership of a [`RwLock`], released on drop.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl RwLockReadGuard<'_> {
    /// Releases the read side, surfacing any validator verdict.
    pub fn release(self) -> SyncResult<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.lock.release_read()
    }
}

impl Debug for RwLockReadGuard<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockReadGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_read() {
            log::error!("releasing rwlock '{}' for read failed: {}", self.lock.name, err);
        }
    }
}

/// Scoped write ownership of a [`RwLock`], released on drop.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl RwLockWriteGuard<'_> {
    /// Releases the write side, surfacing any validator verdict.
    pub fn release(self) -> SyncResult<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.lock.release_write()
    }
}

impl Debug for RwLockWriteGuard<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockWriteGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_write() {
            log::error!("releasing rwlock '{}' for write failed: {}", self.lock.name, err);
        }
    }
}
