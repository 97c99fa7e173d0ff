//! Ownership records attached to the primitives.
//!
//! Exclusive records describe mutexes and the writer side of R/W locks;
//! shared records describe reader sides and event signaller lists. The
//! detector only ever sees records, never the primitives themselves.

use crate::class::{ClassHandle, SubClass};
use crate::error::{SyncError, SyncResult};
use crate::pos::SrcPos;
use crate::thread::ThreadId;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const EXCL_ALIVE: u32 = 0x8f10_4ad1;
const EXCL_DEAD: u32 = !EXCL_ALIVE;
const SHRD_ALIVE: u32 = 0x2e85_63b2;
const SHRD_DEAD: u32 = !SHRD_ALIVE;

/// Identity of a record, used for stack bookkeeping and cycle detection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RecordKey(usize);

/// A reference to either record flavor.
#[derive(Clone)]
pub(crate) enum WaitTarget {
    Excl(Arc<ExclRecord>),
    Shrd(Arc<ShrdRecord>),
}

impl WaitTarget {
    pub fn key(&self) -> RecordKey {
        match self {
            WaitTarget::Excl(rec) => rec.key(),
            WaitTarget::Shrd(rec) => rec.key(),
        }
    }

    pub fn class(&self) -> Option<&ClassHandle> {
        match self {
            WaitTarget::Excl(rec) => rec.class(),
            WaitTarget::Shrd(rec) => rec.class(),
        }
    }

    pub fn sub_class(&self) -> SubClass {
        match self {
            WaitTarget::Excl(rec) => rec.sub_class(),
            WaitTarget::Shrd(rec) => rec.sub_class(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WaitTarget::Excl(rec) => rec.name(),
            WaitTarget::Shrd(rec) => rec.name(),
        }
    }
}

impl Debug for WaitTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitTarget::Excl(rec) => write!(f, "excl:{}", rec.name()),
            WaitTarget::Shrd(rec) => write!(f, "shrd:{}", rec.name()),
        }
    }
}

/// Ownership record of an exclusively held lock.
pub struct ExclRecord {
    magic: AtomicU32,
    /// Raw [`ThreadId`] of the owner, zero when unowned. Written by the
    /// owning thread once the primitive's state word confirms ownership.
    owner: AtomicU64,
    recursion: AtomicU32,
    pos: Mutex<SrcPos>,
    class: Option<ClassHandle>,
    sub_class: AtomicU32,
    enabled: AtomicBool,
    sibling: Mutex<Option<Weak<ShrdRecord>>>,
    name: String,
}

impl ExclRecord {
    /// Creates a record for an unowned lock.
    pub fn new(
        name: impl Into<String>,
        class: Option<ClassHandle>,
        sub_class: SubClass,
        enabled: bool,
    ) -> SyncResult<Arc<Self>> {
        if !sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        Ok(Arc::new(Self {
            magic: AtomicU32::new(EXCL_ALIVE),
            owner: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
            pos: Mutex::new(SrcPos::NONE),
            class,
            sub_class: AtomicU32::new(sub_class.raw()),
            enabled: AtomicBool::new(enabled),
            sibling: Mutex::new(None),
            name: name.into(),
        }))
    }

    pub(crate) fn key(self: &Arc<Self>) -> RecordKey {
        RecordKey(Arc::as_ptr(self) as usize)
    }

    /// The record name (usually the primitive's name).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The class of the lock, if it was created with one.
    #[inline]
    pub fn class(&self) -> Option<&ClassHandle> {
        self.class.as_ref()
    }

    /// The current sub-class.
    #[inline]
    pub fn sub_class(&self) -> SubClass {
        SubClass::from_raw(self.sub_class.load(Ordering::Relaxed))
    }

    /// Rebinds the sub-class, returning the previous value.
    pub fn set_sub_class(&self, sub_class: SubClass) -> SyncResult<SubClass> {
        if !sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        Ok(SubClass::from_raw(
            self.sub_class.swap(sub_class.raw(), Ordering::Relaxed),
        ))
    }

    /// The thread currently recorded as owner.
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// The recorded recursion depth. At least one iff an owner is set.
    #[inline]
    pub fn recursion_depth(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }

    /// Position of the first acquisition by the current owner.
    pub fn pos(&self) -> SrcPos {
        *self.pos.lock()
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == EXCL_ALIVE
    }

    /// Invalidates the record so stale blocked threads observe destruction.
    pub fn kill(&self) {
        self.magic.store(EXCL_DEAD, Ordering::Release);
    }

    /// Whether validator checks should run for this record right now.
    pub(crate) fn validation_active(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
            && crate::is_enabled()
            && self
                .class
                .as_ref()
                .is_none_or(|class| class.is_validation_enabled())
    }

    pub(crate) fn store_owner(&self, thread: ThreadId, pos: SrcPos) {
        *self.pos.lock() = pos;
        self.recursion.store(1, Ordering::Relaxed);
        self.owner.store(thread.raw(), Ordering::Release);
    }

    pub(crate) fn bump_recursion(&self) {
        self.recursion.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one recursion level, returning the remaining depth.
    pub(crate) fn drop_recursion(&self) -> u32 {
        let depth = self.recursion.load(Ordering::Relaxed);
        debug_assert!(depth > 0);
        let depth = depth.saturating_sub(1);
        self.recursion.store(depth, Ordering::Relaxed);
        if depth == 0 {
            self.owner.store(0, Ordering::Release);
        }
        depth
    }

    /// The shared partner record, for reader/writer pairs.
    pub fn sibling(&self) -> Option<Arc<ShrdRecord>> {
        self.sibling.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Debug for ExclRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclRecord")
            .field("name", &self.name)
            .field("owner", &self.owner())
            .field("recursion", &self.recursion_depth())
            .finish_non_exhaustive()
    }
}

/// One registered owner of a shared record.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ShrdOwner {
    pub thread: ThreadId,
    pub pos: SrcPos,
    pub recursion: u32,
}

/// Ownership record of a shared lock side or an event signaller list.
///
/// For reader sides the owner list names the current readers; for events it
/// names the threads permitted to signal. The signaller flavor starts
/// unarmed and only enforces the permit list once a signaller has been
/// registered.
pub struct ShrdRecord {
    magic: AtomicU32,
    class: Option<ClassHandle>,
    sub_class: AtomicU32,
    /// Signaller flavor: the owner list is a signal permit list.
    signaller: bool,
    ever_had_signallers: AtomicBool,
    owners: Mutex<Vec<ShrdOwner>>,
    enabled: AtomicBool,
    sibling: Mutex<Option<Weak<ExclRecord>>>,
    name: String,
}

impl ShrdRecord {
    /// Creates a record with an empty owner list.
    pub fn new(
        name: impl Into<String>,
        class: Option<ClassHandle>,
        sub_class: SubClass,
        signaller: bool,
        enabled: bool,
    ) -> SyncResult<Arc<Self>> {
        if !sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        Ok(Arc::new(Self {
            magic: AtomicU32::new(SHRD_ALIVE),
            class,
            sub_class: AtomicU32::new(sub_class.raw()),
            signaller,
            ever_had_signallers: AtomicBool::new(false),
            owners: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
            sibling: Mutex::new(None),
            name: name.into(),
        }))
    }

    pub(crate) fn key(self: &Arc<Self>) -> RecordKey {
        RecordKey(Arc::as_ptr(self) as usize)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn class(&self) -> Option<&ClassHandle> {
        self.class.as_ref()
    }

    #[inline]
    pub fn sub_class(&self) -> SubClass {
        SubClass::from_raw(self.sub_class.load(Ordering::Relaxed))
    }

    /// Rebinds the sub-class, returning the previous value.
    pub fn set_sub_class(&self, sub_class: SubClass) -> SyncResult<SubClass> {
        if !sub_class.is_valid() {
            return Err(SyncError::InvalidParameter);
        }
        Ok(SubClass::from_raw(
            self.sub_class.swap(sub_class.raw(), Ordering::Relaxed),
        ))
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SHRD_ALIVE
    }

    /// Invalidates the record so stale blocked threads observe destruction.
    pub fn kill(&self) {
        self.magic.store(SHRD_DEAD, Ordering::Release);
    }

    /// Whether the signaller permit list is being enforced.
    #[inline]
    pub fn signalling_restricted(&self) -> bool {
        self.signaller && self.ever_had_signallers.load(Ordering::Acquire)
    }

    pub(crate) fn validation_active(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
            && crate::is_enabled()
            && self
                .class
                .as_ref()
                .is_none_or(|class| class.is_validation_enabled())
    }

    /// The threads currently on the owner list.
    pub fn owner_threads(&self) -> Vec<ThreadId> {
        self.owners.lock().iter().map(|o| o.thread).collect()
    }

    /// Whether the thread is on the owner list.
    pub fn is_owner(&self, thread: ThreadId) -> bool {
        self.owners.lock().iter().any(|o| o.thread == thread)
    }

    pub(crate) fn with_owners<R>(&self, f: impl FnOnce(&mut Vec<ShrdOwner>) -> R) -> R {
        f(&mut self.owners.lock())
    }

    /// Replaces the permit list with the single given thread.
    pub fn set_signaller(&self, thread: ThreadId) {
        let mut owners = self.owners.lock();
        owners.clear();
        owners.push(ShrdOwner {
            thread,
            pos: SrcPos::NONE,
            recursion: 0,
        });
        drop(owners);
        self.ever_had_signallers.store(true, Ordering::Release);
    }

    /// Adds a thread to the permit list.
    pub fn add_signaller(&self, thread: ThreadId) {
        let mut owners = self.owners.lock();
        if !owners.iter().any(|o| o.thread == thread) {
            owners.push(ShrdOwner {
                thread,
                pos: SrcPos::NONE,
                recursion: 0,
            });
        }
        drop(owners);
        self.ever_had_signallers.store(true, Ordering::Release);
    }

    /// Removes a thread from the permit list.
    ///
    /// Checking stays armed even when the list becomes empty; every signal
    /// is then refused until a signaller is registered again.
    pub fn remove_signaller(&self, thread: ThreadId) {
        self.owners.lock().retain(|o| o.thread != thread);
    }

    /// The exclusive partner record, for reader/writer pairs.
    pub fn sibling(&self) -> Option<Arc<ExclRecord>> {
        self.sibling.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Debug for ShrdRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShrdRecord")
            .field("name", &self.name)
            .field("signaller", &self.signaller)
            .field("owners", &self.owner_threads())
            .finish_non_exhaustive()
    }
}

/// Links an exclusive record and a shared record as the two sides of one
/// reader/writer lock. Their classes, when present, are linked as well.
pub fn link_siblings(excl: &Arc<ExclRecord>, shrd: &Arc<ShrdRecord>) {
    *excl.sibling.lock() = Some(Arc::downgrade(shrd));
    *shrd.sibling.lock() = Some(Arc::downgrade(excl));
    if let (Some(wc), Some(rc)) = (&excl.class, &shrd.class) {
        wc.set_sibling(rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread;

    #[test]
    fn excl_owner_roundtrip() {
        let rec = ExclRecord::new("m", None, SubClass::NONE, true).unwrap();
        assert!(rec.owner().is_none());

        let me = thread::current_id();
        rec.store_owner(me, SrcPos::here());
        assert_eq!(rec.owner(), Some(me));
        assert_eq!(rec.recursion_depth(), 1);

        rec.bump_recursion();
        assert_eq!(rec.recursion_depth(), 2);
        assert_eq!(rec.drop_recursion(), 1);
        assert_eq!(rec.drop_recursion(), 0);
        assert!(rec.owner().is_none());
    }

    #[test]
    fn dead_records_report_it() {
        let rec = ExclRecord::new("m", None, SubClass::NONE, true).unwrap();
        assert!(rec.is_alive());
        rec.kill();
        assert!(!rec.is_alive());
    }

    #[test]
    fn signaller_list_arming() {
        let rec = ShrdRecord::new("ev", None, SubClass::ANY, true, true).unwrap();
        assert!(!rec.signalling_restricted());

        let me = thread::current_id();
        rec.set_signaller(me);
        assert!(rec.signalling_restricted());
        assert!(rec.is_owner(me));

        rec.remove_signaller(me);
        assert!(rec.signalling_restricted());
        assert!(!rec.is_owner(me));
    }

    #[test]
    fn invalid_sub_class_is_refused() {
        assert!(matches!(
            ExclRecord::new("m", None, SubClass::from_raw(5), true),
            Err(SyncError::InvalidParameter)
        ));
    }
}
