//! Thread identities and per-thread validator state.
//!
//! Every thread that enters the validator gets a [`ThreadInfo`] descriptor
//! holding its held-lock stack and its "waiting on" slot. Threads that were
//! never registered explicitly are adopted on the fly the first time they
//! touch a validated primitive.

use crate::record::{RecordKey, WaitTarget};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A process-unique thread identity.
///
/// Identities are assigned on adoption and never reused within the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    /// The raw numeric identity, suitable for storing in an atomic owner
    /// field. Zero is never a valid identity.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }

    /// Reconstructs an identity from a raw owner field.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// One entry of a thread's held-lock stack.
#[derive(Debug, Clone)]
pub(crate) struct StackEntry {
    /// The record this entry was pushed for.
    pub target: WaitTarget,
    /// Position of the acquisition.
    pub pos: crate::pos::SrcPos,
}

impl StackEntry {
    #[inline]
    pub fn key(&self) -> RecordKey {
        self.target.key()
    }
}

/// Per-thread validator descriptor.
///
/// The held-lock stack is only mutated by the thread itself; the waiting-on
/// slot is written by the thread and read by the deadlock detector running
/// on other threads.
#[derive(Debug)]
pub struct ThreadInfo {
    id: ThreadId,
    name: String,
    waiting_on: Mutex<Option<WaitTarget>>,
    stack: Mutex<Vec<StackEntry>>,
}

impl ThreadInfo {
    fn new(id: ThreadId, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            waiting_on: Mutex::new(None),
            stack: Mutex::new(Vec::new()),
        })
    }

    /// The identity of the thread.
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The adoption name of the thread.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of held-lock stack entries, recursions included.
    pub fn held_count(&self) -> usize {
        self.stack.lock().len()
    }

    pub(crate) fn set_waiting_on(&self, target: WaitTarget) {
        *self.waiting_on.lock() = Some(target);
    }

    pub(crate) fn clear_waiting_on(&self) {
        *self.waiting_on.lock() = None;
    }

    /// Snapshot of the record the thread is currently blocking on, if any.
    pub(crate) fn waiting_on(&self) -> Option<WaitTarget> {
        self.waiting_on.lock().clone()
    }

    pub(crate) fn push_entry(&self, entry: StackEntry) {
        self.stack.lock().push(entry);
    }

    /// Whether the top of the held-lock stack is the given record.
    pub(crate) fn top_is(&self, key: RecordKey) -> bool {
        self.stack.lock().last().map(StackEntry::key) == Some(key)
    }

    /// Removes the most recent stack entry for the given record.
    ///
    /// Non-strict classes may release out of order, so the entry is searched
    /// from the top down rather than popped blindly.
    pub(crate) fn remove_entry(&self, key: RecordKey) -> bool {
        let mut stack = self.stack.lock();
        match stack.iter().rposition(|e| e.key() == key) {
            Some(idx) => {
                stack.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Clones the held-lock stack for an order check.
    pub(crate) fn held_entries(&self) -> Vec<StackEntry> {
        self.stack.lock().clone()
    }
}

/// Global thread registry, keyed by identity.
///
/// The registry holds weak references; a descriptor lives as long as its
/// thread (or any record/detector walk currently using it).
struct Registry {
    threads: FxHashMap<ThreadId, std::sync::Weak<ThreadInfo>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            threads: FxHashMap::default(),
        })
    })
}

fn next_id() -> ThreadId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let raw = NEXT.fetch_add(1, Ordering::Relaxed);
    // The counter starts at one and the process dies long before u64 wraps.
    ThreadId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
}

/// Deregisters the descriptor when its thread exits.
struct Adoption(Arc<ThreadInfo>);

impl Drop for Adoption {
    fn drop(&mut self) {
        registry().lock().threads.remove(&self.0.id);
    }
}

thread_local! {
    static SELF: RefCell<Option<Adoption>> = const { RefCell::new(None) };
}

/// Returns the calling thread's descriptor, adopting the thread if it has
/// never entered the validator before.
pub fn current() -> Arc<ThreadInfo> {
    SELF.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(adoption) => adoption.0.clone(),
            None => {
                let info = adopt_with_name(
                    std::thread::current()
                        .name()
                        .map_or_else(|| String::from("<adopted>"), String::from),
                );
                *slot = Some(Adoption(info.clone()));
                info
            }
        }
    })
}

/// The identity of the calling thread.
pub fn current_id() -> ThreadId {
    current().id()
}

fn adopt_with_name(name: String) -> Arc<ThreadInfo> {
    let id = next_id();
    let info = ThreadInfo::new(id, name);
    registry().lock().threads.insert(id, Arc::downgrade(&info));
    log::trace!("adopted {} ({:?})", id, info.name());
    info
}

/// Looks up a live descriptor by identity.
///
/// Returns `None` for threads that already exited; the detector treats such
/// owners as unblocked.
pub fn lookup(id: ThreadId) -> Option<Arc<ThreadInfo>> {
    registry().lock().threads.get(&id).and_then(std::sync::Weak::upgrade)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adoption_is_idempotent() {
        let a = current();
        let b = current();
        assert_eq!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn ids_are_distinct_across_threads() {
        let here = current_id();
        let there = std::thread::spawn(current_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn exited_threads_drop_out_of_the_registry() {
        let id = std::thread::spawn(current_id).join().unwrap();
        // The registry entry dies with the thread.
        assert!(lookup(id).is_none());
        assert!(lookup(current_id()).is_some());
    }
}
