//! Lock classes and the learned locking-order graph.
//!
//! A class is an equivalence set of locks sharing precedence rules. The
//! order graph over classes is guarded by a single global mutex; per-class
//! data is guarded by the class's own lock, and graph operations only ever
//! hold one class lock at a time underneath the graph lock.

use crate::error::{SyncError, SyncResult};
use crate::pos::SrcPos;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A shared handle to a lock class.
///
/// The strong count is the class retain count: one reference per record plus
/// transient references held by in-flight acquisitions. The class dies when
/// the count drops to zero.
pub type ClassHandle = Arc<LockClass>;

/// Process-unique class identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u64);

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "class-{}", self.0)
    }
}

/// A sub-class ordinal, interpreted relative to a class.
///
/// `NONE` sorts below every other sub-class and forbids acquiring any other
/// lock of the same class while held. `ANY` is compatible with everything.
/// User values start at [`SubClass::USER_BASE`] and must be acquired in
/// strictly increasing order within a class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubClass(u32);

impl SubClass {
    /// Sorts below all other sub-classes of the class.
    pub const NONE: SubClass = SubClass(0);
    /// Compatible with every other sub-class of the class.
    pub const ANY: SubClass = SubClass(1);
    /// First value available to users.
    pub const USER_BASE: u32 = 16;

    /// The user sub-class with the given ordinal.
    #[inline]
    pub const fn user(ordinal: u32) -> Self {
        Self(Self::USER_BASE.saturating_add(ordinal))
    }

    /// Reconstructs a sub-class from its raw representation.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw representation.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the value is a sentinel or a user ordinal, as opposed to one
    /// of the reserved values between the two ranges.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 <= Self::ANY.0 || self.0 >= Self::USER_BASE
    }

    /// Whether a lock with sub-class `next` may be acquired while one with
    /// `self` (same class) is held.
    #[inline]
    pub(crate) const fn allows_after(self, next: Self) -> bool {
        if self.0 == Self::ANY.0 || next.0 == Self::ANY.0 {
            return true;
        }
        // NONE below everything, including another NONE.
        if self.0 == Self::NONE.0 || next.0 == Self::NONE.0 {
            return false;
        }
        self.0 < next.0
    }
}

#[derive(Debug, Default)]
struct ClassInner {
    /// Classes that may be held when a lock of this class is acquired.
    priors: FxHashSet<ClassId>,
    /// Observed successor statistics: how often a lock of the keyed class
    /// was acquired while a lock of this class was held.
    successors: FxHashMap<ClassId, u64>,
    /// Partner class of a reader/writer record pair.
    sibling: Option<Weak<LockClass>>,
}

/// An equivalence class of locks sharing precedence rules.
pub struct LockClass {
    id: ClassId,
    name: String,
    created_at: SrcPos,
    autodidact: bool,
    strict_release_order: AtomicBool,
    validation_enabled: AtomicBool,
    inner: Mutex<ClassInner>,
}

impl LockClass {
    /// Creates a fresh class.
    ///
    /// Auto-didact classes learn precedence from successful acquisitions;
    /// non-auto-didact classes only accept orders declared via
    /// [`add_prior`](LockClass::add_prior).
    #[track_caller]
    pub fn new(name: impl Into<String>, autodidact: bool) -> ClassHandle {
        Self::new_at(name.into(), autodidact, SrcPos::here())
    }

    fn new_at(name: String, autodidact: bool, created_at: SrcPos) -> ClassHandle {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        let class = Arc::new(Self {
            id: ClassId(NEXT.fetch_add(1, Ordering::Relaxed)),
            name,
            created_at,
            autodidact,
            strict_release_order: AtomicBool::new(false),
            validation_enabled: AtomicBool::new(true),
            inner: Mutex::new(ClassInner::default()),
        });
        registry()
            .lock()
            .by_id
            .insert(class.id, Arc::downgrade(&class));
        class
    }

    /// Returns the class associated with a source position, creating it on
    /// first use.
    ///
    /// This makes `static` locks transparent: every creation site gets a
    /// stable class without declaring one. Cached classes are auto-didact
    /// and live for the rest of the process.
    pub fn for_src_pos(pos: SrcPos, name: Option<&str>) -> ClassHandle {
        if let Some(class) = registry().lock().by_pos.get(&pos) {
            return class.clone();
        }

        let class = Self::new_at(
            name.map_or_else(|| pos.to_string(), String::from),
            true,
            pos,
        );
        registry()
            .lock()
            .by_pos
            .entry(pos)
            .or_insert(class)
            .clone()
    }

    /// The identity of the class.
    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// The human readable name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the class was created.
    #[inline]
    pub fn created_at(&self) -> SrcPos {
        self.created_at
    }

    /// Whether the class learns precedence from observed acquisitions.
    #[inline]
    pub fn is_autodidact(&self) -> bool {
        self.autodidact
    }

    /// Whether locks of this class must be released in reverse acquisition
    /// order.
    #[inline]
    pub fn enforces_strict_release_order(&self) -> bool {
        self.strict_release_order.load(Ordering::Relaxed)
    }

    /// Toggles strict release ordering. Returns the previous setting.
    pub fn set_strict_release_order(&self, enabled: bool) -> bool {
        self.strict_release_order.swap(enabled, Ordering::Relaxed)
    }

    /// Whether validator checks run for locks of this class.
    #[inline]
    pub fn is_validation_enabled(&self) -> bool {
        self.validation_enabled.load(Ordering::Relaxed)
    }

    /// Toggles validation for the class. Returns the previous setting.
    pub fn set_validation_enabled(&self, enabled: bool) -> bool {
        self.validation_enabled.swap(enabled, Ordering::Relaxed)
    }

    /// Declares that `before` may be held when a lock of this class is
    /// acquired.
    ///
    /// Fails with [`SyncError::WrongOrder`] if the declaration would close a
    /// cycle in the order graph.
    pub fn add_prior(self: &Arc<Self>, before: &ClassHandle) -> SyncResult<()> {
        if before.id == self.id {
            return Err(SyncError::InvalidParameter);
        }

        let _graph = graph_lock().lock();
        if reachable_via_priors(before.id, self.id) {
            return Err(SyncError::WrongOrder);
        }
        self.inner.lock().priors.insert(before.id);
        Ok(())
    }

    /// Whether `before` is allowed (directly or transitively) to be held
    /// when a lock of this class is acquired.
    pub fn is_prior(&self, before: &LockClass) -> bool {
        let _graph = graph_lock().lock();
        reachable_via_priors(self.id, before.id)
    }

    /// Records an observed acquisition of `next` while a lock of this class
    /// was held, for diagnostics.
    pub(crate) fn note_successor(&self, next: ClassId) {
        *self.inner.lock().successors.entry(next).or_insert(0) += 1;
    }

    /// Snapshot of the observed successor statistics.
    pub fn observed_successors(&self) -> Vec<(ClassId, u64)> {
        let inner = self.inner.lock();
        let mut stats: Vec<_> = inner.successors.iter().map(|(&id, &n)| (id, n)).collect();
        stats.sort_unstable();
        stats
    }

    /// Links two classes as a reader/writer pair.
    pub fn set_sibling(self: &Arc<Self>, other: &ClassHandle) {
        self.inner.lock().sibling = Some(Arc::downgrade(other));
        other.inner.lock().sibling = Some(Arc::downgrade(self));
    }

    /// The partner class, if the class is part of a reader/writer pair.
    pub fn sibling(&self) -> Option<ClassHandle> {
        self.inner.lock().sibling.as_ref().and_then(Weak::upgrade)
    }
}

impl Debug for LockClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("autodidact", &self.autodidact)
            .finish_non_exhaustive()
    }
}

impl Drop for LockClass {
    fn drop(&mut self) {
        registry().lock().by_id.remove(&self.id);
    }
}

struct Registry {
    by_id: FxHashMap<ClassId, Weak<LockClass>>,
    by_pos: FxHashMap<SrcPos, ClassHandle>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            by_id: FxHashMap::default(),
            by_pos: FxHashMap::default(),
        })
    })
}

/// Serializes all order-graph walks and edge insertions.
fn graph_lock() -> &'static Mutex<()> {
    static GRAPH: OnceLock<Mutex<()>> = OnceLock::new();
    GRAPH.get_or_init(|| Mutex::new(()))
}

/// Whether `wanted` is reachable from `start` by following prior edges,
/// i.e. whether `wanted < start` holds in the learned order.
///
/// Must be called with the graph lock held.
fn reachable_via_priors(start: ClassId, wanted: ClassId) -> bool {
    if start == wanted {
        return true;
    }

    let mut visited = FxHashSet::default();
    let mut frontier = vec![start];
    while let Some(id) = frontier.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(class) = registry().lock().by_id.get(&id).and_then(Weak::upgrade) else {
            continue;
        };
        let priors = class.inner.lock().priors.clone();
        if priors.contains(&wanted) {
            return true;
        }
        frontier.extend(priors);
    }
    false
}

/// Outcome of consulting the order graph for a (held, next) class pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PairVerdict {
    /// The pair is established or learnable.
    Ok,
    /// The reverse order is established; acquiring would invert it.
    Conflict,
}

/// Consults the order graph for acquiring a lock of class `next` while one
/// of class `held` is owned.
///
/// The pair passes when it is already established, and also when it is
/// unknown but both classes are auto-didact (the edge is then learned once
/// the acquisition succeeds, see [`learn_pair`]).
pub(crate) fn check_pair(held: &LockClass, next: &LockClass) -> PairVerdict {
    let _graph = graph_lock().lock();
    if reachable_via_priors(next.id, held.id) {
        return PairVerdict::Ok;
    }
    if reachable_via_priors(held.id, next.id) {
        return PairVerdict::Conflict;
    }
    if held.autodidact && next.autodidact {
        PairVerdict::Ok
    } else {
        PairVerdict::Conflict
    }
}

/// Learns `held < next` from a successful acquisition.
///
/// Racing first-time acquisitions can observe opposite orders before either
/// edge lands; the loser of that race is dropped here so the graph stays
/// acyclic.
pub(crate) fn learn_pair(held: &ClassHandle, next: &ClassHandle) {
    if held.id == next.id || !(held.autodidact && next.autodidact) {
        return;
    }

    held.note_successor(next.id);

    let _graph = graph_lock().lock();
    if reachable_via_priors(next.id, held.id) {
        return;
    }
    if reachable_via_priors(held.id, next.id) {
        log::warn!(
            "not learning {} < {}: opposite order already observed",
            held.name,
            next.name
        );
        return;
    }
    next.inner.lock().priors.insert(held.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_class_ordering() {
        assert!(SubClass::ANY.allows_after(SubClass::ANY));
        assert!(SubClass::ANY.allows_after(SubClass::NONE));
        assert!(SubClass::user(0).allows_after(SubClass::ANY));

        assert!(!SubClass::NONE.allows_after(SubClass::NONE));
        assert!(!SubClass::NONE.allows_after(SubClass::user(3)));
        assert!(!SubClass::user(3).allows_after(SubClass::NONE));

        assert!(SubClass::user(0).allows_after(SubClass::user(1)));
        assert!(!SubClass::user(1).allows_after(SubClass::user(1)));
        assert!(!SubClass::user(2).allows_after(SubClass::user(1)));
    }

    #[test]
    fn sub_class_reserved_range() {
        assert!(SubClass::NONE.is_valid());
        assert!(SubClass::ANY.is_valid());
        assert!(SubClass::user(0).is_valid());
        assert!(!SubClass::from_raw(7).is_valid());
    }

    #[test]
    fn declared_priors_reject_cycles() {
        let a = LockClass::new("prior-a", false);
        let b = LockClass::new("prior-b", false);
        let c = LockClass::new("prior-c", false);

        b.add_prior(&a).unwrap();
        c.add_prior(&b).unwrap();
        assert!(c.is_prior(&a));

        assert_eq!(a.add_prior(&c), Err(SyncError::WrongOrder));
        assert_eq!(a.add_prior(&a), Err(SyncError::InvalidParameter));
    }

    #[test]
    fn pair_checks_follow_the_graph() {
        let lo = LockClass::new("pair-lo", false);
        let hi = LockClass::new("pair-hi", false);
        hi.add_prior(&lo).unwrap();

        assert_eq!(check_pair(&lo, &hi), PairVerdict::Ok);
        assert_eq!(check_pair(&hi, &lo), PairVerdict::Conflict);
    }

    #[test]
    fn autodidact_pairs_learn_on_success() {
        let a = LockClass::new("learn-a", true);
        let b = LockClass::new("learn-b", true);

        // Unknown pair passes both ways until one direction is learned.
        assert_eq!(check_pair(&a, &b), PairVerdict::Ok);
        assert_eq!(check_pair(&b, &a), PairVerdict::Ok);

        learn_pair(&a, &b);
        assert_eq!(check_pair(&a, &b), PairVerdict::Ok);
        assert_eq!(check_pair(&b, &a), PairVerdict::Conflict);

        // Losing side of a learn race is dropped, not inverted.
        learn_pair(&b, &a);
        assert_eq!(check_pair(&b, &a), PairVerdict::Conflict);
    }

    #[test]
    fn non_autodidact_pairs_must_be_declared() {
        let a = LockClass::new("decl-a", false);
        let b = LockClass::new("decl-b", true);
        assert_eq!(check_pair(&a, &b), PairVerdict::Conflict);
    }

    #[test]
    fn src_pos_classes_are_cached() {
        let pos = SrcPos::here();
        let first = LockClass::for_src_pos(pos, Some("cached"));
        let second = LockClass::for_src_pos(pos, None);
        assert_eq!(first.id(), second.id());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "cached");
    }

    #[test]
    fn successor_stats_accumulate() {
        let a = LockClass::new("stat-a", true);
        let b = LockClass::new("stat-b", true);
        learn_pair(&a, &b);
        learn_pair(&a, &b);
        assert_eq!(a.observed_successors(), vec![(b.id(), 2)]);
    }
}
