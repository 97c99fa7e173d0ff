//! Order validation and deadlock detection.
//!
//! The hooks in this module are called by the primitives at well defined
//! points: [`check_order`] before anything else, [`check_blocking`]
//! immediately before going to sleep, [`set_owner`]/[`add_owner`] once the
//! lock is actually held, and the release hooks while unwinding. A hook
//! that fails has not mutated any state the caller relies on.
//!
//! [`check_order`]: ExclRecord::check_order
//! [`check_blocking`]: ExclRecord::check_blocking
//! [`set_owner`]: ExclRecord::set_owner
//! [`add_owner`]: ShrdRecord::add_owner

use crate::class::{self, PairVerdict};
use crate::error::{SyncError, SyncResult};
use crate::pos::SrcPos;
use crate::record::{ExclRecord, RecordKey, ShrdOwner, ShrdRecord, WaitTarget};
use crate::thread::{self, StackEntry, ThreadInfo};
use std::sync::Arc;

/// Bound on the wait-graph walk. Crossing it aborts the walk and reports
/// no deadlock, keeping pathological graphs cheap.
const MAX_WALK: usize = 32;

/// Renders a violation and optionally requests a panic, per the global
/// policy flags.
fn complain(err: SyncError, thread: &ThreadInfo, what: &str, pos: SrcPos) {
    if !crate::is_quiet() {
        log::error!(
            "lock validator: {} on '{}' by {} ({}) at {}, {} lock(s) held",
            err.name(),
            what,
            thread.id(),
            thread.name(),
            pos,
            thread.held_count(),
        );
    }
    if crate::may_panic() {
        panic!("lock validator: {} on '{}'", err.name(), what);
    }
}

/// Clears the waiting-on slot of a blocked thread once it wakes.
///
/// Returned by the blocking checks; the primitive holds it across the
/// Waker wait so the detector can see the thread in the wait graph, and
/// drops it on wakeup so stale chains terminate.
#[derive(Debug)]
#[must_use = "dropping the guard immediately unpublishes the wait edge"]
pub struct BlockGuard {
    thread: Option<Arc<ThreadInfo>>,
}

impl BlockGuard {
    fn inactive() -> Self {
        Self { thread: None }
    }

    fn install(thread: &Arc<ThreadInfo>, target: WaitTarget) -> Self {
        thread.set_waiting_on(target);
        Self {
            thread: Some(thread.clone()),
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.clear_waiting_on();
        }
    }
}

/// The owner threads a wait-graph edge leads to.
///
/// An unowned exclusive record with a shared sibling is crossed into the
/// sibling's reader list; this is how a reader-held R/W lock shows up when
/// a writer blocks on it.
fn owners_of(target: &WaitTarget) -> Vec<(thread::ThreadId, bool)> {
    match target {
        WaitTarget::Excl(rec) => match rec.owner() {
            Some(owner) => vec![(owner, false)],
            None => rec
                .sibling()
                .map(|sib| sib.owner_threads().into_iter().map(|t| (t, true)).collect())
                .unwrap_or_default(),
        },
        WaitTarget::Shrd(rec) => rec
            .owner_threads()
            .into_iter()
            .map(|t| (t, false))
            .collect(),
    }
}

/// Walks the wait graph from `start`, looking for a cycle through the
/// calling thread.
///
/// Returns `None` when no deadlock was found, which is also the verdict
/// when the walk crosses [`MAX_WALK`] records or meets a thread whose
/// waiting-on slot is already stale.
fn find_cycle(self_thread: &ThreadInfo, start: &WaitTarget) -> Option<SyncError> {
    let mut walk = Walk {
        self_id: self_thread.id(),
        visited: vec![start.key()],
        overflowed: false,
    };
    let verdict = walk.target(start, 0);
    if walk.overflowed {
        None
    } else {
        verdict
    }
}

struct Walk {
    self_id: thread::ThreadId,
    visited: Vec<RecordKey>,
    overflowed: bool,
}

impl Walk {
    /// Verdict for blocking on `target`.
    ///
    /// A signaller record is unblocked by any one permitted thread, so it
    /// only deadlocks when every signaller is caught in a cycle. Every
    /// other record deadlocks as soon as one of its owners is.
    fn target(&mut self, target: &WaitTarget, depth: usize) -> Option<SyncError> {
        let owners = owners_of(target);
        if owners.is_empty() {
            return None;
        }
        let need_all =
            matches!(target, WaitTarget::Shrd(rec) if rec.signalling_restricted());

        let mut first = None;
        for (owner, via_sibling) in owners {
            let verdict = self.owner(owner, via_sibling, depth);
            if self.overflowed {
                return None;
            }
            match verdict {
                Some(err) => {
                    if !need_all {
                        return Some(err);
                    }
                    first.get_or_insert(err);
                }
                None => {
                    if need_all {
                        return None;
                    }
                }
            }
        }
        first
    }

    /// Verdict for one owner edge.
    fn owner(
        &mut self,
        owner: thread::ThreadId,
        via_sibling: bool,
        depth: usize,
    ) -> Option<SyncError> {
        if owner == self.self_id {
            // A cycle of length one through our own reader side is the
            // degenerate read-to-write upgrade.
            return Some(if depth == 0 && via_sibling {
                SyncError::IllegalUpgrade
            } else {
                SyncError::Deadlock
            });
        }

        let info = thread::lookup(owner)?;
        // A stale slot means the thread already unblocked.
        let next = info.waiting_on()?;
        if self.visited.contains(&next.key()) {
            return None;
        }
        if self.visited.len() >= MAX_WALK {
            self.overflowed = true;
            return None;
        }
        self.visited.push(next.key());
        self.target(&next, depth + 1)
    }
}

/// Validates class precedence and sub-class ordering for acquiring
/// `target` against the thread's held-lock stack.
fn order_check(
    thread: &Arc<ThreadInfo>,
    target: &WaitTarget,
    sibling_key: Option<RecordKey>,
    pos: SrcPos,
) -> SyncResult<()> {
    let Some(new_class) = target.class() else {
        // Classless locks only track ownership.
        return Ok(());
    };
    let new_key = target.key();
    let new_sub = target.sub_class();

    for entry in thread.held_entries() {
        let key = entry.key();
        // Recursions and the partner side of the same lock are exempt; the
        // latter is judged by the blocking check instead.
        if key == new_key || Some(key) == sibling_key {
            continue;
        }
        let Some(held_class) = entry.target.class() else {
            continue;
        };

        if held_class.id() == new_class.id() {
            if !entry.target.sub_class().allows_after(new_sub) {
                complain(SyncError::WrongOrder, thread, target.name(), pos);
                return Err(SyncError::WrongOrder);
            }
        } else if class::check_pair(held_class, new_class) == PairVerdict::Conflict {
            complain(SyncError::WrongOrder, thread, target.name(), pos);
            return Err(SyncError::WrongOrder);
        }
    }
    Ok(())
}

/// Learns class precedence from a successful acquisition and pushes the
/// stack entry.
fn commit_acquisition(thread: &Arc<ThreadInfo>, target: WaitTarget, pos: SrcPos) {
    if let Some(new_class) = target.class() {
        let new_key = target.key();
        for entry in thread.held_entries() {
            if entry.key() == new_key {
                continue;
            }
            if let Some(held_class) = entry.target.class() {
                if held_class.id() != new_class.id() {
                    class::learn_pair(held_class, new_class);
                }
            }
        }
    }
    thread.push_entry(StackEntry { target, pos });
}

/// Verifies reverse-acquisition-order release for strict classes.
///
/// Called before any release bookkeeping so a refusal leaves the stack and
/// the record untouched.
fn strict_release_check(
    thread: &Arc<ThreadInfo>,
    target: &WaitTarget,
    pos: SrcPos,
) -> SyncResult<()> {
    let strict = target
        .class()
        .is_some_and(|class| class.enforces_strict_release_order());
    if strict && !thread.top_is(target.key()) {
        complain(SyncError::WrongReleaseOrder, thread, target.name(), pos);
        return Err(SyncError::WrongReleaseOrder);
    }
    Ok(())
}

impl ExclRecord {
    /// Validates that acquiring this lock respects the established locking
    /// order. Called before any state mutation or blocking.
    pub fn check_order(self: &Arc<Self>, thread: &Arc<ThreadInfo>, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if !self.validation_active() {
            return Ok(());
        }
        let sibling_key = self.sibling().map(|sib| sib.key());
        order_check(thread, &WaitTarget::Excl(self.clone()), sibling_key, pos)
    }

    /// Publishes the wait edge and searches the wait graph for a cycle.
    /// Called immediately before going to sleep on the lock.
    ///
    /// On success the returned guard keeps the edge visible until dropped.
    pub fn check_blocking(
        self: &Arc<Self>,
        thread: &Arc<ThreadInfo>,
        pos: SrcPos,
    ) -> SyncResult<BlockGuard> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if !self.validation_active() {
            return Ok(BlockGuard::inactive());
        }

        let target = WaitTarget::Excl(self.clone());
        if let Some(err) = find_cycle(thread, &target) {
            complain(err, thread, self.name(), pos);
            return Err(err);
        }
        Ok(BlockGuard::install(thread, target))
    }

    /// Records the first acquisition by `thread`.
    pub fn set_owner(self: &Arc<Self>, thread: &Arc<ThreadInfo>, pos: SrcPos) {
        self.store_owner(thread.id(), pos);
        if self.validation_active() {
            commit_acquisition(thread, WaitTarget::Excl(self.clone()), pos);
        }
    }

    /// Records a recursive re-acquisition by the owner.
    pub fn enter_recursion(
        self: &Arc<Self>,
        thread: &Arc<ThreadInfo>,
        pos: SrcPos,
    ) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if self.owner() != Some(thread.id()) {
            return Err(SyncError::NotOwner);
        }
        self.bump_recursion();
        if self.validation_active() {
            thread.push_entry(StackEntry {
                target: WaitTarget::Excl(self.clone()),
                pos,
            });
        }
        Ok(())
    }

    /// Unwinds one recursion level without releasing the lock.
    pub fn leave_recursion(self: &Arc<Self>, thread: &Arc<ThreadInfo>) -> SyncResult<()> {
        if self.owner() != Some(thread.id()) {
            return Err(SyncError::NotOwner);
        }
        if self.validation_active() {
            let target = WaitTarget::Excl(self.clone());
            strict_release_check(thread, &target, self.pos())?;
            thread.remove_entry(self.key());
        }
        self.drop_recursion();
        Ok(())
    }

    /// Records the final release of the lock.
    pub fn release_owner(self: &Arc<Self>, thread: &Arc<ThreadInfo>) -> SyncResult<()> {
        if self.owner() != Some(thread.id()) {
            return Err(SyncError::NotOwner);
        }
        if self.validation_active() {
            let target = WaitTarget::Excl(self.clone());
            strict_release_check(thread, &target, self.pos())?;
            thread.remove_entry(self.key());
        }
        self.drop_recursion();
        Ok(())
    }
}

impl ShrdRecord {
    /// Validates that acquiring the shared side respects the established
    /// locking order.
    pub fn check_order(self: &Arc<Self>, thread: &Arc<ThreadInfo>, pos: SrcPos) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if !self.validation_active() {
            return Ok(());
        }
        let sibling_key = self.sibling().map(|sib| sib.key());
        order_check(thread, &WaitTarget::Shrd(self.clone()), sibling_key, pos)
    }

    /// Publishes the wait edge for a thread about to sleep on the shared
    /// record (an event waiter, typically) and searches for a cycle.
    pub fn check_blocking(
        self: &Arc<Self>,
        thread: &Arc<ThreadInfo>,
        pos: SrcPos,
    ) -> SyncResult<BlockGuard> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if !self.validation_active() {
            return Ok(BlockGuard::inactive());
        }

        let target = WaitTarget::Shrd(self.clone());
        if let Some(err) = find_cycle(thread, &target) {
            complain(err, thread, self.name(), pos);
            return Err(err);
        }
        Ok(BlockGuard::install(thread, target))
    }

    /// Records a shared acquisition (a reader entering), stacking a
    /// recursion when the thread is already on the owner list.
    pub fn add_owner(self: &Arc<Self>, thread: &Arc<ThreadInfo>, pos: SrcPos) {
        let is_recursion = self.with_owners(|owners| {
            match owners.iter_mut().find(|o| o.thread == thread.id()) {
                Some(owner) => {
                    owner.recursion += 1;
                    true
                }
                None => {
                    owners.push(ShrdOwner {
                        thread: thread.id(),
                        pos,
                        recursion: 1,
                    });
                    false
                }
            }
        });

        if self.validation_active() {
            if is_recursion {
                thread.push_entry(StackEntry {
                    target: WaitTarget::Shrd(self.clone()),
                    pos,
                });
            } else {
                commit_acquisition(thread, WaitTarget::Shrd(self.clone()), pos);
            }
        }
    }

    /// Verifies and records a shared release.
    pub fn check_and_release(self: &Arc<Self>, thread: &Arc<ThreadInfo>) -> SyncResult<()> {
        if !self.is_owner(thread.id()) {
            complain(SyncError::NotOwner, thread, self.name(), SrcPos::NONE);
            return Err(SyncError::NotOwner);
        }
        if self.validation_active() {
            let target = WaitTarget::Shrd(self.clone());
            strict_release_check(thread, &target, SrcPos::NONE)?;
            thread.remove_entry(self.key());
        }
        self.with_owners(|owners| {
            if let Some(idx) = owners.iter().position(|o| o.thread == thread.id()) {
                if owners[idx].recursion > 1 {
                    owners[idx].recursion -= 1;
                } else {
                    owners.remove(idx);
                }
            }
        });
        Ok(())
    }

    /// Refuses signalling by threads that are not on the permit list.
    pub fn check_signaller(&self, thread: &Arc<ThreadInfo>) -> SyncResult<()> {
        if !self.is_alive() {
            return Err(SyncError::Destroyed);
        }
        if !self.validation_active() || !self.signalling_restricted() {
            return Ok(());
        }
        if self.is_owner(thread.id()) {
            return Ok(());
        }
        complain(SyncError::NotSignaller, thread, self.name(), SrcPos::NONE);
        Err(SyncError::NotSignaller)
    }
}
