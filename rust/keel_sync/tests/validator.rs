//! End-to-end lock validator scenarios.

mod common;

use keel_sync::{
    lockval, AutoResetEvent, LockClass, Mutex, RwLock, SyncError, WaitSpec, INDEFINITE_WAIT,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn deadlock_between_two_threads() {
    common::init();
    let class_a = LockClass::new("dd2-class-a", true);
    let class_b = LockClass::new("dd2-class-b", true);
    let a = Arc::new(Mutex::builder().name("dd2-a").class(class_a).build().unwrap());
    let b = Arc::new(Mutex::builder().name("dd2-b").class(class_b).build().unwrap());

    b.request(INDEFINITE_WAIT).unwrap();

    let (holding_tx, holding_rx) = crossbeam_channel::bounded(1);
    let first = {
        let (a, b) = (a.clone(), b.clone());
        std::thread::spawn(move || {
            a.request(INDEFINITE_WAIT).unwrap();
            holding_tx.send(()).unwrap();
            // Parks until the main thread backs off `b`; this is the
            // "first thread succeeds on its second acquisition" half.
            b.request(INDEFINITE_WAIT).unwrap();
            b.release().unwrap();
            a.release().unwrap();
        })
    };

    holding_rx.recv().unwrap();
    // Give the helper time to park in `b.request`.
    std::thread::sleep(Duration::from_millis(200));

    // a -> helper -> b -> us: the cycle is detected before blocking.
    assert_eq!(a.request(5_000), Err(SyncError::Deadlock));

    b.release().unwrap();
    first.join().unwrap();

    a.request(1_000).unwrap();
    a.release().unwrap();
}

#[test]
fn read_to_write_upgrade_is_refused() {
    common::init();
    let class = LockClass::new("upgrade-class", true);
    let lock = RwLock::builder().name("upgrade").class(class).build().unwrap();

    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.request_write(1_000), Err(SyncError::IllegalUpgrade));
    lock.release_read().unwrap();

    // Without the read held the write side works.
    lock.request_write(1_000).unwrap();
    lock.release_write().unwrap();
}

#[test]
fn locking_order_is_learned() {
    common::init();
    let classes: Vec<_> = (0..4)
        .map(|i| LockClass::new(format!("ord4-class-{i}"), true))
        .collect();
    let locks: Vec<_> = classes
        .iter()
        .enumerate()
        .map(|(i, class)| {
            Mutex::builder()
                .name(format!("ord4-m{i}"))
                .class(class.clone())
                .build()
                .unwrap()
        })
        .collect();

    // Teach the validator the order m0 < m1 < m2 < m3.
    for lock in &locks {
        lock.request(INDEFINITE_WAIT).unwrap();
    }
    for lock in locks.iter().rev() {
        lock.release().unwrap();
    }

    // A single lock out of context is fine.
    locks[1].request(INDEFINITE_WAIT).unwrap();
    locks[1].release().unwrap();

    // Climbing down the learned order is not.
    locks[3].request(INDEFINITE_WAIT).unwrap();
    assert_eq!(locks[1].request(1_000), Err(SyncError::WrongOrder));
    locks[3].release().unwrap();

    // Recursion stays exempt.
    for lock in &locks {
        lock.request(INDEFINITE_WAIT).unwrap();
    }
    locks[0].request(INDEFINITE_WAIT).unwrap();
    locks[0].release().unwrap();
    for lock in locks.iter().rev() {
        lock.release().unwrap();
    }
}

#[test]
fn strict_release_order() {
    common::init();
    let classes: Vec<_> = (0..4)
        .map(|i| LockClass::new(format!("strict-class-{i}"), true))
        .collect();
    classes[2].set_strict_release_order(true);
    let locks: Vec<_> = classes
        .iter()
        .enumerate()
        .map(|(i, class)| {
            Mutex::builder()
                .name(format!("strict-m{i}"))
                .class(class.clone())
                .build()
                .unwrap()
        })
        .collect();

    for lock in &locks {
        lock.request(INDEFINITE_WAIT).unwrap();
    }

    // m2's class demands reverse acquisition order.
    assert_eq!(locks[2].release(), Err(SyncError::WrongReleaseOrder));
    assert!(locks[2].is_owned_by_current());

    for lock in locks.iter().rev() {
        lock.release().unwrap();
    }
}

#[test]
fn only_registered_signallers_may_signal() {
    common::init();
    let ev = Arc::new(AutoResetEvent::builder().name("signaller-ev").build_auto().unwrap());

    let (id_tx, id_rx) = crossbeam_channel::bounded(1);
    let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(1);
    let waiter = {
        let ev = ev.clone();
        std::thread::spawn(move || {
            id_tx.send(lockval::current_thread_id()).unwrap();
            go_rx.recv().unwrap();
            ev.wait(5_000)
        })
    };
    let waiter_id = id_rx.recv().unwrap();

    ev.set_signaller(waiter_id).unwrap();
    assert_eq!(ev.signal(), Err(SyncError::NotSignaller));

    ev.add_signaller(lockval::current_thread_id()).unwrap();
    ev.signal().unwrap();

    go_tx.send(()).unwrap();
    waiter.join().unwrap().unwrap();

    // Removal keeps the check armed.
    ev.remove_signaller(lockval::current_thread_id()).unwrap();
    assert_eq!(ev.signal(), Err(SyncError::NotSignaller));
}

#[test]
fn timeouts_are_precise() {
    common::init();
    let m = Arc::new(Mutex::new());
    let (held_tx, held_rx) = crossbeam_channel::bounded(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

    let holder = {
        let m = m.clone();
        std::thread::spawn(move || {
            m.request(INDEFINITE_WAIT).unwrap();
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            m.release().unwrap();
        })
    };
    held_rx.recv().unwrap();

    let started = Instant::now();
    assert_eq!(
        m.request_ex(WaitSpec::RELATIVE_MILLIS, 50),
        Err(SyncError::Timeout)
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "woke late: {elapsed:?}");

    done_tx.send(()).unwrap();
    holder.join().unwrap();
}

#[test]
fn waiters_survive_destruction() {
    common::init();
    let ev = Arc::new(AutoResetEvent::new());
    let waiter = {
        let ev = ev.clone();
        std::thread::spawn(move || ev.wait(10_000))
    };

    std::thread::sleep(Duration::from_millis(100));
    ev.destroy().unwrap();
    assert_eq!(waiter.join().unwrap(), Err(SyncError::Destroyed));
}

#[test]
fn disabled_validation_skips_the_checks() {
    common::init();
    let class = LockClass::new("disabled-class", true);
    class.set_validation_enabled(false);
    let lock = RwLock::builder()
        .name("disabled-upgrade")
        .class(class)
        .build()
        .unwrap();

    // The very pattern refused in `read_to_write_upgrade_is_refused` now
    // times out like a plain contended lock.
    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.request_write(50), Err(SyncError::Timeout));
    lock.release_read().unwrap();
}

#[test]
fn declared_order_without_learning() {
    common::init();
    // Non-auto-didact classes only accept declared priors.
    let lo = LockClass::new("decl-lo", false);
    let hi = LockClass::new("decl-hi", false);
    hi.add_prior(&lo).unwrap();

    let m_lo = Mutex::builder().name("decl-m-lo").class(lo).build().unwrap();
    let m_hi = Mutex::builder().name("decl-m-hi").class(hi).build().unwrap();

    m_lo.request(INDEFINITE_WAIT).unwrap();
    m_hi.request(INDEFINITE_WAIT).unwrap();
    m_hi.release().unwrap();
    m_lo.release().unwrap();

    m_hi.request(INDEFINITE_WAIT).unwrap();
    assert_eq!(m_lo.request(1_000), Err(SyncError::WrongOrder));
    m_hi.release().unwrap();
}
