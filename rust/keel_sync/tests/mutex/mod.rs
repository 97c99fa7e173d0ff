use crate::common;
use keel_sync::{Mutex, SyncError, INDEFINITE_WAIT};
use std::cell::Cell;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn smoke() {
    common::init();
    let m = Mutex::new();
    m.request(INDEFINITE_WAIT).unwrap();
    assert!(m.is_owned_by_current());
    assert_eq!(m.recursion_depth(), 1);
    m.release().unwrap();
    assert!(!m.is_owned());
}

#[test]
fn guard_releases_on_drop() {
    common::init();
    let m = Mutex::new();
    {
        let guard = m.acquire().unwrap();
        assert!(m.is_owned_by_current());
        drop(guard);
    }
    assert!(!m.is_owned());

    let guard = m.acquire().unwrap();
    guard.release().unwrap();
    assert!(!m.is_owned());
}

#[test]
fn recursion_is_balanced() {
    common::init();
    let m = Mutex::new();
    m.request(INDEFINITE_WAIT).unwrap();
    m.request(INDEFINITE_WAIT).unwrap();
    m.request(INDEFINITE_WAIT).unwrap();
    assert_eq!(m.recursion_depth(), 3);

    m.release().unwrap();
    assert_eq!(m.recursion_depth(), 2);
    assert!(m.is_owned_by_current());
    m.release().unwrap();
    m.release().unwrap();
    assert!(!m.is_owned());
    assert_eq!(m.recursion_depth(), 0);
}

#[test]
fn release_requires_ownership() {
    common::init();
    let m = Mutex::new();
    assert_eq!(m.release(), Err(SyncError::NotOwner));
}

#[test]
fn holder_blocks_polls_and_timed_requests() {
    common::init();
    let m = Arc::new(Mutex::new());
    let (held_tx, held_rx) = channel();
    let (done_tx, done_rx) = channel::<()>();

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
    assert_eq!(m.try_request(), Err(SyncError::Timeout));

    let started = Instant::now();
    assert_eq!(m.request(40), Err(SyncError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(40));

    done_tx.send(()).unwrap();
    holder.join().unwrap();

    m.try_request().unwrap();
    m.release().unwrap();
}

struct Counter {
    lock: Mutex,
    // Only read and written while `lock` is held.
    value: Cell<u64>,
}

// SAFETY: All access to `value` happens under `lock`.
unsafe impl Send for Counter {}
// SAFETY: See above.
unsafe impl Sync for Counter {}

#[test]
fn contended_increments_do_not_race() {
    common::init();
    const THREADS: u64 = 8;
    const ITERS: u64 = 2000;

    let counter = Arc::new(Counter {
        lock: Mutex::new(),
        value: Cell::new(0),
    });

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..ITERS {
                    counter.lock.request(INDEFINITE_WAIT).unwrap();
                    counter.value.set(counter.value.get() + 1);
                    counter.lock.release().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    counter.lock.request(INDEFINITE_WAIT).unwrap();
    assert_eq!(counter.value.get(), THREADS * ITERS);
    counter.lock.release().unwrap();
}

#[test]
fn destruction_lifecycle() {
    common::init();
    let m = Mutex::new();

    m.request(INDEFINITE_WAIT).unwrap();
    assert_eq!(m.destroy(), Err(SyncError::Busy));
    m.release().unwrap();

    m.destroy().unwrap();
    assert_eq!(m.request(0), Err(SyncError::InvalidHandle));
    assert_eq!(m.release(), Err(SyncError::InvalidHandle));
    assert_eq!(m.destroy(), Err(SyncError::Destroyed));
}
