use crate::common;
use keel_sync::{AutoResetEvent, ManualResetEvent, SyncError, INDEFINITE_WAIT};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn auto_signal_then_wait() {
    common::init();
    let ev = AutoResetEvent::new();
    ev.signal().unwrap();
    ev.wait(INDEFINITE_WAIT).unwrap();
    // The permit was consumed.
    assert_eq!(ev.wait(0), Err(SyncError::Timeout));
}

#[test]
fn auto_wait_times_out() {
    common::init();
    let ev = AutoResetEvent::new();
    assert_eq!(ev.wait(0), Err(SyncError::Timeout));
    assert_eq!(ev.wait(30), Err(SyncError::Timeout));
}

#[test]
fn auto_signal_releases_one_waiter() {
    common::init();
    let ev = Arc::new(AutoResetEvent::new());

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait(600))
        })
        .collect();

    // Give both a chance to park, then post a single permit.
    std::thread::sleep(Duration::from_millis(100));
    ev.signal().unwrap();

    let results: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
    let woken = results.iter().filter(|r| r.is_ok()).count();
    let timed_out = results
        .iter()
        .filter(|r| **r == Err(SyncError::Timeout))
        .count();
    assert_eq!(woken, 1);
    assert_eq!(timed_out, 1);
}

#[test]
fn auto_ping_pong() {
    common::init();
    const ROUNDS: u32 = 200;
    let ping = Arc::new(AutoResetEvent::new());
    let pong = Arc::new(AutoResetEvent::new());

    let peer = {
        let (ping, pong) = (ping.clone(), pong.clone());
        std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                ping.wait(INDEFINITE_WAIT).unwrap();
                pong.signal().unwrap();
            }
        })
    };

    for _ in 0..ROUNDS {
        ping.signal().unwrap();
        pong.wait(INDEFINITE_WAIT).unwrap();
    }
    peer.join().unwrap();
}

#[test]
fn auto_destruction_unblocks_waiters() {
    common::init();
    let ev = Arc::new(AutoResetEvent::new());

    let waiter = {
        let ev = ev.clone();
        std::thread::spawn(move || ev.wait(10_000))
    };

    std::thread::sleep(Duration::from_millis(100));
    ev.destroy().unwrap();
    assert_eq!(waiter.join().unwrap(), Err(SyncError::Destroyed));
    assert_eq!(ev.wait(0), Err(SyncError::InvalidHandle));
}

#[test]
fn manual_broadcast_releases_everyone() {
    common::init();
    let ev = Arc::new(ManualResetEvent::new());

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait(5_000))
        })
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    ev.signal().unwrap();
    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }

    // Sticky until reset.
    ev.wait(0).unwrap();
    ev.wait(INDEFINITE_WAIT).unwrap();
    assert_eq!(ev.signal_serial(), 1);
}

#[test]
fn manual_reset_rearms_the_event() {
    common::init();
    let ev = ManualResetEvent::new();

    ev.signal().unwrap();
    ev.wait(0).unwrap();

    ev.reset().unwrap();
    assert_eq!(ev.wait(0), Err(SyncError::Timeout));
    assert_eq!(ev.wait(30), Err(SyncError::Timeout));

    ev.signal().unwrap();
    ev.wait(0).unwrap();
    assert_eq!(ev.signal_serial(), 2);
}

#[test]
fn manual_signal_races_the_deadline() {
    common::init();
    let ev = Arc::new(ManualResetEvent::new());

    let waiter = {
        let ev = ev.clone();
        std::thread::spawn(move || ev.wait(150))
    };
    std::thread::sleep(Duration::from_millis(50));
    ev.signal().unwrap();
    waiter.join().unwrap().unwrap();
}
