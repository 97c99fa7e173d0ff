use crate::common;
use keel_sync::{Direction, RwLock, SyncError, INDEFINITE_WAIT};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn smoke() {
    common::init();
    let lock = RwLock::new();

    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.direction(), Direction::Read);
    assert_eq!(lock.read_count(), 1);
    lock.release_read().unwrap();

    lock.request_write(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.direction(), Direction::Write);
    assert!(lock.is_write_owner());
    lock.release_write().unwrap();
    assert!(!lock.is_write_owner());

    drop(lock.acquire_read().unwrap());
    drop(lock.acquire_write().unwrap());
}

#[test]
fn readers_share_the_lock() {
    common::init();
    let lock = Arc::new(RwLock::new());

    // Same-thread read recursion.
    lock.request_read(INDEFINITE_WAIT).unwrap();
    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.read_count(), 2);

    // A second thread joins while we hold the read side.
    let other = {
        let lock = lock.clone();
        std::thread::spawn(move || {
            lock.request_read(500).unwrap();
            let count = lock.read_count();
            lock.release_read().unwrap();
            count
        })
    };
    assert_eq!(other.join().unwrap(), 3);

    lock.release_read().unwrap();
    lock.release_read().unwrap();
    assert_eq!(lock.read_count(), 0);
}

#[test]
fn writer_excludes_everyone() {
    common::init();
    let lock = Arc::new(RwLock::new());
    lock.request_write(INDEFINITE_WAIT).unwrap();

    let contender = {
        let lock = lock.clone();
        std::thread::spawn(move || {
            assert_eq!(lock.try_request_read(), Err(SyncError::Timeout));
            assert_eq!(lock.try_request_write(), Err(SyncError::Timeout));
            assert_eq!(lock.request_read(40), Err(SyncError::Timeout));
        })
    };
    contender.join().unwrap();

    lock.release_write().unwrap();
}

#[test]
fn write_recursion_and_mixed_reads() {
    common::init();
    let lock = RwLock::new();

    lock.request_write(INDEFINITE_WAIT).unwrap();
    lock.request_write(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.write_recursion(), 2);
    lock.release_write().unwrap();
    assert_eq!(lock.write_recursion(), 1);

    // Reads inside the write section are tracked separately.
    lock.request_read(INDEFINITE_WAIT).unwrap();
    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.writer_read_recursion(), 2);
    assert!(lock.is_read_owner(false));

    // The final write release is refused until the reads are unwound.
    assert_eq!(lock.release_write(), Err(SyncError::WrongReleaseOrder));
    lock.release_read().unwrap();
    lock.release_read().unwrap();
    assert_eq!(lock.writer_read_recursion(), 0);

    lock.release_write().unwrap();
    assert_eq!(lock.write_recursion(), 0);
}

#[test]
fn release_without_ownership_is_refused() {
    common::init();
    let lock = RwLock::new();
    assert_eq!(lock.release_read(), Err(SyncError::NotOwner));
    assert_eq!(lock.release_write(), Err(SyncError::NotOwner));
}

#[test]
fn direction_flips_to_waiting_readers() {
    common::init();
    const READERS: usize = 4;
    let lock = Arc::new(RwLock::new());
    lock.request_write(INDEFINITE_WAIT).unwrap();

    let (admitted_tx, admitted_rx) = crossbeam_channel::unbounded();
    let (go_home_tx, go_home_rx) = crossbeam_channel::unbounded::<()>();
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let lock = lock.clone();
            let admitted_tx = admitted_tx.clone();
            let go_home_rx = go_home_rx.clone();
            std::thread::spawn(move || {
                lock.request_read(INDEFINITE_WAIT).unwrap();
                admitted_tx.send(()).unwrap();
                go_home_rx.recv().unwrap();
                lock.release_read().unwrap();
            })
        })
        .collect();

    // Let all readers park, then hand the lock over.
    std::thread::sleep(Duration::from_millis(150));
    lock.release_write().unwrap();
    for _ in 0..READERS {
        admitted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reader was not admitted");
    }
    assert_eq!(lock.direction(), Direction::Read);
    assert_eq!(lock.read_count() as usize, READERS);

    // A writer arriving now must wait for every reader.
    let (wrote_tx, wrote_rx) = crossbeam_channel::unbounded();
    let writer = {
        let lock = lock.clone();
        std::thread::spawn(move || {
            lock.request_write(INDEFINITE_WAIT).unwrap();
            wrote_tx.send(()).unwrap();
            lock.release_write().unwrap();
        })
    };
    assert!(wrote_rx.recv_timeout(Duration::from_millis(150)).is_err());

    for _ in 0..READERS {
        go_home_tx.send(()).unwrap();
    }
    wrote_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("writer never got the lock");
    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn frob() {
    common::init();
    const ITERS: u32 = 300;
    let threads = num_cpus::get().clamp(2, 8) as u32;
    let lock = Arc::new(RwLock::new());

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERS {
                    if rng.gen_bool(1.0 / f64::from(threads)) {
                        drop(lock.acquire_write().unwrap());
                    } else {
                        drop(lock.acquire_read().unwrap());
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Everything went back to idle.
    lock.try_request_write().unwrap();
    lock.release_write().unwrap();
}

#[test]
fn destruction_lifecycle() {
    common::init();
    let lock = RwLock::new();

    lock.request_read(INDEFINITE_WAIT).unwrap();
    assert_eq!(lock.destroy(), Err(SyncError::Busy));
    lock.release_read().unwrap();

    lock.destroy().unwrap();
    assert_eq!(lock.request_read(0), Err(SyncError::InvalidHandle));
    assert_eq!(lock.request_write(0), Err(SyncError::InvalidHandle));
    assert_eq!(lock.destroy(), Err(SyncError::Destroyed));
}
