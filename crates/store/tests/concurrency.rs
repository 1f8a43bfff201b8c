//! Concurrent readers and writers sharing one handle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use burrow_store::{Database, DatabaseConfig, Error, InMemoryBackend, WriterWait};
use burrow_test_utils::TestDir;

fn counter_value(db: &Database<InMemoryBackend>) -> u64 {
    let bytes = db.get(b"counter").unwrap();
    u64::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn test_writers_serialize() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.put(b"counter", &0u64.to_le_bytes()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..25 {
                    let mut txn = db.write().unwrap();
                    let current = u64::from_le_bytes(
                        txn.get(b"counter").unwrap().unwrap().try_into().unwrap(),
                    );
                    txn.put(b"counter", &(current + 1).to_le_bytes()).unwrap();
                    txn.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    assert_eq!(counter_value(&db), 200);
}

#[test]
fn test_readers_see_consistent_snapshots() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    {
        let mut txn = db.write().unwrap();
        for i in 0..100u32 {
            txn.put(format!("key-{i:03}").as_bytes(), &0u32.to_le_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            // Every commit sets all keys to the same generation.
            for generation in 1..=50u32 {
                let mut txn = db.write().unwrap();
                for i in 0..100u32 {
                    txn.put(format!("key-{i:03}").as_bytes(), &generation.to_le_bytes()).unwrap();
                }
                txn.commit().unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut snapshots = 0;
                while !done.load(Ordering::SeqCst) || snapshots == 0 {
                    let txn = db.read().unwrap();
                    let generations: Vec<u32> = txn
                        .iter()
                        .map(|entry| {
                            let (_, value) = entry.unwrap();
                            u32::from_le_bytes(value.try_into().unwrap())
                        })
                        .collect();
                    assert_eq!(generations.len(), 100);
                    assert!(
                        generations.iter().all(|&g| g == generations[0]),
                        "snapshot mixed generations"
                    );
                    snapshots += 1;
                }
            })
        })
        .collect();

    writer.join().expect("writer panicked");
    for reader in readers {
        reader.join().expect("reader panicked");
    }

    let stats = db.stats().unwrap();
    assert_eq!(stats.active_readers, 0);
    assert!(db.verify().unwrap().is_clean());
}

#[test]
fn test_long_reader_keeps_pages_alive() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    for i in 0..200u32 {
        db.put(format!("{i:04}").as_bytes(), b"original").unwrap();
    }

    let reader = db.read().unwrap();
    for round in 0..20u32 {
        let mut txn = db.write().unwrap();
        for i in 0..200u32 {
            txn.put(format!("{i:04}").as_bytes(), format!("round-{round}").as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    // The old snapshot is intact even though every page was rewritten 20 times.
    for entry in reader.iter() {
        let (_, value) = entry.unwrap();
        assert_eq!(value, b"original");
    }
    assert!(db.stats().unwrap().pending_free_pages > 0);
    drop(reader);

    // The next writer reclaims everything instead of growing the file.
    let total_pages = db.stats().unwrap().total_pages;
    db.put(b"trigger", b"release").unwrap();
    let stats = db.stats().unwrap();
    assert_eq!(stats.total_pages, total_pages);
    assert!(stats.free_pages > 0);
}

#[test]
fn test_writer_wait_timeout_across_threads() {
    let config = DatabaseConfig::builder()
        .writer_wait(WriterWait::Timeout(Duration::from_millis(50)))
        .build();
    let db = Arc::new(Database::open_in_memory_with_config(config).unwrap());
    let barrier = Arc::new(Barrier::new(2));

    let holder = {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut txn = db.write().unwrap();
            txn.put(b"held", b"1").unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(300));
            txn.commit().unwrap();
        })
    };

    barrier.wait();
    assert!(matches!(db.write(), Err(Error::WriterBusy)));
    holder.join().expect("holder panicked");

    // Free again once the holder committed.
    db.write().unwrap().abort();
    assert_eq!(db.get(b"held").unwrap(), b"1");
}

#[test]
fn test_blocking_writer_waits_for_commit() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let barrier = Arc::new(Barrier::new(2));

    let holder = {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut txn = db.write().unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(50));
            txn.put(b"first", b"1").unwrap();
            txn.commit().unwrap();
        })
    };

    barrier.wait();
    let mut txn = db.write().unwrap();
    // The first writer committed before this one got the lock.
    assert_eq!(txn.get(b"first").unwrap(), Some(b"1".to_vec()));
    txn.put(b"second", b"2").unwrap();
    txn.commit().unwrap();
    holder.join().expect("holder panicked");

    assert_eq!(db.stats().unwrap().txn_id, 2);
}

#[test]
fn test_reads_do_not_block_on_writer() {
    let dir = TestDir::new();
    let db = Arc::new(Database::open(dir.db_path()).unwrap());
    db.put(b"k", b"committed").unwrap();

    let mut txn = db.write().unwrap();
    txn.put(b"k", b"pending").unwrap();

    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.get(b"k").unwrap())
    };
    assert_eq!(reader.join().expect("reader panicked"), b"committed");

    txn.commit().unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"pending");
}
