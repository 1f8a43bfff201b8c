//! Storage engine benchmarks.
//!
//! Point lookups, batched commits, cursor scans, overflow values and
//! compaction, over both backends. Populating uses `NO_SYNC` so setup time
//! stays out of the way; the commit benchmarks measure both sync modes.

#![allow(clippy::expect_used, missing_docs)]

use std::{
    hint::black_box,
    time::{Duration, Instant},
};

use burrow_store::{
    CursorOp, Database, DatabaseConfig, FileBackend, InMemoryBackend, OpenFlags, StorageBackend,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

fn key(i: usize) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

fn open_file(dir: &TempDir, flags: OpenFlags) -> Database<FileBackend> {
    let config = DatabaseConfig::builder().flags(flags).build();
    Database::open_with_config(dir.path().join("bench.burrow"), config).expect("open database")
}

/// Inserts `count` sequential keys, committing every `batch_size`.
fn populate<B: StorageBackend>(db: &Database<B>, count: usize, batch_size: usize) {
    for batch_start in (0..count).step_by(batch_size) {
        let mut txn = db.write().expect("write txn");
        for i in batch_start..(batch_start + batch_size).min(count) {
            txn.put(&key(i), format!("value-{i}").as_bytes()).expect("put");
        }
        txn.commit().expect("commit");
    }
}

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000, 10_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_file(&dir, OpenFlags::NO_SYNC);
        populate(&db, count, 1000);

        group.bench_with_input(BenchmarkId::new("hit", count), &count, |b, &count| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 7919) % count;
                black_box(db.get(&key(i)).expect("get"))
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", count), &count, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                black_box(db.get(format!("missing-{i}").as_bytes()).is_err())
            });
        });
    }

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/commit");

    for (label, flags) in [("sync", OpenFlags::empty()), ("no_sync", OpenFlags::NO_SYNC)] {
        for batch_size in [1, 100, 1000] {
            group.throughput(Throughput::Elements(batch_size as u64));
            group.bench_with_input(
                BenchmarkId::new(label, batch_size),
                &batch_size,
                |b, &batch_size| {
                    let dir = TempDir::new().expect("create temp dir");
                    let db = open_file(&dir, flags);
                    let mut counter = 0usize;
                    b.iter(|| {
                        let mut txn = db.write().expect("write txn");
                        for _ in 0..batch_size {
                            counter += 1;
                            txn.put(&key(counter), b"value").expect("put");
                        }
                        txn.commit().expect("commit");
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_insert_in_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/insert_memory");
    group.throughput(Throughput::Elements(100));

    group.bench_function("batch_100", |b| {
        let db = Database::<InMemoryBackend>::open_in_memory().expect("open database");
        let mut counter = 0usize;
        b.iter(|| {
            let mut txn = db.write().expect("write txn");
            for _ in 0..100 {
                counter += 1;
                txn.put(&key(counter), b"value").expect("put");
            }
            txn.commit().expect("commit");
        });
    });

    group.finish();
}

fn bench_overflow_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/overflow");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        let value = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::new("put_get", size), &value, |b, value| {
            let db = Database::<InMemoryBackend>::open_in_memory().expect("open database");
            b.iter(|| {
                db.put(b"big", value).expect("put");
                black_box(db.get(b"big").expect("get").len())
            });
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/scan");

    for count in [1_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let db = open_file(&dir, OpenFlags::NO_SYNC);
        populate(&db, count, 10_000);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("iter", count), &count, |b, _| {
            b.iter(|| {
                let txn = db.read().expect("read txn");
                black_box(txn.iter().count())
            });
        });
        group.bench_with_input(BenchmarkId::new("cursor_prev", count), &count, |b, _| {
            b.iter(|| {
                let txn = db.read().expect("read txn");
                let mut cursor = txn.cursor();
                let mut seen = 0usize;
                let mut op = CursorOp::Last;
                while cursor.get(op).is_ok() {
                    seen += 1;
                    op = CursorOp::Prev;
                }
                black_box(seen)
            });
        });
    }

    let count = 10_000usize;
    let span = count / 10;
    group.throughput(Throughput::Elements(span as u64));
    let dir = TempDir::new().expect("create temp dir");
    let db = open_file(&dir, OpenFlags::NO_SYNC);
    populate(&db, count, 1000);
    group.bench_function("range_10pct", |b| {
        let mut start = 0usize;
        b.iter(|| {
            start = (start + span) % count;
            let (lo, hi) = (key(start), key(start + span));
            let txn = db.read().expect("read txn");
            black_box(txn.range(Some(&lo), Some(&hi)).count())
        });
    });

    group.finish();
}

/// Compaction of a 100k-entry file after a third of the keys are deleted.
///
/// Each iteration needs a freshly fragmented file, so only the compaction
/// itself is timed.
fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/compaction");

    group.bench_function("100k_33pct_deleted", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let dir = TempDir::new().expect("create temp dir");
                let db = open_file(&dir, OpenFlags::NO_SYNC);
                populate(&db, 100_000, 10_000);
                {
                    let mut txn = db.write().expect("write txn");
                    for i in (0..100_000).step_by(3) {
                        txn.delete(&key(i)).expect("delete");
                    }
                    txn.commit().expect("commit");
                }

                let start = Instant::now();
                black_box(db.compact().expect("compact"));
                total += start.elapsed();
            }
            total
        });
    });

    group.finish();
}

criterion_group! {
    name = lookup_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_point_lookup
}

criterion_group! {
    name = write_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5)).sample_size(30);
    targets = bench_commit, bench_insert_in_memory, bench_overflow_values
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10)).sample_size(20);
    targets = bench_scan
}

criterion_group! {
    name = compaction_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(30)).sample_size(10);
    targets = bench_compaction
}

criterion_main!(lookup_benches, write_benches, scan_benches, compaction_benches);
