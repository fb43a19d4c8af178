//! Benchmarks for both store backends.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::Rng;
use tempfile::TempDir;

use dictstore::{ClawDb, FlatDb, FlatOptions};
use dictstore_api::{Db, Transactional};
use dictstore_engine::Config;

const NUM_KEYS: u32 = 10_000;

fn bench_config() -> Config {
    Config::mobile().with_checkpoint_on_close(false)
}

fn key(i: u32) -> Vec<u8> {
    format!("word/{i:06}").into_bytes()
}

fn populated<D: Db>(db: D) -> D {
    db.open().unwrap();
    for i in 0..NUM_KEYS {
        db.update(&key(i), b"definition").unwrap();
    }
    db
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    group.throughput(Throughput::Elements(1));

    let dir = TempDir::new().unwrap();
    let claw = ClawDb::new(dir.path().join("u.claw"), "u", bench_config());
    claw.open().unwrap();
    let flat = FlatDb::new(dir.path().join("u.flat"), "u", FlatOptions::default());
    flat.open().unwrap();

    let mut i = 0u32;
    group.bench_function("claw", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            claw.update(&key(i % NUM_KEYS), b"value").unwrap();
        })
    });
    group.bench_function("flat", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            flat.update(&key(i % NUM_KEYS), b"value").unwrap();
        })
    });
    group.finish();
}

fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");

    for size in [10u32, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(format!("commit_{size}"), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let db = ClawDb::new(dir.path().join("t.claw"), "t", bench_config());
                    db.open().unwrap();
                    (db, dir)
                },
                |(db, _dir)| {
                    db.begin_transaction().unwrap();
                    for i in 0..size {
                        db.update(&key(i), b"value").unwrap();
                    }
                    db.commit_transaction().unwrap();
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

fn bench_fetch_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_random");
    group.throughput(Throughput::Elements(100));

    let dir = TempDir::new().unwrap();
    let claw = populated(ClawDb::new(dir.path().join("r.claw"), "r", bench_config()));
    let flat = populated(FlatDb::new(dir.path().join("r.flat"), "r", FlatOptions::default()));
    let stores: [(&str, &dyn Db); 2] = [("claw", &claw), ("flat", &flat)];

    for (label, db) in stores {
        group.bench_function(label, |b| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                for _ in 0..100 {
                    let k = key(rng.gen_range(0..NUM_KEYS));
                    black_box(db.fetch(&k).unwrap());
                }
            })
        });
    }
    group.finish();
}

fn bench_prefix_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefix_scan");

    let dir = TempDir::new().unwrap();
    let claw = populated(ClawDb::new(dir.path().join("s.claw"), "s", bench_config()));
    let flat = populated(FlatDb::new(dir.path().join("s.flat"), "s", FlatOptions::default()));
    let stores: [(&str, &dyn Db); 2] = [("claw", &claw), ("flat", &flat)];

    // "word/001" matches 1000 keys.
    group.throughput(Throughput::Elements(1000));
    for (label, db) in stores {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut cursor = db.query(b"word/001").unwrap();
                let mut n = 0;
                while let Some(record) = cursor.next_record().unwrap() {
                    black_box(record);
                    n += 1;
                }
                assert_eq!(n, 1000);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_update, bench_transaction, bench_fetch_random, bench_prefix_scan);
criterion_main!(benches);
