//! Benchmarks for the ChronoDB storage engine
//!
//! Run with: cargo bench

use chronodb::{ChronoDb, Mutation, Order, MASTER_BRANCH};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;
use tokio::runtime::Runtime;

fn batch(size: usize, version: usize) -> Vec<Mutation> {
    (0..size)
        .map(|i| {
            Mutation::put(
                "bench",
                format!("key_{:06}", i),
                format!("value_{}_{}", i, version).into_bytes(),
            )
        })
        .collect()
}

fn bench_commit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("commit");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(format!("batch_{}", size), |b| {
            let dir = tempdir().unwrap();
            let db = rt.block_on(ChronoDb::open_default(dir.path())).unwrap();
            let mut version = 0usize;

            b.iter(|| {
                version += 1;
                rt.block_on(db.commit(MASTER_BRANCH, black_box(batch(size, version)), None))
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_point_reads(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("get");

    let dir = tempdir().unwrap();
    let db = rt.block_on(ChronoDb::open_default(dir.path())).unwrap();
    for version in 1..=10 {
        rt.block_on(db.commit(MASTER_BRANCH, batch(1000, version), None))
            .unwrap();
    }

    group.bench_function("latest", |b| {
        b.iter(|| {
            rt.block_on(db.get(MASTER_BRANCH, "bench", black_box("key_000500"), 10))
                .unwrap()
        });
    });

    group.bench_function("as_of_past", |b| {
        b.iter(|| {
            rt.block_on(db.get(MASTER_BRANCH, "bench", black_box("key_000500"), 3))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_history(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("history");

    let dir = tempdir().unwrap();
    let db = rt.block_on(ChronoDb::open_default(dir.path())).unwrap();
    for version in 1..=100 {
        rt.block_on(db.commit(
            MASTER_BRANCH,
            vec![Mutation::put("bench", "hot", format!("v{}", version).into_bytes())],
            None,
        ))
        .unwrap();
    }

    group.bench_function("100_versions_desc", |b| {
        b.iter(|| {
            rt.block_on(db.history(MASTER_BRANCH, "bench", "hot", 100, Order::Descending))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_commit, bench_point_reads, bench_history);
criterion_main!(benches);
