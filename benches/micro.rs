//! Micro-benchmarks for TesseraDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use tempfile::TempDir;
use tesseradb::{MaskHasher, SearchTerms, Store};

/// Default value payload for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// A fresh single-attribute store in `dir`.
fn open_store(dir: &std::path::Path) -> Store {
    Store::create(dir, Arc::new(MaskHasher::new(1)), 2).expect("create store")
}

/// Pre-populate and flush `count` sequential keys.
fn prepopulate(store: &Store, count: u64) {
    for i in 0..count {
        store
            .put(&make_key(i), vec![VALUE_128B.to_vec()], i)
            .unwrap();
    }
    store.flush(None, false).unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("buffered_128b", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let mut i = 0u64;
        b.iter(|| {
            store
                .put(&make_key(i), vec![VALUE_128B.to_vec()], i)
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("flushed_128b", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let mut i = 0u64;
        b.iter(|| {
            store
                .put(&make_key(i), vec![VALUE_128B.to_vec()], i)
                .unwrap();
            store.flush(None, false).unwrap();
            i += 1;
        });
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit_flushed_10k", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        prepopulate(&store, 10_000);
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(i % 10_000);
            black_box(store.get(&key).unwrap());
            i += 1;
        });
    });

    group.bench_function("miss_flushed_10k", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        prepopulate(&store, 10_000);
        b.iter(|| {
            black_box(store.get(b"key-does-not-exist").unwrap());
        });
    });

    group.finish();
}

// ================================================================================================
// Scan benchmarks
// ================================================================================================

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    group.bench_function("snapshot_10k", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        prepopulate(&store, 10_000);
        b.iter_batched(
            || store.snapshot().unwrap(),
            |snapshot| {
                let count = snapshot.count();
                black_box(count);
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("filtered_10k", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        // Half the records carry a searchable marker attribute.
        for i in 0..10_000u64 {
            let value: &[u8] = if i % 2 == 0 { b"hot" } else { b"cold" };
            store.put(&make_key(i), vec![value.to_vec()], i).unwrap();
        }
        store.flush(None, false).unwrap();
        b.iter_batched(
            || {
                store
                    .search(SearchTerms::new(1).equals(0, b"hot".to_vec()))
                    .unwrap()
            },
            |snapshot| {
                let count = snapshot.count();
                black_box(count);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_search);
criterion_main!(benches);
