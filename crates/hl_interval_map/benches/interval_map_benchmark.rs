use criterion::{criterion_group, criterion_main, Criterion};

use hl_interval_map::IntervalMap;

// ----------------

#[cfg(not(debug_assertions))]
const COUNT: u64 = 100_000;

// `cargo test` also runs the benchmark setup code, so make sure they run quickly:
#[cfg(debug_assertions)]
const COUNT: u64 = 1;

/// Typical translated-function size in guest bytes.
const SPAN: u64 = 0x40;

// ----------------

criterion_group!(benches, insert, stab, overlaps);
criterion_main!(benches);

// ----------------

fn dense_map(count: u64) -> IntervalMap<u64> {
    let mut map = IntervalMap::new();
    for i in 0..count {
        map.add_or_update(i * SPAN, i * SPAN + SPAN, i, None).unwrap();
    }
    map
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(criterion::Throughput::Elements(COUNT));
    group.bench_function("sequential", |b| {
        b.iter(|| dense_map(COUNT));
    });
    group.bench_function("interleaved", |b| {
        b.iter(|| {
            let mut map = IntervalMap::new();
            // Two passes, so inserts constantly rebalance around each other.
            for i in (0..COUNT).step_by(2) {
                map.add_or_update(i * SPAN, i * SPAN + SPAN, i, None).unwrap();
            }
            for i in (1..COUNT).step_by(2) {
                map.add_or_update(i * SPAN, i * SPAN + SPAN, i, None).unwrap();
            }
            map
        });
    });
}

fn stab(c: &mut Criterion) {
    let map = dense_map(COUNT);
    let mut group = c.benchmark_group("stab");
    group.throughput(criterion::Throughput::Elements(COUNT));
    group.bench_function("hit_every_interval", |b| {
        b.iter(|| {
            let mut hits = 0u64;
            for i in 0..COUNT {
                if map.try_get(i * SPAN + SPAN / 2).is_some() {
                    hits += 1;
                }
            }
            hits
        });
    });
}

fn overlaps(c: &mut Criterion) {
    let map = dense_map(COUNT);
    let mut group = c.benchmark_group("overlaps");
    group.bench_function("page_sized_query", |b| {
        let mut out = Vec::new();
        b.iter(|| {
            out.clear();
            map.overlaps_into(COUNT * SPAN / 2, COUNT * SPAN / 2 + 4096, &mut out)
        });
    });
}
