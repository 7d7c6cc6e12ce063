//! Lifetime benchmarks using criterion.
//!
//! Run with: cargo bench --bench lifetime_bench

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lifeline::{stats, Managed, StrongHandle};

struct Payload(u64);

impl Managed for Payload {}

fn bench_add_ref_release(c: &mut Criterion) {
    stats::set_track_stats(false);
    let mut group = c.benchmark_group("add_ref_release");

    group.bench_function("inline", |b| {
        let handle = StrongHandle::new(Payload(1));
        b.iter(|| {
            let extra = black_box(handle.clone());
            drop(extra);
        });
    });

    group.bench_function("proxy", |b| {
        let handle = StrongHandle::new(Payload(1));
        let _weak = StrongHandle::downgrade(&handle);
        b.iter(|| {
            let extra = black_box(handle.clone());
            drop(extra);
        });
    });

    group.bench_function("arc_baseline", |b| {
        let arc = Arc::new(Payload(1));
        b.iter(|| {
            let extra = black_box(Arc::clone(&arc));
            drop(extra);
        });
    });

    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    stats::set_track_stats(false);
    let mut group = c.benchmark_group("lifecycle");

    group.bench_function("create_destroy", |b| {
        b.iter(|| black_box(StrongHandle::new(Payload(7))));
    });

    group.bench_function("create_downgrade_destroy", |b| {
        b.iter(|| {
            let handle = StrongHandle::new(Payload(7));
            black_box(StrongHandle::downgrade(&handle))
        });
    });

    group.finish();
}

fn bench_weak(c: &mut Criterion) {
    stats::set_track_stats(false);
    let mut group = c.benchmark_group("weak");

    group.bench_function("get_weak_reference_installed", |b| {
        let handle = StrongHandle::new(Payload(3));
        let _first = StrongHandle::downgrade(&handle);
        b.iter(|| black_box(StrongHandle::get_weak_reference(&handle)));
    });

    group.bench_function("resolve_alive", |b| {
        let handle = StrongHandle::new(Payload(3));
        let weak = StrongHandle::downgrade(&handle);
        b.iter(|| black_box(weak.resolve().map(|strong| strong.0)));
    });

    group.bench_function("resolve_dead", |b| {
        let weak = StrongHandle::downgrade(&StrongHandle::new(Payload(3)));
        b.iter(|| black_box(weak.resolve()));
    });

    group.finish();
}

fn bench_contended_add_ref(c: &mut Criterion) {
    stats::set_track_stats(false);
    let mut group = c.benchmark_group("contended_add_ref");

    for threads in [2usize, 4, 8] {
        const PER_THREAD: usize = 10_000;
        group.throughput(Throughput::Elements((threads * PER_THREAD) as u64));

        for (label, with_weak) in [("inline", false), ("proxy", true)] {
            group.bench_with_input(BenchmarkId::new(label, threads), &threads, |b, &threads| {
                let handle = StrongHandle::new(Payload(0));
                let _weak = with_weak.then(|| StrongHandle::downgrade(&handle));
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..threads {
                            s.spawn(|| {
                                for _ in 0..PER_THREAD {
                                    drop(black_box(handle.clone()));
                                }
                            });
                        }
                    });
                });
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_ref_release,
    bench_lifecycle,
    bench_weak,
    bench_contended_add_ref,
);
criterion_main!(benches);
