//! Tracked heap malloc/free throughput.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rollguard_engine::heap::{Heap, SiteLoc};
use rollguard_engine::page_tracker::PageTracker;
use rollguard_engine::{ThreadId, TrackingMode};

const REGION: usize = 16 << 20;

fn heap() -> Heap {
    let tracker = Arc::new(PageTracker::new(REGION, TrackingMode::WriteBarrier).expect("map tracked region"));
    Heap::new(tracker, 1, REGION, 64, 1 << 20)
}

fn bench_malloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("malloc_free_cycle");
    for &size in sizes {
        let h = heap();
        group.bench_with_input(BenchmarkId::new("tracked", size), &size, |b, &sz| {
            b.iter(|| {
                let p = h.malloc(ThreadId(0), sz, SiteLoc::caller()).expect("malloc");
                h.free(ThreadId(0), criterion::black_box(p), SiteLoc::caller()).expect("free");
            });
        });
    }
    group.finish();
}

fn bench_malloc_burst(c: &mut Criterion) {
    c.bench_function("burst_256x64B", |b| {
        b.iter_batched(
            heap,
            |h| {
                let ptrs: Vec<_> = (0..256)
                    .map(|_| h.malloc(ThreadId(0), 64, SiteLoc::caller()).expect("malloc"))
                    .collect();
                for p in ptrs {
                    h.free(ThreadId(0), p, SiteLoc::caller()).expect("free");
                }
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_malloc_free_cycle, bench_malloc_burst);
criterion_main!(benches);
