//! Checkpoint sealing cost as a function of live allocations.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rollguard_engine::checkpoint::{CheckpointManager, SealInputs};
use rollguard_engine::heap::{Heap, HeapPtr, SiteLoc};
use rollguard_engine::page_tracker::PageTracker;
use rollguard_engine::sync::{SyncRecorder, SyncRegistry};
use rollguard_engine::thread::ThreadTable;
use rollguard_engine::validator::Validator;
use rollguard_engine::{ThreadId, TrackingMode};

const REGION: usize = 32 << 20;

struct Fixture {
    heap: Heap,
    validator: Validator,
    recorder: SyncRecorder,
    registry: SyncRegistry,
    threads: ThreadTable,
    live: Vec<HeapPtr>,
}

impl Fixture {
    fn new(allocations: usize) -> Self {
        let tracker = Arc::new(PageTracker::new(REGION, TrackingMode::WriteBarrier).expect("map tracked region"));
        let heap = Heap::new(tracker, 1, REGION, 64, 1 << 20);
        let live = (0..allocations)
            .map(|i| heap.malloc(ThreadId(0), 32 + (i % 7) * 16, SiteLoc::caller()).expect("malloc"))
            .collect();
        Self {
            heap,
            validator: Validator::new(),
            recorder: SyncRecorder::new(),
            registry: SyncRegistry::new(),
            threads: ThreadTable::new(1),
            live,
        }
    }

    fn inputs(&self) -> SealInputs<'_> {
        SealInputs {
            heap: &self.heap,
            validator: &self.validator,
            recorder: &self.recorder,
            registry: &self.registry,
            threads: &self.threads,
        }
    }

    /// Dirty every page holding a live allocation.
    fn touch(&self) {
        for p in &self.live {
            self.heap.tracker().write(p.addr(), &[0x11; 8], Some(ThreadId(0)));
        }
    }
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_seal");
    for allocations in [64usize, 512, 4096] {
        let fixture = Fixture::new(allocations);
        let mut manager = CheckpointManager::new();
        group.bench_with_input(BenchmarkId::new("live", allocations), &allocations, |b, _| {
            b.iter(|| {
                fixture.touch();
                manager.seal(&fixture.inputs()).expect("seal")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_seal);
criterion_main!(benches);
