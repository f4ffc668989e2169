//! Seeded multi-threaded workloads. Clean workloads must complete with no
//! report across many checkpoints; workloads with one injected overflow must
//! be terminated with that overflow reported.

use rollguard_engine::{
    CheckpointPolicy, DetectorError, Engine, ErrorKind, Flow, HeapPtr, OnDetection, Reproduction, RollguardConfig,
    RunOutcome, ThreadContext, TrackedMutex, TrackingMode, Verbosity, thread_body,
};

const SEEDS: [u64; 4] = [0x1, 0x7, 0x2A, 0xDEAD_BEEF];

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Per-unit generator: a unit re-executed under replay draws the same values.
fn unit_rng(seed: u64, tid: u32, unit: u64) -> XorShift64 {
    XorShift64::new(seed ^ (u64::from(tid) << 40) ^ unit.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

struct Plan {
    threads: u32,
    units: u64,
    /// (thread, unit) that overflows a retained block.
    bug: Option<(u32, u64)>,
}

impl Plan {
    fn new(seed: u64, with_bug: bool) -> Self {
        let mut rng = XorShift64::new(seed);
        let threads = rng.gen_range(2, 3) as u32;
        let units = rng.gen_range(12, 30) as u64;
        let bug = with_bug.then(|| (rng.gen_range(0, threads as usize - 1) as u32, rng.gen_range(1, units as usize - 2) as u64));
        Self { threads, units, bug }
    }
}

fn config(tracking: TrackingMode) -> RollguardConfig {
    RollguardConfig::new()
        .with_heap_size(8 << 20)
        .with_max_threads(4)
        .with_checkpoint(CheckpointPolicy::Allocations { count: 6 })
        .with_verbosity(Verbosity::Quiet)
        .with_on_detection(OnDetection::Terminate)
        .with_tracking(tracking)
}

fn unit_body(
    ctx: &ThreadContext,
    seed: u64,
    tid: u32,
    unit: u64,
    m: &TrackedMutex,
    total: HeapPtr,
    bug: Option<(u32, u64)>,
) -> Result<(), DetectorError> {
    let mut rng = unit_rng(seed, tid, unit);
    let size = rng.gen_range(1, 160);
    let byte = rng.gen_range(1, 255) as u8;
    let p = ctx.malloc(size)?;
    ctx.fill(p, byte, size)?;
    let back = ctx.read(p, size)?;
    assert!(
        back.iter().all(|b| *b == byte),
        "seed={seed} step={unit}: thread {tid} read back foreign bytes"
    );
    ctx.lock(m)?;
    let v = ctx.read_u64(total)?;
    ctx.write_u64(total, v + size as u64)?;
    ctx.unlock(m)?;
    if bug == Some((tid, unit)) {
        // Retained so only a scan can find it.
        let keep = ctx.malloc(24)?;
        ctx.write(keep, &[0xEE; 25])?;
    }
    if rng.gen_range(0, 3) == 0 {
        ctx.yield_point()?;
    }
    ctx.free(p)?;
    Ok(())
}

fn build(seed: u64, plan: &Plan, tracking: TrackingMode) -> (Engine, HeapPtr, u64) {
    let mut engine = Engine::new(config(tracking)).unwrap();
    let total = engine.alloc_global(8).unwrap();
    let m = engine.mutex();
    let mut expected = 0u64;
    for tid in 0..plan.threads {
        for unit in 0..plan.units {
            expected += unit_rng(seed, tid, unit).gen_range(1, 160) as u64;
        }
        let (m, units, bug) = (m.clone(), plan.units, plan.bug);
        engine
            .add_thread(thread_body(move |ctx, unit| {
                if unit == units {
                    return Ok(Flow::Done);
                }
                unit_body(ctx, seed, tid, unit, &m, total, bug)?;
                Ok(Flow::Continue)
            }))
            .unwrap();
    }
    (engine, total, expected)
}

#[test]
fn clean_workloads_complete() {
    for seed in SEEDS {
        let plan = Plan::new(seed, false);
        let (mut engine, total, expected) = build(seed, &plan, TrackingMode::WriteBarrier);
        let summary = engine.run().unwrap();
        assert!(
            summary.is_clean(),
            "seed={seed} step=end: unexpected reports {:?}",
            summary.reports
        );
        assert_eq!(
            engine.read_global_u64(total).unwrap(),
            expected,
            "seed={seed} step=end: lost or duplicated updates"
        );
        assert!(
            summary.metrics.checkpoints_sealed >= 1,
            "seed={seed} step=end: initial checkpoint missing"
        );
        assert_eq!(summary.metrics.rollbacks, 0, "seed={seed} step=end");
    }
}

#[test]
fn injected_overflow_is_reported() {
    for seed in SEEDS {
        let plan = Plan::new(seed, true);
        let (bug_thread, bug_unit) = plan.bug.unwrap();
        let (mut engine, _, _) = build(seed, &plan, TrackingMode::WriteBarrier);
        let summary = engine.run().unwrap();
        let RunOutcome::Terminated(report) = &summary.outcome else {
            panic!("seed={seed} step={bug_unit}: overflow went unreported");
        };
        assert_eq!(report.kind, ErrorKind::BufferOverflow, "seed={seed} step={bug_unit}");
        assert_eq!(report.offset, Some(24), "seed={seed} step={bug_unit}");
        assert_ne!(
            report.reproduction,
            Reproduction::NotReproduced,
            "seed={seed} step={bug_unit}"
        );
        if report.reproduction == Reproduction::Pinpointed {
            assert_eq!(report.thread.map(|t| t.0), Some(bug_thread), "seed={seed} step={bug_unit}");
            assert_eq!(
                report.history.last().map(|op| op.unit),
                Some(bug_unit),
                "seed={seed} step={bug_unit}"
            );
        }
        assert_eq!(summary.metrics.rollbacks, 1, "seed={seed} step={bug_unit}");
    }
}

#[test]
fn page_protection_matches_write_barrier() {
    let seed = SEEDS[2];
    let plan = Plan::new(seed, false);
    let (mut engine, total, expected) = build(seed, &plan, TrackingMode::PageProtection);
    let summary = engine.run().unwrap();
    assert!(summary.is_clean(), "seed={seed} step=end: {:?}", summary.reports);
    assert_eq!(engine.read_global_u64(total).unwrap(), expected, "seed={seed} step=end");
    assert!(summary.metrics.page_faults >= 1, "seed={seed} step=end: no write faults taken");
}
