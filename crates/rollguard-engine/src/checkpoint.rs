//! Checkpoint manager: epoch state machine, cadence policy and sealing.
//!
//! Per epoch the coordinator moves `Running -> Quiescing -> Sealing ->
//! Running`. Sealing happens only with every thread parked at a unit
//! boundary or exited, and only after the comprehensive validation pass has
//! come back clean; a dirty pass hands the quiesced threads to the rollback
//! controller instead.

use std::time::{Duration, Instant};

use crate::config::CheckpointPolicy;
use crate::error::DetectorError;
use crate::heap::{Heap, HeapSnapshot};
use crate::sync::{SyncLog, SyncObjectId, SyncObjectState, SyncRecorder, SyncRegistry};
use crate::thread::{ThreadTable, ThreadTableSnapshot};
use crate::validator::{DetectionSource, Evidence, ValidationLevel, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Running,
    Quiescing,
    Sealing,
}

/// Everything needed to restart execution from an epoch boundary.
pub struct Checkpoint {
    pub epoch: u64,
    /// Pages dirtied during the epoch this checkpoint closed.
    pub dirty_at_seal: Vec<usize>,
    pub heap: HeapSnapshot,
    /// Closed log of the epoch before this checkpoint.
    pub sync_log: SyncLog,
    pub threads: ThreadTableSnapshot,
    pub objects: Vec<(SyncObjectId, SyncObjectState)>,
    pub sealed_at: Instant,
}

/// Components a seal reads from and resets.
pub struct SealInputs<'a> {
    pub heap: &'a Heap,
    pub validator: &'a Validator,
    pub recorder: &'a SyncRecorder,
    pub registry: &'a SyncRegistry,
    pub threads: &'a ThreadTable,
}

#[derive(Debug)]
pub enum SealOutcome {
    /// A new checkpoint for `epoch` is open.
    Sealed { epoch: u64, dirty_pages: usize, events: usize },
    /// The validation pass found corruption; nothing was sealed.
    Detected(Vec<Evidence>),
}

pub struct CheckpointManager {
    epoch: u64,
    phase: EpochPhase,
    current: Option<Checkpoint>,
    last_seal: Instant,
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: 0,
            phase: EpochPhase::Running,
            current: None,
            last_seal: Instant::now(),
        }
    }

    /// Epoch of the open checkpoint (0 before the first seal).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: EpochPhase) {
        self.phase = phase;
    }

    #[must_use]
    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn since_last_seal(&self) -> Duration {
        self.last_seal.elapsed()
    }

    /// Whether the cadence policy calls for a checkpoint now.
    #[must_use]
    pub fn due(&self, policy: CheckpointPolicy, allocations: u64, requested: bool) -> bool {
        if requested {
            return true;
        }
        match policy {
            CheckpointPolicy::Interval { millis } => {
                self.last_seal.elapsed() >= Duration::from_millis(millis)
            }
            CheckpointPolicy::Allocations { count } => allocations >= count,
            CheckpointPolicy::Manual => false,
        }
    }

    /// Validate, then seal a new checkpoint. Callers hold quiescence.
    pub fn seal(&mut self, inputs: &SealInputs<'_>) -> Result<SealOutcome, DetectorError> {
        self.phase = EpochPhase::Sealing;
        let evidence = inputs.validator.scan_all(inputs.heap, DetectionSource::Checkpoint);
        if !evidence.is_empty() {
            self.phase = EpochPhase::Running;
            return Ok(SealOutcome::Detected(evidence));
        }
        let next = self.epoch + 1;
        let sync_log = inputs.recorder.close_epoch(next);
        let tracker = inputs.heap.tracker();
        let dirty_at_seal = tracker.enumerate_dirty();
        tracker.seal()?;
        let checkpoint = Checkpoint {
            epoch: next,
            dirty_at_seal,
            heap: inputs.heap.snapshot(),
            sync_log,
            threads: inputs.threads.snapshot(),
            objects: inputs.registry.snapshot(),
            sealed_at: Instant::now(),
        };
        let outcome = SealOutcome::Sealed {
            epoch: next,
            dirty_pages: checkpoint.dirty_at_seal.len(),
            events: checkpoint.sync_log.len(),
        };
        self.epoch = next;
        inputs.heap.set_epoch(next);
        inputs.validator.set_level(ValidationLevel::Normal);
        self.current = Some(checkpoint);
        self.last_seal = Instant::now();
        self.phase = EpochPhase::Running;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::TrackingMode;
    use crate::error::ErrorKind;
    use crate::heap::SiteLoc;
    use crate::page_tracker::PageTracker;
    use crate::region::PAGE_SIZE;
    use crate::thread::ThreadId;

    struct Parts {
        heap: Heap,
        validator: Validator,
        recorder: SyncRecorder,
        registry: SyncRegistry,
        threads: ThreadTable,
    }

    impl Parts {
        fn new() -> Self {
            let tracker = Arc::new(PageTracker::new(16 * PAGE_SIZE, TrackingMode::WriteBarrier).unwrap());
            Self {
                heap: Heap::new(tracker, 1, 16 * PAGE_SIZE, 8, usize::MAX),
                validator: Validator::new(),
                recorder: SyncRecorder::new(),
                registry: SyncRegistry::new(),
                threads: ThreadTable::new(1),
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
    }

    #[test]
    fn cadence_policies() {
        let mgr = CheckpointManager::new();
        assert!(mgr.due(CheckpointPolicy::Manual, 1_000, true));
        assert!(!mgr.due(CheckpointPolicy::Manual, 1_000, false));
        assert!(mgr.due(CheckpointPolicy::Allocations { count: 10 }, 10, false));
        assert!(!mgr.due(CheckpointPolicy::Allocations { count: 10 }, 9, false));
        assert!(!mgr.due(CheckpointPolicy::Interval { millis: 60_000 }, 0, false));
        assert!(mgr.due(CheckpointPolicy::Interval { millis: 0 }, 0, false));
    }

    #[test]
    fn seal_advances_epoch_and_clears_dirty_set() {
        let parts = Parts::new();
        let mut mgr = CheckpointManager::new();
        let p = parts.heap.malloc(ThreadId(0), 40, SiteLoc::caller()).unwrap();
        assert!(!parts.heap.tracker().enumerate_dirty().is_empty());
        parts.validator.set_level(ValidationLevel::Full);

        let outcome = mgr.seal(&parts.inputs()).unwrap();
        assert!(matches!(outcome, SealOutcome::Sealed { epoch: 1, .. }));
        assert_eq!(mgr.epoch(), 1);
        assert_eq!(parts.heap.epoch(), 1);
        assert_eq!(parts.validator.level(), ValidationLevel::Normal);
        assert!(parts.heap.tracker().enumerate_dirty().is_empty());
        let cp = mgr.current().unwrap();
        assert_eq!(cp.heap.record_count(), 1);
        assert!(!cp.dirty_at_seal.is_empty());

        parts.heap.tracker().write(p.addr(), b"x", None);
        assert_eq!(parts.heap.tracker().enumerate_dirty().len(), 1);
    }

    #[test]
    fn corrupted_heap_is_not_sealed() {
        let parts = Parts::new();
        let mut mgr = CheckpointManager::new();
        let p = parts.heap.malloc(ThreadId(0), 16, SiteLoc::caller()).unwrap();
        parts.heap.tracker().write(p.addr() + 16, &[0], None);
        match mgr.seal(&parts.inputs()).unwrap() {
            SealOutcome::Detected(evidence) => {
                assert_eq!(evidence.len(), 1);
                assert_eq!(evidence[0].kind, ErrorKind::BufferOverflow);
                assert_eq!(evidence[0].offset, Some(16));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mgr.epoch(), 0);
        assert!(mgr.current().is_none());
        assert_eq!(mgr.phase(), EpochPhase::Running);
    }
}
