//! Atomic counters for engine observability.
//!
//! All counters use relaxed ordering; they are diagnostic, never used for
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::ErrorKind;

/// Per-engine operation counters.
pub struct EngineMetrics {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub quarantine_evictions: AtomicU64,
    pub checkpoints_sealed: AtomicU64,
    /// Checkpoint attempts abandoned because a thread was blocked mid-unit.
    pub checkpoints_deferred: AtomicU64,
    pub rollbacks: AtomicU64,
    pub pages_restored: AtomicU64,
    pub sync_events_recorded: AtomicU64,
    pub sync_events_replayed: AtomicU64,
    pub overflows: AtomicU64,
    pub use_after_frees: AtomicU64,
    pub double_frees: AtomicU64,
    pub metadata_corruptions: AtomicU64,
    /// Detections that were neutralized and execution continued.
    pub neutralized: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            quarantine_evictions: AtomicU64::new(0),
            checkpoints_sealed: AtomicU64::new(0),
            checkpoints_deferred: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            pages_restored: AtomicU64::new(0),
            sync_events_recorded: AtomicU64::new(0),
            sync_events_replayed: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            use_after_frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            metadata_corruptions: AtomicU64::new(0),
            neutralized: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Count one reported detection of `kind`.
    pub fn record_detection(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::BufferOverflow => &self.overflows,
            ErrorKind::UseAfterFree => &self.use_after_frees,
            ErrorKind::DoubleFree => &self.double_frees,
            ErrorKind::HeapMetadataCorruption => &self.metadata_corruptions,
        };
        Self::inc(counter);
    }

    /// Snapshot all counters. Page-level counters live in the tracker and are
    /// passed in by the caller.
    #[must_use]
    pub fn snapshot(&self, page_faults: u64, twins_captured: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            quarantine_evictions: Self::get(&self.quarantine_evictions),
            checkpoints_sealed: Self::get(&self.checkpoints_sealed),
            checkpoints_deferred: Self::get(&self.checkpoints_deferred),
            rollbacks: Self::get(&self.rollbacks),
            pages_restored: Self::get(&self.pages_restored),
            sync_events_recorded: Self::get(&self.sync_events_recorded),
            sync_events_replayed: Self::get(&self.sync_events_replayed),
            overflows: Self::get(&self.overflows),
            use_after_frees: Self::get(&self.use_after_frees),
            double_frees: Self::get(&self.double_frees),
            metadata_corruptions: Self::get(&self.metadata_corruptions),
            neutralized: Self::get(&self.neutralized),
            page_faults,
            twins_captured,
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub quarantine_evictions: u64,
    pub checkpoints_sealed: u64,
    pub checkpoints_deferred: u64,
    pub rollbacks: u64,
    pub pages_restored: u64,
    pub sync_events_recorded: u64,
    pub sync_events_replayed: u64,
    pub overflows: u64,
    pub use_after_frees: u64,
    pub double_frees: u64,
    pub metadata_corruptions: u64,
    pub neutralized: u64,
    pub page_faults: u64,
    pub twins_captured: u64,
}

impl MetricsSnapshot {
    /// Total user-bug detections across all kinds.
    #[must_use]
    pub const fn detections(&self) -> u64 {
        self.overflows + self.use_after_frees + self.double_frees + self.metadata_corruptions
    }
}
