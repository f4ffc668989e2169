//! Heap integrity checks.
//!
//! The free functions check one block against the bytes in the tracked
//! region. [`Validator`] adds the comprehensive scan used at checkpoint
//! boundaries and the per-access check used while replaying.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::ErrorKind;
use crate::fingerprint::{HEADER_SIZE, ObjectHeader, PRE_GUARD_SIZE};
use crate::heap::{AllocState, AllocationRecord, Heap};
use crate::page_tracker::PageTracker;
use crate::thread::ThreadId;

/// Where a detection was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DetectionSource {
    Free,
    QuarantineEviction,
    Checkpoint,
    ProgramEnd,
    /// An instrumented operation during replay.
    Replay,
    /// Reported through `Engine::report_external`.
    External,
}

impl DetectionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::QuarantineEviction => "quarantine-eviction",
            Self::Checkpoint => "checkpoint",
            Self::ProgramEnd => "program-end",
            Self::Replay => "replay",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Access {
    Read,
    Write,
}

/// How much checking instrumented operations perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Checks at free, eviction and checkpoint boundaries only.
    Normal,
    /// Every instrumented access is checked as well.
    Full,
}

/// Everything known about one detection.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub kind: ErrorKind,
    pub address: usize,
    pub source: DetectionSource,
    pub thread: Option<ThreadId>,
    pub allocation: Option<AllocationRecord>,
    /// Byte offset from the allocation's user base (negative for underflow).
    pub offset: Option<i64>,
    pub access: Option<Access>,
}

impl Evidence {
    #[must_use]
    pub fn new(kind: ErrorKind, address: usize, source: DetectionSource) -> Self {
        Self {
            kind,
            address,
            source,
            thread: None,
            allocation: None,
            offset: None,
            access: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Attach the responsible allocation and derive the offset from it.
    #[must_use]
    pub fn with_allocation(mut self, rec: AllocationRecord) -> Self {
        self.offset = Some(self.address as i64 - rec.user_base as i64);
        self.allocation = Some(rec);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: DetectionSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = Some(access);
        self
    }
}

impl std::fmt::Display for Evidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {:#x} ({})", self.kind, self.address, self.source)?;
        if let Some(rec) = &self.allocation {
            write!(f, " in {} byte allocation {}", rec.size, rec.id)?;
        }
        Ok(())
    }
}

/// Verify the record checksum, in-heap header and both guards of `rec`.
#[must_use]
pub fn check_allocation(
    tracker: &PageTracker,
    rec: &AllocationRecord,
    source: DetectionSource,
) -> Option<Evidence> {
    let corrupt = |addr: usize| {
        Some(Evidence::new(ErrorKind::HeapMetadataCorruption, addr, source).with_allocation(rec.clone()))
    };
    if !rec.verify_checksum() {
        return corrupt(rec.block_base);
    }
    let expected = ObjectHeader::compute(rec.block_base, rec.id.packed(), rec.size as u32).to_bytes();
    let Some(header) = tracker.read_vec(rec.block_base, HEADER_SIZE) else {
        return corrupt(rec.block_base);
    };
    if let Some(i) = header.iter().zip(expected.iter()).position(|(a, b)| a != b) {
        return corrupt(rec.block_base + i);
    }
    let overflow = |addr: usize| {
        Some(Evidence::new(ErrorKind::BufferOverflow, addr, source).with_allocation(rec.clone()))
    };
    let pre_base = rec.pre_guard_base();
    let pre = tracker.read_vec(pre_base, PRE_GUARD_SIZE)?;
    if let Some(i) = rec.guard.first_mismatch(pre_base, &pre) {
        return overflow(pre_base + i);
    }
    let post = tracker.read_vec(rec.user_end(), rec.block_end() - rec.user_end())?;
    if let Some(i) = rec.guard.first_mismatch(rec.user_end(), &post) {
        return overflow(rec.user_end() + i);
    }
    None
}

/// Verify a quarantined block: metadata and guards as for a live block, then
/// the free pattern over the payload.
#[must_use]
pub fn check_quarantined(
    tracker: &PageTracker,
    rec: &AllocationRecord,
    source: DetectionSource,
) -> Option<Evidence> {
    if let Some(ev) = check_allocation(tracker, rec, source) {
        return Some(ev);
    }
    let payload = tracker.read_vec(rec.user_base, rec.size)?;
    rec.guard
        .free_pattern()
        .first_mismatch(rec.user_base, &payload)
        .map(|i| {
            Evidence::new(ErrorKind::UseAfterFree, rec.user_base + i, source)
                .with_allocation(rec.clone())
        })
}

/// Byte ranges of `rec` that user code must never write: header and both
/// guards, as `(start, end)` pairs.
#[must_use]
pub fn protected_ranges(rec: &AllocationRecord) -> [(usize, usize); 2] {
    [
        (rec.block_base, rec.user_base),
        (rec.user_end(), rec.block_end()),
    ]
}

pub struct Validator {
    level: AtomicU8,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            level: AtomicU8::new(0),
        }
    }

    #[must_use]
    pub fn level(&self) -> ValidationLevel {
        if self.level.load(Ordering::Acquire) == 0 {
            ValidationLevel::Normal
        } else {
            ValidationLevel::Full
        }
    }

    pub fn set_level(&self, level: ValidationLevel) {
        let v = match level {
            ValidationLevel::Normal => 0,
            ValidationLevel::Full => 1,
        };
        self.level.store(v, Ordering::Release);
    }

    /// Check every live and quarantined block. Results are in address order.
    #[must_use]
    pub fn scan_all(&self, heap: &Heap, source: DetectionSource) -> Vec<Evidence> {
        let tracker = heap.tracker();
        heap.records()
            .iter()
            .filter_map(|rec| match rec.state {
                AllocState::Live => check_allocation(tracker, rec, source),
                AllocState::Quarantined => check_quarantined(tracker, rec, source),
                AllocState::Evicted => None,
            })
            .collect()
    }

    /// Check one instrumented access against headers, guards and freed
    /// payloads. Returns the violation at the lowest address, if any.
    #[must_use]
    pub fn check_access(
        &self,
        heap: &Heap,
        thread: ThreadId,
        addr: usize,
        len: usize,
        access: Access,
    ) -> Option<Evidence> {
        if len == 0 {
            return None;
        }
        let end = addr.saturating_add(len);
        let guarded = heap.tracker().has_guard(addr, len);
        let mut found: Option<Evidence> = None;
        for rec in heap.overlapping(addr, len) {
            if rec.is_live() && !guarded {
                continue;
            }
            let hit = classify(&rec, addr, end, access);
            if let Some((kind, at)) = hit {
                let better = found.as_ref().is_none_or(|f| at < f.address);
                if better {
                    found = Some(
                        Evidence::new(kind, at, DetectionSource::Replay)
                            .with_thread(thread)
                            .with_access(access)
                            .with_allocation(rec),
                    );
                }
            }
        }
        found
    }
}

fn classify(rec: &AllocationRecord, start: usize, end: usize, access: Access) -> Option<(ErrorKind, usize)> {
    let lo = start.max(rec.block_base);
    let hi = end.min(rec.block_end());
    if lo >= hi {
        return None;
    }
    let header_end = rec.block_base + HEADER_SIZE;
    if lo < header_end {
        let kind = match access {
            Access::Write => ErrorKind::HeapMetadataCorruption,
            Access::Read => ErrorKind::BufferOverflow,
        };
        return Some((kind, lo));
    }
    if lo < rec.user_base {
        return Some((ErrorKind::BufferOverflow, lo));
    }
    let payload_hi = hi.min(rec.user_end());
    if lo < payload_hi && !rec.is_live() {
        return Some((ErrorKind::UseAfterFree, lo));
    }
    if hi > rec.user_end() {
        return Some((ErrorKind::BufferOverflow, lo.max(rec.user_end())));
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::TrackingMode;
    use crate::heap::SiteLoc;
    use crate::region::PAGE_SIZE;

    const T0: ThreadId = ThreadId(0);

    fn heap() -> Heap {
        let tracker = Arc::new(PageTracker::new(32 * PAGE_SIZE, TrackingMode::WriteBarrier).unwrap());
        Heap::new(tracker, 1, 32 * PAGE_SIZE, 16, usize::MAX)
    }

    #[test]
    fn untouched_allocations_validate_repeatedly() {
        let h = heap();
        let v = Validator::new();
        for size in [1, 7, 8, 24, 25, 100, 1000] {
            h.malloc(T0, size, SiteLoc::caller()).unwrap();
        }
        for _ in 0..3 {
            assert!(v.scan_all(&h, DetectionSource::Checkpoint).is_empty());
        }
    }

    #[test]
    fn underflow_reports_negative_offset() {
        let h = heap();
        let p = h.malloc(T0, 32, SiteLoc::caller()).unwrap();
        h.tracker().write(p.addr() - 3, &[0], Some(T0));
        let ev = Validator::new().scan_all(&h, DetectionSource::Checkpoint);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, ErrorKind::BufferOverflow);
        assert_eq!(ev[0].offset, Some(-3));
    }

    #[test]
    fn header_smash_is_metadata_corruption() {
        let h = heap();
        let p = h.malloc(T0, 32, SiteLoc::caller()).unwrap();
        let rec = h.find_containing(p.addr()).unwrap();
        h.tracker().write(rec.block_base + 9, &[0x41], Some(T0));
        let ev = check_allocation(h.tracker(), &rec, DetectionSource::Checkpoint).unwrap();
        assert_eq!(ev.kind, ErrorKind::HeapMetadataCorruption);
        assert_eq!(ev.address, rec.block_base + 9);
    }

    #[test]
    fn tampered_record_fails_checksum() {
        let h = heap();
        let p = h.malloc(T0, 32, SiteLoc::caller()).unwrap();
        let mut rec = h.find_containing(p.addr()).unwrap();
        rec.size = 4096;
        let ev = check_allocation(h.tracker(), &rec, DetectionSource::Checkpoint).unwrap();
        assert_eq!(ev.kind, ErrorKind::HeapMetadataCorruption);
    }

    #[test]
    fn quarantined_payload_write_is_use_after_free() {
        let h = heap();
        let p = h.malloc(T0, 32, SiteLoc::caller()).unwrap();
        h.free(T0, p, SiteLoc::caller()).unwrap();
        h.tracker().write(p.addr() + 5, b"hi", Some(T0));
        let ev = Validator::new().scan_all(&h, DetectionSource::Checkpoint);
        assert_eq!(ev[0].kind, ErrorKind::UseAfterFree);
        assert_eq!(ev[0].address, p.addr() + 5);
        assert_eq!(ev[0].offset, Some(5));
    }

    #[test]
    fn access_checks_classify_regions() {
        let h = heap();
        let v = Validator::new();
        let a = h.malloc(T0, 10, SiteLoc::caller()).unwrap();
        let b = h.malloc(T0, 10, SiteLoc::caller()).unwrap();
        assert!(v.check_access(&h, T0, a.addr(), 10, Access::Write).is_none());

        let ev = v.check_access(&h, T0, a.addr() + 8, 4, Access::Write).unwrap();
        assert_eq!((ev.kind, ev.address), (ErrorKind::BufferOverflow, a.addr() + 10));

        let rec_b = h.find_containing(b.addr()).unwrap();
        let ev = v.check_access(&h, T0, rec_b.block_base + 2, 1, Access::Write).unwrap();
        assert_eq!(ev.kind, ErrorKind::HeapMetadataCorruption);
        let ev = v.check_access(&h, T0, rec_b.block_base + 2, 1, Access::Read).unwrap();
        assert_eq!(ev.kind, ErrorKind::BufferOverflow);

        h.free(T0, b, SiteLoc::caller()).unwrap();
        let ev = v.check_access(&h, T0, b.addr() + 1, 1, Access::Read).unwrap();
        assert_eq!(ev.kind, ErrorKind::UseAfterFree);
        assert_eq!(ev.offset, Some(1));
    }

    #[test]
    fn protected_ranges_bracket_payload() {
        let h = heap();
        let p = h.malloc(T0, 20, SiteLoc::caller()).unwrap();
        let rec = h.find_containing(p.addr()).unwrap();
        let [(h0, h1), (t0, t1)] = protected_ranges(&rec);
        assert_eq!((h0, h1), (rec.block_base, p.addr()));
        assert_eq!((t0, t1), (p.addr() + 20, rec.block_end()));
    }
}
