//! Tracked heap: per-thread sub-heaps over the page tracker's region.
//!
//! The region is split into `max_threads` equal sub-heaps. Thread `t`
//! allocates only from sub-heap `t`, with its own bump pointer, size-class
//! free lists and allocation serial, so a deterministic replay of a thread
//! reproduces its allocation addresses exactly.
//!
//! Locking: every sub-heap and every quarantine has its own mutex and no code
//! path holds two of them at once. A cross-thread free updates the owner's
//! record, drops that lock, then queues the block in the freeing thread's
//! quarantine. Evicted blocks go back to their owner's free list only after
//! passing validation.

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{DetectorError, ErrorKind};
use crate::fingerprint::{
    GuardPattern, HEADER_SIZE, ObjectHeader, PRE_GUARD_SIZE, USER_OFFSET, block_size_for,
    record_checksum,
};
use crate::page_tracker::PageTracker;
use crate::quarantine::{Quarantine, QuarantineEntry};
use crate::thread::ThreadId;
use crate::validator::{DetectionSource, Evidence, check_allocation, check_quarantined};

const SERIAL_BITS: u32 = 48;

/// Stable allocation identity: owning thread plus that thread's serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocId {
    pub thread: ThreadId,
    pub serial: u64,
}

impl AllocId {
    /// Packed form stored in the in-heap header.
    #[must_use]
    pub const fn packed(self) -> u64 {
        ((self.thread.0 as u64) << SERIAL_BITS) | (self.serial & ((1 << SERIAL_BITS) - 1))
    }
}

impl std::fmt::Display for AllocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}#{}", self.thread.0, self.serial)
    }
}

/// User-visible pointer into the tracked heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapPtr(pub(crate) usize);

impl HeapPtr {
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Pointer `bytes` past this one. No bounds are implied.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for HeapPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Source location of an allocation or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SiteLoc {
    pub file: &'static str,
    pub line: u32,
}

impl SiteLoc {
    #[must_use]
    pub fn from_location(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Location of the caller (through any `#[track_caller]` frames).
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller())
    }
}

impl std::fmt::Display for SiteLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocState {
    Live,
    Quarantined,
    /// Out of quarantine. The block is either on a free list or retired.
    Evicted,
}

/// Metadata for one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: AllocId,
    pub block_base: usize,
    pub block_size: usize,
    pub user_base: usize,
    pub size: usize,
    pub guard: GuardPattern,
    pub alloc_epoch: u64,
    pub alloc_site: SiteLoc,
    pub freed_by: Option<ThreadId>,
    pub free_epoch: Option<u64>,
    pub free_site: Option<SiteLoc>,
    pub state: AllocState,
    pub checksum: u64,
}

impl AllocationRecord {
    pub(crate) fn new(id: AllocId, block_base: usize, block_size: usize, size: usize, epoch: u64, site: SiteLoc) -> Self {
        let user_base = block_base + USER_OFFSET;
        let mut rec = Self {
            id,
            block_base,
            block_size,
            user_base,
            size,
            guard: GuardPattern::for_allocation(user_base, size, id.serial),
            alloc_epoch: epoch,
            alloc_site: site,
            freed_by: None,
            free_epoch: None,
            free_site: None,
            state: AllocState::Live,
            checksum: 0,
        };
        rec.checksum = rec.compute_checksum();
        rec
    }

    /// Checksum over the fields that never change after allocation.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        record_checksum(&[
            &self.id.packed().to_le_bytes(),
            &(self.block_base as u64).to_le_bytes(),
            &(self.block_size as u64).to_le_bytes(),
            &(self.user_base as u64).to_le_bytes(),
            &(self.size as u64).to_le_bytes(),
            &self.guard.seed().to_le_bytes(),
            &self.alloc_epoch.to_le_bytes(),
        ])
    }

    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    #[must_use]
    pub const fn owner(&self) -> ThreadId {
        self.id.thread
    }

    #[must_use]
    pub const fn user_end(&self) -> usize {
        self.user_base + self.size
    }

    #[must_use]
    pub const fn block_end(&self) -> usize {
        self.block_base + self.block_size
    }

    #[must_use]
    pub const fn pre_guard_base(&self) -> usize {
        self.block_base + HEADER_SIZE
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.block_base && addr < self.block_end()
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.state, AllocState::Live)
    }
}

#[derive(Debug, Clone)]
struct SubHeapState {
    base: usize,
    limit: usize,
    bump: usize,
    next_serial: u64,
    free_lists: BTreeMap<usize, Vec<usize>>,
    /// block base -> serial of the record currently occupying the block.
    by_block: BTreeMap<usize, u64>,
    records: BTreeMap<u64, AllocationRecord>,
}

impl SubHeapState {
    fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            limit: base + len,
            bump: base,
            next_serial: 0,
            free_lists: BTreeMap::new(),
            by_block: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    fn containing(&self, addr: usize) -> Option<&AllocationRecord> {
        let (_, serial) = self.by_block.range(..=addr).next_back()?;
        self.records.get(serial).filter(|r| r.contains(addr))
    }

    fn serial_at_user(&self, user_base: usize) -> Option<u64> {
        let serial = *self.by_block.get(&user_base.checked_sub(USER_OFFSET)?)?;
        self.records
            .get(&serial)
            .filter(|r| r.user_base == user_base)
            .map(|r| r.id.serial)
    }
}

/// Copy of all allocator bookkeeping at a checkpoint.
#[derive(Debug, Clone)]
pub struct HeapSnapshot {
    subheaps: Vec<SubHeapState>,
    quarantines: Vec<Quarantine>,
}

impl HeapSnapshot {
    /// Number of records (all states) captured.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.subheaps.iter().map(|s| s.records.len()).sum()
    }
}

pub struct Heap {
    tracker: Arc<PageTracker>,
    subheaps: Box<[Mutex<SubHeapState>]>,
    quarantines: Box<[Mutex<Quarantine>]>,
    subheap_size: usize,
    epoch: AtomicU64,
}

impl Heap {
    #[must_use]
    pub fn new(
        tracker: Arc<PageTracker>,
        max_threads: usize,
        subheap_size: usize,
        quarantine_entries: usize,
        quarantine_bytes: usize,
    ) -> Self {
        let base = tracker.region().base();
        let subheaps: Vec<_> = (0..max_threads)
            .map(|t| Mutex::new(SubHeapState::new(base + t * subheap_size, subheap_size)))
            .collect();
        let quarantines: Vec<_> = (0..max_threads)
            .map(|_| Mutex::new(Quarantine::new(quarantine_entries, quarantine_bytes)))
            .collect();
        Self {
            tracker,
            subheaps: subheaps.into_boxed_slice(),
            quarantines: quarantines.into_boxed_slice(),
            subheap_size,
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<PageTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.subheaps.len()
    }

    /// Sub-heap (thread) owning `addr`.
    #[must_use]
    pub fn owner_of(&self, addr: usize) -> Option<ThreadId> {
        let region = self.tracker.region();
        if !region.contains(addr) || self.subheap_size == 0 {
            return None;
        }
        let idx = (addr - region.base()) / self.subheap_size;
        (idx < self.subheaps.len()).then(|| ThreadId(idx as u32))
    }

    fn subheap(&self, thread: ThreadId) -> Result<&Mutex<SubHeapState>, DetectorError> {
        self.subheaps
            .get(thread.index())
            .ok_or(DetectorError::UnknownThread(thread))
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes (0 is treated as 1) from `thread`'s sub-heap.
    pub fn malloc(&self, thread: ThreadId, size: usize, site: SiteLoc) -> Result<HeapPtr, DetectorError> {
        let size = size.max(1);
        let exhausted = DetectorError::HeapExhausted {
            thread,
            requested: size,
        };
        if u32::try_from(size).is_err() {
            return Err(exhausted);
        }
        let class = block_size_for(size).ok_or(DetectorError::HeapExhausted {
            thread,
            requested: size,
        })?;
        let mut sub = self.subheap(thread)?.lock();
        let reused = sub.free_lists.get_mut(&class).and_then(Vec::pop);
        let block_base = match reused {
            Some(block) => {
                if let Some(stale) = sub.by_block.remove(&block) {
                    sub.records.remove(&stale);
                }
                self.tracker.clear_guard(block, class);
                block
            }
            None => {
                if sub.bump + class > sub.limit {
                    return Err(exhausted);
                }
                let block = sub.bump;
                sub.bump += class;
                block
            }
        };
        let serial = sub.next_serial;
        sub.next_serial += 1;
        let rec = AllocationRecord::new(
            AllocId { thread, serial },
            block_base,
            class,
            size,
            self.epoch(),
            site,
        );
        self.write_metadata(&rec, Some(thread))?;
        self.tracker.add_live(rec.block_base, rec.block_size);
        let ptr = HeapPtr(rec.user_base);
        sub.by_block.insert(block_base, serial);
        sub.records.insert(serial, rec);
        Ok(ptr)
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn calloc(
        &self,
        thread: ThreadId,
        count: usize,
        size: usize,
        site: SiteLoc,
    ) -> Result<HeapPtr, DetectorError> {
        let total = count.checked_mul(size).ok_or(DetectorError::HeapExhausted {
            thread,
            requested: usize::MAX,
        })?;
        let ptr = self.malloc(thread, total, site)?;
        if !self.tracker.fill(ptr.addr(), 0, total.max(1), Some(thread)) {
            return Err(DetectorError::OutOfRegion {
                addr: ptr.addr(),
                len: total,
            });
        }
        Ok(ptr)
    }

    /// Resize an allocation. Stays in place while the block class still fits.
    pub fn realloc(
        &self,
        thread: ThreadId,
        ptr: Option<HeapPtr>,
        size: usize,
        site: SiteLoc,
    ) -> Result<HeapPtr, DetectorError> {
        let Some(ptr) = ptr else {
            return self.malloc(thread, size, site);
        };
        let size = size.max(1);
        let rec = self.live_record_for_free(thread, ptr)?;
        if let Some(ev) = check_allocation(&self.tracker, &rec, DetectionSource::Free) {
            return Err(DetectorError::detected(ev.with_thread(thread)));
        }
        if block_size_for(size) == Some(rec.block_size) {
            let mut sub = self.subheap(rec.owner())?.lock();
            let Some(slot) = sub.records.get_mut(&rec.id.serial) else {
                return Err(DetectorError::detected(
                    Evidence::new(ErrorKind::DoubleFree, ptr.addr(), DetectionSource::Free)
                        .with_thread(thread),
                ));
            };
            slot.size = size;
            slot.guard = GuardPattern::for_allocation(slot.user_base, size, slot.id.serial);
            slot.checksum = slot.compute_checksum();
            let updated = slot.clone();
            self.write_metadata(&updated, Some(thread))?;
            return Ok(ptr);
        }
        let fresh = self.malloc(thread, size, site)?;
        let keep = rec.size.min(size);
        let bytes = self
            .tracker
            .read_vec(rec.user_base, keep)
            .ok_or(DetectorError::OutOfRegion {
                addr: rec.user_base,
                len: keep,
            })?;
        if !self.tracker.write(fresh.addr(), &bytes, Some(thread)) {
            return Err(DetectorError::OutOfRegion {
                addr: fresh.addr(),
                len: keep,
            });
        }
        self.free(thread, ptr, site)?;
        Ok(fresh)
    }

    fn live_record_for_free(&self, thread: ThreadId, ptr: HeapPtr) -> Result<AllocationRecord, DetectorError> {
        let addr = ptr.addr();
        let invalid = |rec: Option<AllocationRecord>| {
            let mut ev = Evidence::new(ErrorKind::DoubleFree, addr, DetectionSource::Free).with_thread(thread);
            if let Some(rec) = rec {
                ev = ev.with_allocation(rec);
            }
            DetectorError::detected(ev)
        };
        let Some(owner) = self.owner_of(addr) else {
            return Err(invalid(None));
        };
        let sub = self.subheaps[owner.index()].lock();
        let Some(serial) = sub.serial_at_user(addr) else {
            return Err(invalid(sub.containing(addr).cloned()));
        };
        let Some(rec) = sub.records.get(&serial) else {
            return Err(invalid(None));
        };
        if !rec.is_live() {
            return Err(invalid(Some(rec.clone())));
        }
        Ok(rec.clone())
    }

    /// Release an allocation into `thread`'s quarantine.
    ///
    /// The block is validated first; frees of unknown or already-freed
    /// pointers are `DoubleFree` detections. Returns how many quarantined
    /// blocks were recycled as a consequence.
    pub fn free(&self, thread: ThreadId, ptr: HeapPtr, site: SiteLoc) -> Result<usize, DetectorError> {
        let rec = self.live_record_for_free(thread, ptr)?;
        if let Some(ev) = check_allocation(&self.tracker, &rec, DetectionSource::Free) {
            return Err(DetectorError::detected(ev.with_thread(thread)));
        }
        {
            let mut sub = self.subheaps[rec.owner().index()].lock();
            let Some(slot) = sub.records.get_mut(&rec.id.serial) else {
                return Err(DetectorError::detected(
                    Evidence::new(ErrorKind::DoubleFree, ptr.addr(), DetectionSource::Free)
                        .with_thread(thread),
                ));
            };
            if !slot.is_live() {
                // Lost a race against another free of the same pointer.
                return Err(DetectorError::detected(
                    Evidence::new(ErrorKind::DoubleFree, ptr.addr(), DetectionSource::Free)
                        .with_thread(thread)
                        .with_allocation(slot.clone()),
                ));
            }
            slot.state = AllocState::Quarantined;
            slot.freed_by = Some(thread);
            slot.free_epoch = Some(self.epoch());
            slot.free_site = Some(site);
            let poison = slot.guard.free_pattern().bytes(slot.user_base, slot.size);
            self.tracker.write(slot.user_base, &poison, Some(thread));
            self.tracker.remove_live(slot.block_base, slot.block_size);
        }
        let entry = QuarantineEntry {
            id: rec.id,
            bytes: rec.block_size,
        };
        let evicted = self.quarantines[thread.index()].lock().push(entry);
        self.recycle(&evicted)
    }

    /// Validate evicted quarantine entries and return clean blocks to their
    /// owners' free lists. A modified block is retired and reported.
    fn recycle(&self, entries: &[QuarantineEntry]) -> Result<usize, DetectorError> {
        let mut recycled = 0;
        let mut first_detection = None;
        for entry in entries {
            let mut sub = self.subheaps[entry.id.thread.index()].lock();
            let Some(rec) = sub.records.get_mut(&entry.id.serial) else {
                continue;
            };
            if rec.state != AllocState::Quarantined {
                continue;
            }
            rec.state = AllocState::Evicted;
            match check_quarantined(&self.tracker, rec, DetectionSource::QuarantineEviction) {
                Some(ev) => {
                    if first_detection.is_none() {
                        first_detection = Some(ev);
                    }
                }
                None => {
                    let (class, block) = (rec.block_size, rec.block_base);
                    sub.free_lists.entry(class).or_default().push(block);
                    recycled += 1;
                }
            }
        }
        match first_detection {
            Some(ev) => Err(DetectorError::detected(ev)),
            None => Ok(recycled),
        }
    }

    fn write_metadata(&self, rec: &AllocationRecord, writer: Option<ThreadId>) -> Result<(), DetectorError> {
        let header = ObjectHeader::compute(rec.block_base, rec.id.packed(), rec.size as u32);
        let pre = rec.guard.bytes(rec.pre_guard_base(), PRE_GUARD_SIZE);
        let post_len = rec.block_end() - rec.user_end();
        let post = rec.guard.bytes(rec.user_end(), post_len);
        let ok = self.tracker.write(rec.block_base, &header.to_bytes(), writer)
            && self.tracker.write(rec.pre_guard_base(), &pre, writer)
            && self.tracker.write(rec.user_end(), &post, writer);
        if !ok {
            return Err(DetectorError::OutOfRegion {
                addr: rec.block_base,
                len: rec.block_size,
            });
        }
        self.mark_guards(rec);
        Ok(())
    }

    fn mark_guards(&self, rec: &AllocationRecord) {
        self.tracker.mark_guard(rec.block_base, USER_OFFSET);
        self.tracker
            .mark_guard(rec.user_end(), rec.block_end() - rec.user_end());
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Record of the block containing `addr` (header and guards included).
    #[must_use]
    pub fn find_containing(&self, addr: usize) -> Option<AllocationRecord> {
        let owner = self.owner_of(addr)?;
        self.subheaps[owner.index()].lock().containing(addr).cloned()
    }

    /// Records of every block overlapping `[addr, addr + len)`.
    #[must_use]
    pub fn overlapping(&self, addr: usize, len: usize) -> Vec<AllocationRecord> {
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }
        let region = self.tracker.region();
        let end = addr.saturating_add(len).min(region.end());
        let lo = addr.max(region.base());
        if lo >= end {
            return out;
        }
        let (Some(first), Some(last)) = (self.owner_of(lo), self.owner_of(end - 1)) else {
            return out;
        };
        for idx in first.index()..=last.index() {
            let sub = self.subheaps[idx].lock();
            let start = sub
                .by_block
                .range(..=addr)
                .next_back()
                .map_or(sub.base, |(&b, _)| b);
            for (_, serial) in sub.by_block.range(start..end) {
                match sub.records.get(serial) {
                    Some(rec) if rec.block_end() > addr => out.push(rec.clone()),
                    _ => {}
                }
            }
        }
        out
    }

    #[must_use]
    pub fn record(&self, id: AllocId) -> Option<AllocationRecord> {
        self.subheaps
            .get(id.thread.index())?
            .lock()
            .records
            .get(&id.serial)
            .cloned()
    }

    /// Every record currently occupying a block, ordered by address.
    #[must_use]
    pub fn records(&self) -> Vec<AllocationRecord> {
        let mut out = Vec::new();
        for sub in self.subheaps.iter() {
            let sub = sub.lock();
            out.extend(
                sub.by_block
                    .values()
                    .filter_map(|serial| sub.records.get(serial).cloned()),
            );
        }
        out
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.count_state(AllocState::Live)
    }

    #[must_use]
    pub fn quarantined_count(&self) -> usize {
        self.count_state(AllocState::Quarantined)
    }

    fn count_state(&self, state: AllocState) -> usize {
        self.subheaps
            .iter()
            .map(|s| s.lock().records.values().filter(|r| r.state == state).count())
            .sum()
    }

    /// Entries currently quarantined by `thread`.
    #[must_use]
    pub fn quarantine_len(&self, thread: ThreadId) -> usize {
        self.quarantines
            .get(thread.index())
            .map_or(0, |q| q.lock().len())
    }

    // -----------------------------------------------------------------------
    // Checkpoint and recovery support (callers hold quiescence)
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> HeapSnapshot {
        HeapSnapshot {
            subheaps: self.subheaps.iter().map(|s| s.lock().clone()).collect(),
            quarantines: self.quarantines.iter().map(|q| q.lock().clone()).collect(),
        }
    }

    /// Reinstate `snapshot` and rebuild the tracker's guard bitmap and live
    /// counts from the restored records.
    pub fn restore(&self, snapshot: &HeapSnapshot) {
        for (cell, state) in self.subheaps.iter().zip(&snapshot.subheaps) {
            *cell.lock() = state.clone();
        }
        for (cell, q) in self.quarantines.iter().zip(&snapshot.quarantines) {
            *cell.lock() = q.clone();
        }
        self.rebuild_metadata();
    }

    pub fn rebuild_metadata(&self) {
        self.tracker.reset_metadata();
        for sub in self.subheaps.iter() {
            let sub = sub.lock();
            for rec in sub.by_block.values().filter_map(|s| sub.records.get(s)) {
                self.mark_guards(rec);
                if rec.is_live() {
                    self.tracker.add_live(rec.block_base, rec.block_size);
                }
            }
        }
    }

    /// Retire an allocation: it leaves quarantine and its block is never
    /// reused.
    pub fn evict(&self, id: AllocId) -> bool {
        {
            let Some(cell) = self.subheaps.get(id.thread.index()) else {
                return false;
            };
            let mut sub = cell.lock();
            let Some(rec) = sub.records.get_mut(&id.serial) else {
                return false;
            };
            if rec.is_live() {
                self.tracker.remove_live(rec.block_base, rec.block_size);
            }
            rec.state = AllocState::Evicted;
            let (class, block) = (rec.block_size, rec.block_base);
            if let Some(list) = sub.free_lists.get_mut(&class) {
                list.retain(|&b| b != block);
            }
        }
        for q in self.quarantines.iter() {
            q.lock().remove(id);
        }
        true
    }

    /// Rewrite the header, guards and record checksum of `id` (and the free
    /// pattern of a quarantined payload).
    pub fn repair(&self, id: AllocId) -> Result<bool, DetectorError> {
        let Some(cell) = self.subheaps.get(id.thread.index()) else {
            return Ok(false);
        };
        let mut sub = cell.lock();
        let Some(rec) = sub.records.get_mut(&id.serial) else {
            return Ok(false);
        };
        rec.checksum = rec.compute_checksum();
        let rec = rec.clone();
        drop(sub);
        self.write_metadata(&rec, None)?;
        if rec.state == AllocState::Quarantined {
            let poison = rec.guard.free_pattern().bytes(rec.user_base, rec.size);
            self.tracker.write(rec.user_base, &poison, None);
        }
        Ok(true)
    }
}
