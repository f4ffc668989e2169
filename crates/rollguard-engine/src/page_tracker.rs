//! Page-granularity dirty tracking with copy-on-write twins.
//!
//! Every heap page carries a small state machine:
//!
//! ```text
//!   CLEAN --CAS--> CAPTURING --copy twin, unprotect--> DIRTY
//!     ^                                                  |
//!     +------------------ seal / restore ----------------+
//! ```
//!
//! The first write to a CLEAN page after a checkpoint wins the CAS, copies
//! the page into its twin slot and publishes DIRTY. Concurrent writers that
//! lose the CAS spin until DIRTY is visible. The transition takes no lock and
//! allocates nothing, so it runs unchanged inside the SIGSEGV handler.
//!
//! Twin slots are carved once from a [`BootstrapArena`]: slot `n` belongs to
//! page `n` for the tracker's whole lifetime.

#![allow(unsafe_code)]

use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::bootstrap::BootstrapArena;
use crate::config::TrackingMode;
use crate::region::{PAGE_SIZE, Protection, Region, protect_raw};
use crate::thread::ThreadId;

const WORD: usize = 8;
const WORDS_PER_PAGE: usize = PAGE_SIZE / WORD;
const BITMAP_WORDS: usize = WORDS_PER_PAGE / 64;
const NO_WRITER: u32 = u32::MAX;

const STATE_CLEAN: u8 = 0;
const STATE_CAPTURING: u8 = 1;
const STATE_DIRTY: u8 = 2;

/// Snapshot state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Bit-identical to the checkpoint; no twin.
    Clean,
    /// A writer is copying the twin right now.
    Capturing,
    /// Written since the checkpoint; the twin holds the checkpoint bytes.
    Dirty,
}

impl PageState {
    const fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLEAN => Self::Clean,
            STATE_CAPTURING => Self::Capturing,
            _ => Self::Dirty,
        }
    }
}

/// Per-page record, indexed by page number.
pub struct PageInfo {
    number: usize,
    base: usize,
    twin: usize,
    state: AtomicU8,
    version: AtomicU64,
    /// One bit per 8-byte word holding guard or header bytes.
    guard_bits: [AtomicU64; BITMAP_WORDS],
    live_objects: AtomicU32,
    first_writer: AtomicU32,
    shared: AtomicBool,
}

impl PageInfo {
    fn new(number: usize, base: usize, twin: usize) -> Self {
        Self {
            number,
            base,
            twin,
            state: AtomicU8::new(STATE_CLEAN),
            version: AtomicU64::new(0),
            guard_bits: std::array::from_fn(|_| AtomicU64::new(0)),
            live_objects: AtomicU32::new(0),
            first_writer: AtomicU32::new(NO_WRITER),
            shared: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of twins captured for this page so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn has_twin(&self) -> bool {
        self.state() == PageState::Dirty
    }

    /// Written by more than one thread since the last checkpoint.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Backs at least one live object.
    #[must_use]
    pub fn is_alloced(&self) -> bool {
        self.live_objects.load(Ordering::Relaxed) > 0
    }

    fn note_writer(&self, writer: ThreadId) {
        let prev = self.first_writer.compare_exchange(
            NO_WRITER,
            writer.0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        if matches!(prev, Err(other) if other != writer.0) {
            self.shared.store(true, Ordering::Relaxed);
        }
    }

    fn reset_writers(&self) {
        self.first_writer.store(NO_WRITER, Ordering::Relaxed);
        self.shared.store(false, Ordering::Relaxed);
    }
}

/// Owner of the tracked heap region and its PageInfo table.
pub struct PageTracker {
    region: Region,
    pages: Box<[PageInfo]>,
    // Keeps the twin slots mapped.
    _twins: BootstrapArena,
    protect: bool,
    faults: AtomicU64,
    captures: AtomicU64,
}

impl PageTracker {
    /// Map a heap region of `len` bytes and preallocate one twin slot per page.
    pub fn new(len: usize, mode: TrackingMode) -> io::Result<Self> {
        let region = Region::map(len)?;
        let count = region.page_count();
        let twins = BootstrapArena::new(count * PAGE_SIZE)?;
        let twin_base = twins.carve(count * PAGE_SIZE, PAGE_SIZE).as_ptr() as usize;
        let pages: Vec<PageInfo> = (0..count)
            .map(|n| PageInfo::new(n, region.page_base(n), twin_base + n * PAGE_SIZE))
            .collect();
        Ok(Self {
            region,
            pages: pages.into_boxed_slice(),
            _twins: twins,
            protect: mode.protects_pages(),
            faults: AtomicU64::new(0),
            captures: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    #[must_use]
    pub fn page(&self, number: usize) -> Option<&PageInfo> {
        self.pages.get(number)
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn protects_pages(&self) -> bool {
        self.protect
    }

    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Arming and fault resolution
    // -----------------------------------------------------------------------

    /// Mark `pages` CLEAN and, in page-protection mode, read-only.
    pub fn arm(&self, pages: Range<usize>) -> io::Result<()> {
        let pages = pages.start.min(self.pages.len())..pages.end.min(self.pages.len());
        for info in &self.pages[pages.clone()] {
            info.state.store(STATE_CLEAN, Ordering::Release);
            info.reset_writers();
        }
        if self.protect {
            self.region
                .protect(pages.start, pages.len(), Protection::ReadOnly)?;
        }
        Ok(())
    }

    pub fn arm_all(&self) -> io::Result<()> {
        self.arm(0..self.pages.len())
    }

    /// Resolve a first write to the page holding `addr`.
    ///
    /// Returns `false` when `addr` is not tracked here or unprotecting the
    /// page failed. Async-signal-safe.
    pub fn on_fault(&self, addr: usize) -> bool {
        if !self.region.contains(addr) {
            return false;
        }
        let info = &self.pages[self.region.page_of(addr)];
        self.faults.fetch_add(1, Ordering::Relaxed);
        loop {
            match info.state.compare_exchange(
                STATE_CLEAN,
                STATE_CAPTURING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.capture(info),
                Err(STATE_CAPTURING) => std::hint::spin_loop(),
                Err(_) => return true,
            }
        }
    }

    fn capture(&self, info: &PageInfo) -> bool {
        // SAFETY: `info.base` is a readable page of our region and `info.twin`
        // its dedicated, writable twin slot; the two never overlap. Only the
        // CAS winner reaches this point, so the slot has a single writer.
        unsafe { Region::copy_page(info.base, info.twin) };
        let writable = !self.protect || protect_raw(info.base, PAGE_SIZE, Protection::ReadWrite);
        info.version.fetch_add(1, Ordering::Relaxed);
        self.captures.fetch_add(1, Ordering::Relaxed);
        info.state.store(STATE_DIRTY, Ordering::Release);
        writable
    }

    /// Capture twins for every page `[addr, addr + len)` touches.
    ///
    /// Instrumented writes call this before copying so they never take the
    /// signal path. Returns `false` if the range leaves the region.
    pub fn before_write(&self, addr: usize, len: usize, writer: Option<ThreadId>) -> bool {
        if len == 0 {
            return true;
        }
        if !self.region.contains_range(addr, len) {
            return false;
        }
        let first = self.region.page_of(addr);
        let last = self.region.page_of(addr + len - 1);
        for info in &self.pages[first..=last] {
            if info.state.load(Ordering::Acquire) != STATE_DIRTY {
                self.on_fault(info.base);
            }
            if let Some(w) = writer {
                info.note_writer(w);
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Memory access
    // -----------------------------------------------------------------------

    /// Tracked write: captures twins, then copies `bytes`.
    pub fn write(&self, addr: usize, bytes: &[u8], writer: Option<ThreadId>) -> bool {
        self.before_write(addr, bytes.len(), writer) && self.region.write(addr, bytes)
    }

    /// Tracked fill.
    pub fn fill(&self, addr: usize, byte: u8, len: usize, writer: Option<ThreadId>) -> bool {
        self.before_write(addr, len, writer) && self.region.fill(addr, byte, len)
    }

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> bool {
        self.region.read(addr, buf)
    }

    /// Read `len` bytes into a fresh vector, or `None` outside the region.
    #[must_use]
    pub fn read_vec(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.region.read(addr, &mut buf).then_some(buf)
    }

    // -----------------------------------------------------------------------
    // Checkpoint support (callers hold quiescence)
    // -----------------------------------------------------------------------

    /// Page numbers that currently own a twin.
    #[must_use]
    pub fn enumerate_dirty(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.state.load(Ordering::Acquire) == STATE_DIRTY)
            .map(|p| p.number)
            .collect()
    }

    /// Copy of the twin of `page`, if it has one.
    #[must_use]
    pub fn twin(&self, page: usize) -> Option<Vec<u8>> {
        let info = self.pages.get(page)?;
        if info.state.load(Ordering::Acquire) != STATE_DIRTY {
            return None;
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        // SAFETY: the twin slot is a mapped page owned by this tracker.
        unsafe {
            std::ptr::copy_nonoverlapping(info.twin as *const u8, buf.as_mut_ptr(), PAGE_SIZE)
        };
        Some(buf)
    }

    /// Copy the twin back over `page` and discard it. Returns whether the page
    /// was dirty.
    pub fn restore(&self, page: usize) -> io::Result<bool> {
        let Some(info) = self.pages.get(page) else {
            return Ok(false);
        };
        if info.state.load(Ordering::Acquire) != STATE_DIRTY {
            return Ok(false);
        }
        if self.protect {
            self.region.protect(page, 1, Protection::ReadWrite)?;
        }
        // SAFETY: twin slot and page are distinct mapped pages; the page was
        // just made writable and all threads are quiesced.
        unsafe { Region::copy_page(info.twin, info.base) };
        info.state.store(STATE_CLEAN, Ordering::Release);
        info.reset_writers();
        if self.protect {
            self.region.protect(page, 1, Protection::ReadOnly)?;
        }
        Ok(true)
    }

    /// Restore every dirty page. Returns how many were restored.
    pub fn restore_all_dirty(&self) -> io::Result<usize> {
        let mut restored = 0;
        for page in self.enumerate_dirty() {
            if self.restore(page)? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Discard all twins and re-arm every page for the next epoch. Returns
    /// the number of twins discarded.
    pub fn seal(&self) -> io::Result<usize> {
        let dirty = self.enumerate_dirty().len();
        self.arm_all()?;
        Ok(dirty)
    }

    // -----------------------------------------------------------------------
    // Canary bitmap and live-object counts
    // -----------------------------------------------------------------------

    fn word_span(&self, addr: usize, len: usize) -> Option<Range<usize>> {
        if len == 0 || !self.region.contains_range(addr, len) {
            return None;
        }
        let first = (addr - self.region.base()) / WORD;
        let last = (addr + len - 1 - self.region.base()) / WORD;
        Some(first..last + 1)
    }

    fn guard_bit(&self, word: usize) -> (&AtomicU64, u64) {
        let info = &self.pages[word / WORDS_PER_PAGE];
        let within = word % WORDS_PER_PAGE;
        (&info.guard_bits[within / 64], 1u64 << (within % 64))
    }

    /// Mark every word overlapping `[addr, addr + len)` as guard/header.
    pub fn mark_guard(&self, addr: usize, len: usize) {
        for word in self.word_span(addr, len).unwrap_or(0..0) {
            let (cell, bit) = self.guard_bit(word);
            cell.fetch_or(bit, Ordering::Relaxed);
        }
    }

    pub fn clear_guard(&self, addr: usize, len: usize) {
        for word in self.word_span(addr, len).unwrap_or(0..0) {
            let (cell, bit) = self.guard_bit(word);
            cell.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    /// Whether any word overlapping the range is marked.
    #[must_use]
    pub fn has_guard(&self, addr: usize, len: usize) -> bool {
        self.word_span(addr, len).is_some_and(|mut words| {
            words.any(|word| {
                let (cell, bit) = self.guard_bit(word);
                cell.load(Ordering::Relaxed) & bit != 0
            })
        })
    }

    pub fn add_live(&self, addr: usize, len: usize) {
        for info in self.pages_covering(addr, len) {
            info.live_objects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn remove_live(&self, addr: usize, len: usize) {
        for info in self.pages_covering(addr, len) {
            let _ = info.live_objects.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        }
    }

    /// Forget all guard marks and live counts (before rebuilding them).
    pub fn reset_metadata(&self) {
        for info in self.pages.iter() {
            for cell in &info.guard_bits {
                cell.store(0, Ordering::Relaxed);
            }
            info.live_objects.store(0, Ordering::Relaxed);
        }
    }

    fn pages_covering(&self, addr: usize, len: usize) -> &[PageInfo] {
        if len == 0 || !self.region.contains_range(addr, len) {
            return &[];
        }
        let first = self.region.page_of(addr);
        let last = self.region.page_of(addr + len - 1);
        &self.pages[first..=last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(pages: usize) -> PageTracker {
        PageTracker::new(pages * PAGE_SIZE, TrackingMode::WriteBarrier).unwrap()
    }

    #[test]
    fn first_write_captures_twin_once() {
        let t = tracker(4);
        let base = t.region().base();
        assert!(t.write(base + 8, &[1, 2, 3], None));
        t.seal().unwrap();
        assert!(t.enumerate_dirty().is_empty());

        assert!(t.write(base + 8, &[9, 9, 9], None));
        assert!(t.write(base + 100, &[7], None));
        assert_eq!(t.enumerate_dirty(), vec![0]);
        assert_eq!(t.page(0).unwrap().version(), 2);
        let twin = t.twin(0).unwrap();
        assert_eq!(&twin[8..11], &[1, 2, 3]);
        assert_eq!(twin[100], 0);
    }

    #[test]
    fn restore_returns_page_to_twin_content() {
        let t = tracker(2);
        let base = t.region().base();
        t.write(base, &[0xAB; 64], None);
        t.seal().unwrap();
        let before = t.read_vec(base, PAGE_SIZE).unwrap();

        t.write(base + 10, &[0x11; 200], None);
        assert!(t.restore(0).unwrap());
        assert_eq!(t.read_vec(base, PAGE_SIZE).unwrap(), before);
        assert_eq!(t.page(0).unwrap().state(), PageState::Clean);
        assert!(!t.restore(0).unwrap());
    }

    #[test]
    fn writes_spanning_pages_dirty_both() {
        let t = tracker(3);
        let base = t.region().base();
        t.write(base + PAGE_SIZE - 4, &[5; 8], None);
        assert_eq!(t.enumerate_dirty(), vec![0, 1]);
        assert!(!t.write(base + 3 * PAGE_SIZE - 2, &[1; 4], None));
    }

    #[test]
    fn shared_flag_tracks_distinct_writers() {
        let t = tracker(2);
        let base = t.region().base();
        t.write(base, &[1], Some(ThreadId(0)));
        assert!(!t.page(0).unwrap().is_shared());
        t.write(base + 1, &[1], Some(ThreadId(0)));
        assert!(!t.page(0).unwrap().is_shared());
        t.write(base + 2, &[1], Some(ThreadId(1)));
        assert!(t.page(0).unwrap().is_shared());
        t.seal().unwrap();
        assert!(!t.page(0).unwrap().is_shared());
    }

    #[test]
    fn guard_bitmap_marks_words() {
        let t = tracker(2);
        let base = t.region().base();
        t.mark_guard(base + 16, 16);
        assert!(t.has_guard(base + 16, 1));
        assert!(t.has_guard(base + 20, 20));
        assert!(!t.has_guard(base, 16));
        assert!(!t.has_guard(base + 32, 8));
        t.clear_guard(base + 16, 8);
        assert!(!t.has_guard(base + 16, 8));
        assert!(t.has_guard(base + 24, 8));
        t.reset_metadata();
        assert!(!t.has_guard(base, PAGE_SIZE));
    }

    #[test]
    fn live_counts_drive_alloced_flag() {
        let t = tracker(2);
        let base = t.region().base();
        t.add_live(base + PAGE_SIZE - 8, 16);
        assert!(t.page(0).unwrap().is_alloced());
        assert!(t.page(1).unwrap().is_alloced());
        t.remove_live(base + PAGE_SIZE - 8, 16);
        assert!(!t.page(1).unwrap().is_alloced());
    }

    #[test]
    fn concurrent_first_writes_capture_exactly_once() {
        let t = std::sync::Arc::new(tracker(1));
        let base = t.region().base();
        t.write(base, &[0x42; PAGE_SIZE], None);
        t.seal().unwrap();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let t = std::sync::Arc::clone(&t);
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    t.write(base + usize::from(i) * 64, &[i; 64], Some(ThreadId(u32::from(i))));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.page(0).unwrap().version(), 2);
        assert_eq!(t.twin(0).unwrap(), vec![0x42; PAGE_SIZE]);
        assert!(t.page(0).unwrap().is_shared());
    }
}
