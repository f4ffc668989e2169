//! Fixed-size bump arena for engine metadata.
//!
//! Memory handed out here never moves and is never freed individually; the
//! whole arena is unmapped on drop. Running out is unrecoverable: [`carve`]
//! aborts the process. Twin-page storage is carved from here once, up front,
//! so the fault path never allocates.
//!
//! [`carve`]: BootstrapArena::carve

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::region::Region;

/// Bump allocator over one mapping.
#[derive(Debug)]
pub struct BootstrapArena {
    region: Region,
    next: AtomicUsize,
}

impl BootstrapArena {
    /// Reserve an arena of `len` bytes (rounded up to whole pages).
    pub fn new(len: usize) -> io::Result<Self> {
        Ok(Self {
            region: Region::map(len)?,
            next: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.region.len())
    }

    /// Carve `len` bytes aligned to `align` (a power of two), or `None` when
    /// the arena cannot satisfy the request.
    pub fn try_carve(&self, len: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let base = self.region.base();
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            let start = (base + cur).next_multiple_of(align) - base;
            let end = start.checked_add(len)?;
            if end > self.region.len() {
                return None;
            }
            match self
                .next
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return NonNull::new((base + start) as *mut u8),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Carve memory or abort: exhaustion of the bootstrap arena is fatal.
    pub fn carve(&self, len: usize, align: usize) -> NonNull<u8> {
        match self.try_carve(len, align) {
            Some(p) => p,
            None => fatal(&format!(
                "bootstrap arena exhausted: requested {len} bytes, {} of {} used",
                self.used(),
                self.capacity()
            )),
        }
    }
}

/// Print `message` and abort. Used for unrecoverable engine states.
pub fn fatal(message: &str) -> ! {
    eprintln!("rollguard: fatal: {message}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PAGE_SIZE;

    #[test]
    fn carve_respects_alignment() {
        let arena = BootstrapArena::new(4 * PAGE_SIZE).unwrap();
        let a = arena.try_carve(3, 1).unwrap();
        let b = arena.try_carve(64, 64).unwrap();
        assert_eq!(b.as_ptr() as usize % 64, 0);
        assert!(b.as_ptr() as usize > a.as_ptr() as usize);
        let p = arena.try_carve(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn try_carve_reports_exhaustion() {
        let arena = BootstrapArena::new(PAGE_SIZE).unwrap();
        assert!(arena.try_carve(PAGE_SIZE, 1).is_some());
        assert!(arena.try_carve(1, 1).is_none());
        assert_eq!(arena.used(), PAGE_SIZE);
    }

    #[test]
    fn concurrent_carves_do_not_overlap() {
        let arena = std::sync::Arc::new(BootstrapArena::new(64 * PAGE_SIZE).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = std::sync::Arc::clone(&arena);
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| arena.try_carve(128, 16).unwrap().as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= 128, "overlapping carves");
        }
    }
}
