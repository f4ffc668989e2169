//! Anonymous mmap'd memory regions.
//!
//! A [`Region`] backs both the tracked heap and the bootstrap arena. All raw
//! memory access in the engine funnels through the bounds-checked `read`,
//! `write` and `fill` helpers here.

#![allow(unsafe_code)]

use std::io;

/// Page size used for tracking and protection.
pub const PAGE_SIZE: usize = 4096;

/// Page access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

impl Protection {
    const fn as_prot(self) -> libc::c_int {
        match self {
            Self::ReadOnly => libc::PROT_READ,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Page-aligned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct Region {
    base: usize,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent access
// is coordinated by the page tracker and heap locks.
unsafe impl Send for Region {}
// SAFETY: see above.
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` bytes (rounded up to whole pages), read-write.
    pub fn map(len: usize) -> io::Result<Self> {
        let len = round_up_to_page(len.max(PAGE_SIZE));
        // SAFETY: anonymous private mapping with no address hint; the result is
        // checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: ptr as usize,
            len,
        })
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.len / PAGE_SIZE
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    #[must_use]
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Page number (relative to the region) holding `addr`.
    #[must_use]
    pub const fn page_of(&self, addr: usize) -> usize {
        (addr - self.base) / PAGE_SIZE
    }

    #[must_use]
    pub const fn page_base(&self, page: usize) -> usize {
        self.base + page * PAGE_SIZE
    }

    /// Change protection of `count` pages starting at `page`.
    pub fn protect(&self, page: usize, count: usize, prot: Protection) -> io::Result<()> {
        if count == 0 {
            return Ok(());
        }
        if page + count > self.page_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page range outside region",
            ));
        }
        if protect_raw(self.page_base(page), count * PAGE_SIZE, prot) {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Copy `buf.len()` bytes out of the region.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> bool {
        if !self.contains_range(addr, buf.len()) {
            return false;
        }
        // SAFETY: range checked above; the mapping lives as long as `self`.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        true
    }

    /// Copy `bytes` into the region. Caller must have made the pages writable.
    pub fn write(&self, addr: usize, bytes: &[u8]) -> bool {
        if !self.contains_range(addr, bytes.len()) {
            return false;
        }
        // SAFETY: range checked above; writability is the caller's contract.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        true
    }

    /// Fill `len` bytes with `byte`. Caller must have made the pages writable.
    pub fn fill(&self, addr: usize, byte: u8, len: usize) -> bool {
        if !self.contains_range(addr, len) {
            return false;
        }
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, byte, len) };
        true
    }

    /// Copy a whole page between two addresses inside mapped memory.
    ///
    /// # Safety
    /// Both `src` and `dst` must be page-sized, readable (and `dst` writable),
    /// non-overlapping mapped ranges.
    pub unsafe fn copy_page(src: usize, dst: usize) {
        // SAFETY: forwarded to the caller.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PAGE_SIZE) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range mapped in `map`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// `mprotect` without allocation; safe to call from a signal handler.
pub fn protect_raw(addr: usize, len: usize, prot: Protection) -> bool {
    // SAFETY: callers pass page-aligned ranges inside a live mapping.
    unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.as_prot()) == 0 }
}

#[must_use]
pub const fn round_up_to_page(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_rounds_to_pages() {
        let r = Region::map(PAGE_SIZE + 1).unwrap();
        assert_eq!(r.len(), 2 * PAGE_SIZE);
        assert_eq!(r.base() % PAGE_SIZE, 0);
        assert_eq!(r.page_count(), 2);
    }

    #[test]
    fn read_write_roundtrip_and_bounds() {
        let r = Region::map(PAGE_SIZE).unwrap();
        assert!(r.write(r.base() + 10, b"hello"));
        let mut buf = [0u8; 5];
        assert!(r.read(r.base() + 10, &mut buf));
        assert_eq!(&buf, b"hello");
        assert!(!r.write(r.end() - 2, b"abc"));
        assert!(!r.read(r.base() - 1, &mut buf));
        assert!(!r.contains_range(usize::MAX - 1, 4));
    }

    #[test]
    fn page_arithmetic() {
        let r = Region::map(4 * PAGE_SIZE).unwrap();
        assert_eq!(r.page_of(r.base()), 0);
        assert_eq!(r.page_of(r.base() + 2 * PAGE_SIZE + 7), 2);
        assert_eq!(r.page_base(3), r.base() + 3 * PAGE_SIZE);
    }

    #[test]
    fn protect_rejects_out_of_range() {
        let r = Region::map(2 * PAGE_SIZE).unwrap();
        assert!(r.protect(0, 2, Protection::ReadOnly).is_ok());
        assert!(r.protect(0, 2, Protection::ReadWrite).is_ok());
        assert!(r.protect(1, 2, Protection::ReadOnly).is_err());
    }
}
