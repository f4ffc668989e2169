//! SIGSEGV routing for page-protection tracking.
//!
//! Trackers register themselves in a fixed static table; the handler walks
//! the table, lets the tracker owning the faulting address capture its twin,
//! and returns so the faulting store re-executes. Faults outside every
//! tracked region go to whatever handler was installed before us (the Rust
//! runtime's stack-overflow handler, typically), or to the default action.
//!
//! The handler path takes no lock and allocates nothing.

#![allow(unsafe_code)]

use std::ffi::{c_int, c_void};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::page_tracker::PageTracker;

/// Upper bound on simultaneously registered trackers.
pub const MAX_TRACKERS: usize = 16;

static TRACKERS: [AtomicPtr<PageTracker>; MAX_TRACKERS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_TRACKERS];

/// Handlers currently inside each slot. A registration is not released
/// while its slot is in use.
static IN_FLIGHT: [AtomicUsize; MAX_TRACKERS] = [const { AtomicUsize::new(0) }; MAX_TRACKERS];

static PREVIOUS: OnceLock<Result<PreviousAction, i32>> = OnceLock::new();

struct PreviousAction(libc::sigaction);

// SAFETY: the saved sigaction is plain data written once before any reader.
unsafe impl Send for PreviousAction {}
// SAFETY: see above.
unsafe impl Sync for PreviousAction {}

/// Keeps a tracker routed to the fault handler; unregisters on drop.
pub struct FaultRegistration {
    slot: usize,
    _tracker: Arc<PageTracker>,
}

impl std::fmt::Debug for FaultRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultRegistration")
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for FaultRegistration {
    fn drop(&mut self) {
        TRACKERS[self.slot].store(ptr::null_mut(), Ordering::SeqCst);
        // A handler that loaded the pointer before the store above has
        // already bumped the counter; wait it out before the Arc goes.
        while IN_FLIGHT[self.slot].load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
    }
}

/// Install the handler (once per process) and route faults in `tracker`'s
/// region to it.
pub fn register(tracker: &Arc<PageTracker>) -> io::Result<FaultRegistration> {
    install()?;
    let raw = Arc::as_ptr(tracker).cast_mut();
    for (slot, cell) in TRACKERS.iter().enumerate() {
        if cell
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(FaultRegistration {
                slot,
                _tracker: Arc::clone(tracker),
            });
        }
    }
    Err(io::Error::other(format!(
        "fault handler table full ({MAX_TRACKERS} trackers)"
    )))
}

/// Whether the SIGSEGV handler has been installed successfully.
#[must_use]
pub fn installed() -> bool {
    matches!(PREVIOUS.get(), Some(Ok(_)))
}

/// Number of trackers currently registered.
#[must_use]
pub fn registered() -> usize {
    TRACKERS
        .iter()
        .filter(|c| !c.load(Ordering::Acquire).is_null())
        .count()
}

/// Install the process-wide SIGSEGV handler. Idempotent.
pub fn install() -> io::Result<()> {
    let result = PREVIOUS.get_or_init(|| {
        // SAFETY: zeroed sigaction is a valid "no handler, empty mask" value;
        // the fields we rely on are filled in below before the call.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = on_fault;
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        // SAFETY: `action.sa_mask` is a valid sigset_t we own.
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        // SAFETY: as above.
        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: both pointers reference live, initialized sigaction values.
        let rc = unsafe { libc::sigaction(libc::SIGSEGV, &action, &mut previous) };
        if rc == 0 {
            Ok(PreviousAction(previous))
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        }
    });
    match result {
        Ok(_) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(*errno)),
    }
}

extern "C" fn on_fault(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;
    for (slot, cell) in TRACKERS.iter().enumerate() {
        match visit(slot, cell, addr) {
            Visit::Miss => {}
            Visit::Handled => return,
            Visit::Foreign => break,
        }
    }
    chain(sig, info, ctx);
}

enum Visit {
    /// Slot empty or the address is outside its region.
    Miss,
    Handled,
    /// Inside a tracked region but not a capturable first write.
    Foreign,
}

fn visit(slot: usize, cell: &AtomicPtr<PageTracker>, addr: usize) -> Visit {
    IN_FLIGHT[slot].fetch_add(1, Ordering::SeqCst);
    let tracker = cell.load(Ordering::SeqCst);
    let visit = if tracker.is_null() {
        Visit::Miss
    } else {
        // SAFETY: the pointer was loaded after our in-flight increment, so
        // the registration's drop waits for us before releasing its Arc.
        let tracker = unsafe { &*tracker };
        if !tracker.contains(addr) {
            Visit::Miss
        } else if tracker.on_fault(addr) {
            Visit::Handled
        } else {
            Visit::Foreign
        }
    };
    IN_FLIGHT[slot].fetch_sub(1, Ordering::SeqCst);
    visit
}

fn chain(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let Some(Ok(PreviousAction(prev))) = PREVIOUS.get() else {
        reset_to_default(sig);
        return;
    };
    let handler = prev.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        // Returning re-executes the faulting instruction under the default
        // action, which terminates the process with the expected signal.
        reset_to_default(sig);
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: the previous handler was registered with SA_SIGINFO, so it
        // has the three-argument signature.
        let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { std::mem::transmute(handler) };
        f(sig, info, ctx);
    } else {
        // SAFETY: a non-SA_SIGINFO handler has the one-argument signature.
        let f: extern "C" fn(c_int) = unsafe { std::mem::transmute(handler) };
        f(sig);
    }
}

fn reset_to_default(sig: c_int) {
    // SAFETY: restoring SIG_DFL is async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackingMode;
    use crate::page_tracker::PageState;
    use crate::region::PAGE_SIZE;

    #[test]
    fn protected_store_captures_twin_and_resumes() {
        let tracker = Arc::new(PageTracker::new(4 * PAGE_SIZE, TrackingMode::PageProtection).unwrap());
        let base = tracker.region().base();
        assert!(tracker.write(base + 1, &[0x5A], None));
        let reg = register(&tracker).unwrap();
        assert!(installed());
        tracker.arm_all().unwrap();

        // SAFETY: `base + 1` lies inside the tracker's mapping; the page is
        // read-only, so the store faults and the handler unprotects it.
        unsafe { ptr::write_volatile((base + 1) as *mut u8, 0x77) };

        assert_eq!(tracker.page(0).unwrap().state(), PageState::Dirty);
        assert_eq!(tracker.twin(0).unwrap()[1], 0x5A);
        assert_eq!(tracker.read_vec(base + 1, 1).unwrap(), vec![0x77]);
        assert_eq!(tracker.enumerate_dirty(), vec![0]);

        assert!(tracker.restore(0).unwrap());
        assert_eq!(tracker.read_vec(base + 1, 1).unwrap(), vec![0x5A]);
        drop(reg);
    }

    #[test]
    fn registration_slot_is_released_on_drop() {
        let tracker = Arc::new(PageTracker::new(PAGE_SIZE, TrackingMode::PageProtection).unwrap());
        let reg = register(&tracker).unwrap();
        let slot = reg.slot;
        assert!(!TRACKERS[slot].load(Ordering::Acquire).is_null());
        drop(reg);
        assert!(TRACKERS[slot].load(Ordering::Acquire).is_null());
    }

    #[test]
    fn drop_waits_for_handler_inside_the_slot() {
        let tracker = Arc::new(PageTracker::new(PAGE_SIZE, TrackingMode::PageProtection).unwrap());
        let reg = register(&tracker).unwrap();
        let slot = reg.slot;
        assert_eq!(Arc::strong_count(&tracker), 2);

        // Stand in for a handler that has already loaded the pointer.
        IN_FLIGHT[slot].fetch_add(1, Ordering::SeqCst);
        let dropper = std::thread::spawn(move || drop(reg));
        while !TRACKERS[slot].load(Ordering::SeqCst).is_null() {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(Arc::strong_count(&tracker), 2, "tracker released under a live handler");
        assert!(!dropper.is_finished());

        IN_FLIGHT[slot].fetch_sub(1, Ordering::SeqCst);
        dropper.join().unwrap();
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn visit_leaves_no_handler_in_flight() {
        let tracker = Arc::new(PageTracker::new(PAGE_SIZE, TrackingMode::PageProtection).unwrap());
        let reg = register(&tracker).unwrap();
        let outside = tracker.region().base() + 2 * PAGE_SIZE;
        assert!(matches!(visit(reg.slot, &TRACKERS[reg.slot], outside), Visit::Miss));
        // Would spin forever if the visit left its count behind.
        drop(reg);
    }
}
