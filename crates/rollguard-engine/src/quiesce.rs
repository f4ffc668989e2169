//! Cooperative quiescence of tracked threads.
//!
//! Threads report their phase at every safe point: unit boundaries park for
//! a pending checkpoint, sync waits mark the thread `Blocked`, and every
//! instrumented operation polls the rollback interrupt. Nothing is ever
//! suspended by force.
//!
//! `activity` counts phase transitions and sync-object state changes. The
//! rollback controller samples it around a state read to tell a settled
//! replay from one that is still moving.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DetectorError;
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPhase {
    Running,
    /// At a unit boundary, waiting for a checkpoint to be released.
    Parked,
    /// Waiting inside a sync operation.
    Blocked,
    /// Replay reached this thread's detection-time frontier.
    Frontier,
    /// Stopped after raising a detection or failing; awaiting rollback.
    Stopped,
    Exited,
}

/// Result of a checkpoint quiescence attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuiesceOutcome {
    /// Every thread is parked at a boundary or has exited.
    Quiesced,
    /// Some threads were blocked or stopped; they have been released again.
    Deferred { waiting: Vec<ThreadId> },
}

#[derive(Debug, Default)]
struct QuiesceState {
    phases: BTreeMap<ThreadId, ThreadPhase>,
    release_gen: u64,
    frontier_open: bool,
}

pub struct Quiescer {
    state: Mutex<QuiesceState>,
    cond: Condvar,
    checkpoint_pending: AtomicBool,
    interrupt: AtomicBool,
    activity: AtomicU64,
}

impl Default for Quiescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quiescer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QuiesceState {
                frontier_open: true,
                ..QuiesceState::default()
            }),
            cond: Condvar::new(),
            checkpoint_pending: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            activity: AtomicU64::new(0),
        }
    }

    fn set_phase(&self, st: &mut QuiesceState, thread: ThreadId, phase: ThreadPhase) {
        st.phases.insert(thread, phase);
        self.bump();
        self.cond.notify_all();
    }

    /// Record a state change visible to settle detection.
    pub fn bump(&self) {
        self.activity.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn activity(&self) -> u64 {
        self.activity.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Thread side
    // -----------------------------------------------------------------------

    pub fn register(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        self.set_phase(&mut st, thread, ThreadPhase::Running);
    }

    pub fn exit(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        self.set_phase(&mut st, thread, ThreadPhase::Exited);
    }

    pub fn stop(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        self.set_phase(&mut st, thread, ThreadPhase::Stopped);
    }

    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Safe point inside a unit: fails once a rollback has begun.
    pub fn op_point(&self) -> Result<(), DetectorError> {
        if self.interrupted() {
            Err(DetectorError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Unit boundary: parks while a checkpoint is being taken.
    pub fn boundary(&self, thread: ThreadId) -> Result<(), DetectorError> {
        self.op_point()?;
        if !self.checkpoint_pending.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut st = self.state.lock();
        let generation = st.release_gen;
        self.set_phase(&mut st, thread, ThreadPhase::Parked);
        while st.release_gen == generation && !self.interrupted() {
            self.cond.wait(&mut st);
        }
        self.set_phase(&mut st, thread, ThreadPhase::Running);
        drop(st);
        self.op_point()
    }

    pub fn block_begin(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        self.set_phase(&mut st, thread, ThreadPhase::Blocked);
    }

    pub fn block_end(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        self.set_phase(&mut st, thread, ThreadPhase::Running);
    }

    /// Hold a replaying thread at its frontier until the controller lifts it.
    pub fn park_frontier(&self, thread: ThreadId) -> Result<(), DetectorError> {
        let mut st = self.state.lock();
        if st.frontier_open {
            return Ok(());
        }
        self.set_phase(&mut st, thread, ThreadPhase::Frontier);
        while !st.frontier_open && !self.interrupted() {
            self.cond.wait(&mut st);
        }
        self.set_phase(&mut st, thread, ThreadPhase::Running);
        drop(st);
        self.op_point()
    }

    // -----------------------------------------------------------------------
    // Coordinator side
    // -----------------------------------------------------------------------

    /// Ask every thread to park at its next unit boundary and wait until none
    /// is running.
    ///
    /// Returns `Deferred` (after releasing everyone) when a thread is blocked
    /// or stopped, since its restart point would not describe its state.
    pub fn quiesce_for_checkpoint(&self, timeout: Duration) -> Result<QuiesceOutcome, DetectorError> {
        self.checkpoint_pending.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            let running = st
                .phases
                .values()
                .filter(|p| **p == ThreadPhase::Running)
                .count();
            if running == 0 {
                let waiting: Vec<ThreadId> = st
                    .phases
                    .iter()
                    .filter(|(_, p)| matches!(p, ThreadPhase::Blocked | ThreadPhase::Stopped))
                    .map(|(t, _)| *t)
                    .collect();
                if waiting.is_empty() {
                    return Ok(QuiesceOutcome::Quiesced);
                }
                drop(st);
                self.release();
                return Ok(QuiesceOutcome::Deferred { waiting });
            }
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                drop(st);
                self.release();
                return Err(DetectorError::QuiescenceTimeout {
                    pending: running,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Let parked threads continue.
    pub fn release(&self) {
        self.checkpoint_pending.store(false, Ordering::Release);
        let mut st = self.state.lock();
        st.release_gen += 1;
        self.cond.notify_all();
    }

    /// Begin a rollback: every safe point and wait now fails with
    /// `Interrupted`.
    pub fn interrupt_all(&self) {
        self.interrupt.store(true, Ordering::Release);
        let _st = self.state.lock();
        self.cond.notify_all();
    }

    /// Forget all threads and clear the interrupt (after a restore).
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.phases.clear();
        self.checkpoint_pending.store(false, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);
        self.bump();
    }

    pub fn close_frontier(&self) {
        self.state.lock().frontier_open = false;
    }

    pub fn lift_frontier(&self) {
        let mut st = self.state.lock();
        st.frontier_open = true;
        self.bump();
        self.cond.notify_all();
    }

    #[must_use]
    pub fn phase(&self, thread: ThreadId) -> Option<ThreadPhase> {
        self.state.lock().phases.get(&thread).copied()
    }

    #[must_use]
    pub fn phases(&self) -> BTreeMap<ThreadId, ThreadPhase> {
        self.state.lock().phases.clone()
    }

    /// True when no thread is running or parked for a checkpoint.
    #[must_use]
    pub fn settled(&self) -> bool {
        self.state.lock().phases.values().all(|p| {
            matches!(
                p,
                ThreadPhase::Blocked | ThreadPhase::Frontier | ThreadPhase::Stopped | ThreadPhase::Exited
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn quiesce_parks_running_threads_at_boundaries() {
        let q = Arc::new(Quiescer::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..3u32)
            .map(|t| {
                let q = Arc::clone(&q);
                let stop = Arc::clone(&stop);
                q.register(ThreadId(t));
                std::thread::spawn(move || {
                    let mut units = 0u64;
                    while !stop.load(Ordering::Acquire) {
                        q.boundary(ThreadId(t)).unwrap();
                        units += 1;
                        std::thread::yield_now();
                    }
                    q.exit(ThreadId(t));
                    units
                })
            })
            .collect();
        let outcome = q.quiesce_for_checkpoint(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, QuiesceOutcome::Quiesced);
        assert!(q.phases().values().all(|p| *p == ThreadPhase::Parked));
        stop.store(true, Ordering::Release);
        q.release();
        for h in handles {
            h.join().unwrap();
        }
        assert!(q.settled());
    }

    #[test]
    fn blocked_thread_defers_checkpoint() {
        let q = Quiescer::new();
        q.register(ThreadId(0));
        q.register(ThreadId(1));
        q.block_begin(ThreadId(0));
        q.exit(ThreadId(1));
        let outcome = q.quiesce_for_checkpoint(Duration::from_millis(100)).unwrap();
        assert_eq!(
            outcome,
            QuiesceOutcome::Deferred {
                waiting: vec![ThreadId(0)]
            }
        );
    }

    #[test]
    fn quiesce_times_out_on_runaway_thread() {
        let q = Quiescer::new();
        q.register(ThreadId(0));
        let err = q.quiesce_for_checkpoint(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DetectorError::QuiescenceTimeout { pending: 1, .. }));
    }

    #[test]
    fn interrupt_releases_parked_and_frontier_threads() {
        let q = Arc::new(Quiescer::new());
        q.register(ThreadId(0));
        q.close_frontier();
        let q2 = Arc::clone(&q);
        let h = std::thread::spawn(move || q2.park_frontier(ThreadId(0)));
        while q.phase(ThreadId(0)) != Some(ThreadPhase::Frontier) {
            std::thread::yield_now();
        }
        assert!(q.settled());
        q.interrupt_all();
        assert!(matches!(h.join().unwrap(), Err(DetectorError::Interrupted)));
        q.reset();
        assert!(q.op_point().is_ok());
    }

    #[test]
    fn lifted_frontier_lets_threads_continue() {
        let q = Arc::new(Quiescer::new());
        q.register(ThreadId(0));
        q.close_frontier();
        let q2 = Arc::clone(&q);
        let h = std::thread::spawn(move || q2.park_frontier(ThreadId(0)));
        while q.phase(ThreadId(0)) != Some(ThreadPhase::Frontier) {
            std::thread::yield_now();
        }
        q.lift_frontier();
        assert!(h.join().unwrap().is_ok());
        assert_eq!(q.phase(ThreadId(0)), Some(ThreadPhase::Running));
    }
}
