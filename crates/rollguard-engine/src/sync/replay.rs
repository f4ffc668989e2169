//! Replay gate: forces a recorded synchronization order on re-execution.
//!
//! While active, every instrumented sync operation first asks the gate for a
//! turn. A thread proceeds only when its next recorded event is the next
//! event in the global order; the operation it presents must match the
//! recorded one. Once the cursor reaches the horizon (the end of the loaded
//! log) the gate deactivates and operations run freely again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::event::{SyncEvent, SyncLog, SyncOp, SyncTarget};
use crate::error::DetectorError;
use crate::quiesce::Quiescer;
use crate::thread::ThreadId;

/// Outcome of asking for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// No replay in progress; run the operation as usual.
    Free,
    /// Run the operation now; it must reproduce `event`.
    Replay(SyncEvent),
}

#[derive(Debug, Default)]
struct GateState {
    log: Vec<SyncEvent>,
    cursor: usize,
    pending: BTreeMap<ThreadId, VecDeque<usize>>,
    waiting: BTreeSet<ThreadId>,
}

impl GateState {
    fn diagnostics(&self) -> String {
        let mut out = format!("cursor={} horizon={}", self.cursor, self.log.len());
        for ev in self.log.iter().skip(self.cursor).take(4) {
            let _ = write!(out, "\n  next: {ev}");
        }
        if !self.waiting.is_empty() {
            let waiting: Vec<String> = self.waiting.iter().map(ToString::to_string).collect();
            let _ = write!(out, "\n  waiting: {}", waiting.join(", "));
        }
        out
    }
}

pub struct ReplayGate {
    state: Mutex<GateState>,
    cond: Condvar,
    active: AtomicBool,
    replayed: AtomicU64,
}

impl Default for ReplayGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            active: AtomicBool::new(false),
            replayed: AtomicU64::new(0),
        }
    }

    /// Arm the gate with `log`. An empty log leaves it inactive.
    pub fn load(&self, log: &SyncLog) {
        let mut st = self.state.lock();
        st.log = log.events().to_vec();
        st.cursor = 0;
        st.pending = log.per_thread();
        st.waiting.clear();
        self.active.store(!st.log.is_empty(), Ordering::Release);
        self.cond.notify_all();
    }

    pub fn deactivate(&self) {
        let _st = self.state.lock();
        self.active.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Total events replayed since creation.
    #[must_use]
    pub fn replayed_total(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Events of the loaded log already reproduced.
    #[must_use]
    pub fn replayed(&self) -> Vec<SyncEvent> {
        let st = self.state.lock();
        st.log[..st.cursor].to_vec()
    }

    /// `(cursor, horizon)` of the loaded log.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.cursor, st.log.len())
    }

    /// Block until it is `thread`'s turn to perform `op` on `target`.
    ///
    /// A thread whose recorded events are used up waits for the horizon, so
    /// it cannot race ahead of threads still replaying. The spawned child of
    /// a `ThreadSpawn` is not compared: ids are assigned deterministically
    /// and checked again by the thread table.
    pub fn acquire_turn(
        &self,
        thread: ThreadId,
        op: SyncOp,
        target: SyncTarget,
        quiescer: &Quiescer,
        tick: Duration,
    ) -> Result<Turn, DetectorError> {
        if !self.is_active() {
            return Ok(Turn::Free);
        }
        let mut st = self.state.lock();
        let mut blocked = false;
        let outcome = loop {
            if quiescer.interrupted() {
                break Err(DetectorError::Interrupted);
            }
            if !self.is_active() {
                break Ok(Turn::Free);
            }
            let next = st.pending.get(&thread).and_then(|q| q.front().copied());
            if let Some(idx) = next {
                let ev = st.log[idx];
                let target_matches = op == SyncOp::ThreadSpawn || ev.target == target;
                if ev.op != op || !target_matches {
                    break Err(DetectorError::ReplayDivergence {
                        thread,
                        expected: format!("{:?}({})", ev.op, ev.target),
                        observed: format!("{op:?}({target})"),
                        diagnostics: st.diagnostics(),
                    });
                }
                if st.cursor == idx {
                    break Ok(Turn::Replay(ev));
                }
            }
            if !blocked {
                blocked = true;
                st.waiting.insert(thread);
                quiescer.block_begin(thread);
            }
            self.cond.wait_for(&mut st, tick);
        };
        if blocked {
            st.waiting.remove(&thread);
            quiescer.block_end(thread);
        }
        outcome
    }

    /// Finish the turn granted to `thread` and hand the gate to the next event.
    pub fn complete(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        let popped = st.pending.get_mut(&thread).and_then(VecDeque::pop_front);
        if popped.is_none() {
            return;
        }
        st.cursor += 1;
        self.replayed.fetch_add(1, Ordering::Relaxed);
        if st.cursor >= st.log.len() {
            self.active.store(false, Ordering::Release);
        }
        self.cond.notify_all();
    }

    /// True when the thread owning the next event is parked in the gate and
    /// would proceed if scheduled.
    #[must_use]
    pub fn turn_waiter_ready(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let st = self.state.lock();
        st.log
            .get(st.cursor)
            .is_some_and(|ev| st.waiting.contains(&ev.thread))
    }

    /// Threads currently waiting for a turn.
    #[must_use]
    pub fn waiting(&self) -> Vec<ThreadId> {
        self.state.lock().waiting.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sync::event::SyncObjectId;

    const M: SyncTarget = SyncTarget::Object(SyncObjectId(0));
    const TICK: Duration = Duration::from_millis(1);

    fn log(order: &[(u32, SyncOp)]) -> SyncLog {
        let events = order
            .iter()
            .enumerate()
            .map(|(i, (t, op))| SyncEvent {
                seq: i as u64,
                epoch: 0,
                thread: ThreadId(*t),
                op: *op,
                target: M,
                result: None,
            })
            .collect();
        SyncLog::from_events(0, events)
    }

    #[test]
    fn inactive_gate_is_free() {
        let gate = ReplayGate::new();
        let q = Quiescer::new();
        let turn = gate
            .acquire_turn(ThreadId(0), SyncOp::MutexLock, M, &q, TICK)
            .unwrap();
        assert_eq!(turn, Turn::Free);
        gate.load(&SyncLog::default());
        assert!(!gate.is_active());
    }

    #[test]
    fn threads_take_turns_in_recorded_order() {
        let gate = Arc::new(ReplayGate::new());
        let q = Arc::new(Quiescer::new());
        gate.load(&log(&[
            (1, SyncOp::MutexLock),
            (1, SyncOp::MutexUnlock),
            (0, SyncOp::MutexLock),
            (0, SyncOp::MutexUnlock),
        ]));
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = [0u32, 1]
            .into_iter()
            .map(|t| {
                let (gate, q, order) = (Arc::clone(&gate), Arc::clone(&q), Arc::clone(&order));
                q.register(ThreadId(t));
                std::thread::spawn(move || {
                    for op in [SyncOp::MutexLock, SyncOp::MutexUnlock] {
                        let turn = gate.acquire_turn(ThreadId(t), op, M, &q, TICK).unwrap();
                        assert!(matches!(turn, Turn::Replay(_)));
                        order.lock().push(t);
                        gate.complete(ThreadId(t));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 1, 0, 0]);
        assert!(!gate.is_active());
        assert_eq!(gate.replayed().len(), 4);
    }

    #[test]
    fn mismatched_operation_diverges_with_diagnostics() {
        let gate = ReplayGate::new();
        let q = Quiescer::new();
        gate.load(&log(&[(0, SyncOp::MutexLock)]));
        let err = gate
            .acquire_turn(ThreadId(0), SyncOp::CondSignal, M, &q, TICK)
            .unwrap_err();
        match err {
            DetectorError::ReplayDivergence {
                thread,
                expected,
                diagnostics,
                ..
            } => {
                assert_eq!(thread, ThreadId(0));
                assert!(expected.starts_with("MutexLock"));
                assert!(diagnostics.contains("cursor=0 horizon=1"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn exhausted_thread_waits_for_horizon_and_is_interruptible() {
        let gate = Arc::new(ReplayGate::new());
        let q = Arc::new(Quiescer::new());
        q.register(ThreadId(1));
        gate.load(&log(&[(0, SyncOp::MutexLock)]));
        let (g2, q2) = (Arc::clone(&gate), Arc::clone(&q));
        let h = std::thread::spawn(move || g2.acquire_turn(ThreadId(1), SyncOp::MutexLock, M, &q2, TICK));
        while gate.waiting().is_empty() {
            std::thread::yield_now();
        }
        assert!(!gate.turn_waiter_ready());
        q.interrupt_all();
        assert!(matches!(h.join().unwrap(), Err(DetectorError::Interrupted)));
        assert!(gate.waiting().is_empty());
    }
}
