//! Tracked mutex, condition variable and barrier.
//!
//! Every operation goes through the replay gate, updates the primitive's
//! state under its internal lock and records the event while that lock is
//! still held. Waits never block indefinitely: they poll the rollback
//! interrupt every tick and report `Blocked` to the quiescer for as long as
//! they wait.
//!
//! Lock order: condvar state before mutex state; any primitive state before
//! the quiescer. No thread holds two primitive locks of the same kind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use super::event::{SyncObjectId, SyncOp, SyncTarget};
use super::recorder::{Segment, SyncRecorder};
use super::replay::{ReplayGate, Turn};
use crate::error::DetectorError;
use crate::quiesce::Quiescer;
use crate::thread::ThreadId;

/// Everything a sync operation needs from the calling thread.
pub struct SyncEnv<'a> {
    pub thread: ThreadId,
    pub recorder: &'a SyncRecorder,
    pub segment: &'a Segment,
    pub gate: &'a ReplayGate,
    pub quiescer: &'a Quiescer,
    pub tick: Duration,
}

impl SyncEnv<'_> {
    fn record(&self, op: SyncOp, target: SyncTarget, result: Option<bool>) {
        self.recorder.record(self.segment, self.thread, op, target, result);
    }

    fn misuse(&self, message: impl Into<String>) -> DetectorError {
        DetectorError::SyncMisuse {
            thread: self.thread,
            message: message.into(),
        }
    }
}

/// Run `body` inside a replay turn for `op` on `target`.
pub(crate) fn gated<R>(
    env: &SyncEnv<'_>,
    op: SyncOp,
    target: SyncTarget,
    body: impl FnOnce(Turn) -> Result<R, DetectorError>,
) -> Result<R, DetectorError> {
    env.quiescer.op_point()?;
    let turn = env
        .gate
        .acquire_turn(env.thread, op, target, env.quiescer, env.tick)?;
    let out = body(turn);
    if out.is_ok() && matches!(turn, Turn::Replay(_)) {
        env.gate.complete(env.thread);
    }
    out
}

/// Wait on `cond` until `ready` holds, marking the thread blocked meanwhile.
/// `count` tracks how many threads sit in this loop.
fn blocking_wait<T>(
    env: &SyncEnv<'_>,
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    count: impl Fn(&mut T) -> &mut usize,
    ready: impl Fn(&T) -> bool,
) -> Result<(), DetectorError> {
    if ready(&**guard) {
        return Ok(());
    }
    *count(&mut **guard) += 1;
    env.quiescer.block_begin(env.thread);
    let result = loop {
        if env.quiescer.interrupted() {
            break Err(DetectorError::Interrupted);
        }
        if ready(&**guard) {
            break Ok(());
        }
        cond.wait_for(guard, env.tick);
    };
    *count(&mut **guard) -= 1;
    env.quiescer.block_end(env.thread);
    result
}

/// Saved state of one primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncObjectState {
    Mutex {
        owner: Option<ThreadId>,
    },
    Condvar {
        waiters: usize,
        permits: usize,
    },
    Barrier {
        arrived: usize,
        generation: u64,
    },
}

/// A primitive whose state is part of a checkpoint.
pub trait SyncObject: Send + Sync {
    fn id(&self) -> SyncObjectId;
    fn snapshot(&self) -> SyncObjectState;
    fn restore(&self, state: &SyncObjectState);
    /// Some thread blocked on this object would make progress if scheduled.
    fn has_runnable_waiter(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MutexState {
    owner: Option<ThreadId>,
    waiters: usize,
}

struct MutexCore {
    id: SyncObjectId,
    state: Mutex<MutexState>,
    cond: Condvar,
}

impl MutexCore {
    fn acquire(&self, env: &SyncEnv<'_>, st: &mut MutexGuard<'_, MutexState>) -> Result<(), DetectorError> {
        blocking_wait(env, &self.cond, st, |s| &mut s.waiters, |s| s.owner.is_none())?;
        st.owner = Some(env.thread);
        Ok(())
    }
}

impl SyncObject for MutexCore {
    fn id(&self) -> SyncObjectId {
        self.id
    }

    fn snapshot(&self) -> SyncObjectState {
        SyncObjectState::Mutex {
            owner: self.state.lock().owner,
        }
    }

    fn restore(&self, state: &SyncObjectState) {
        let owner = match state {
            SyncObjectState::Mutex { owner } => *owner,
            _ => None,
        };
        *self.state.lock() = MutexState { owner, waiters: 0 };
        self.cond.notify_all();
    }

    fn has_runnable_waiter(&self) -> bool {
        let st = self.state.lock();
        st.waiters > 0 && st.owner.is_none()
    }
}

/// Mutual exclusion lock whose acquisition order is recorded and replayed.
#[derive(Clone)]
pub struct TrackedMutex {
    core: Arc<MutexCore>,
}

impl TrackedMutex {
    #[must_use]
    pub fn id(&self) -> SyncObjectId {
        self.core.id
    }

    fn target(&self) -> SyncTarget {
        SyncTarget::Object(self.core.id)
    }

    /// Current holder.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.core.state.lock().owner
    }

    pub fn lock(&self, env: &SyncEnv<'_>) -> Result<(), DetectorError> {
        gated(env, SyncOp::MutexLock, self.target(), |_| {
            let mut st = self.core.state.lock();
            if st.owner == Some(env.thread) {
                return Err(env.misuse(format!("relock of {} by its owner", self.core.id)));
            }
            self.core.acquire(env, &mut st)?;
            env.record(SyncOp::MutexLock, self.target(), None);
            Ok(())
        })
    }

    /// Non-blocking acquire. Under replay the recorded outcome is reproduced.
    pub fn try_lock(&self, env: &SyncEnv<'_>) -> Result<bool, DetectorError> {
        gated(env, SyncOp::MutexTryLock, self.target(), |turn| {
            let mut st = self.core.state.lock();
            let acquired = match turn {
                Turn::Replay(ev) => {
                    let acquired = ev.result.unwrap_or(false);
                    if acquired {
                        self.core.acquire(env, &mut st)?;
                    }
                    acquired
                }
                Turn::Free => {
                    if st.owner.is_none() {
                        st.owner = Some(env.thread);
                        true
                    } else {
                        false
                    }
                }
            };
            env.record(SyncOp::MutexTryLock, self.target(), Some(acquired));
            Ok(acquired)
        })
    }

    pub fn unlock(&self, env: &SyncEnv<'_>) -> Result<(), DetectorError> {
        gated(env, SyncOp::MutexUnlock, self.target(), |_| {
            let mut st = self.core.state.lock();
            if st.owner != Some(env.thread) {
                return Err(env.misuse(format!("unlock of {} not held by caller", self.core.id)));
            }
            st.owner = None;
            env.record(SyncOp::MutexUnlock, self.target(), None);
            env.quiescer.bump();
            self.core.cond.notify_all();
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CondState {
    /// Threads between the release and resume halves of a wait.
    waiters: usize,
    /// Wakeups granted and not yet consumed; never exceeds `waiters`.
    permits: usize,
    /// Threads blocked waiting for a permit.
    sleeping: usize,
}

struct CondCore {
    id: SyncObjectId,
    state: Mutex<CondState>,
    cond: Condvar,
}

impl SyncObject for CondCore {
    fn id(&self) -> SyncObjectId {
        self.id
    }

    fn snapshot(&self) -> SyncObjectState {
        let st = self.state.lock();
        SyncObjectState::Condvar {
            waiters: st.waiters,
            permits: st.permits,
        }
    }

    fn restore(&self, state: &SyncObjectState) {
        let (waiters, permits) = match state {
            SyncObjectState::Condvar { waiters, permits } => (*waiters, *permits),
            _ => (0, 0),
        };
        *self.state.lock() = CondState {
            waiters,
            permits,
            sleeping: 0,
        };
        self.cond.notify_all();
    }

    fn has_runnable_waiter(&self) -> bool {
        let st = self.state.lock();
        st.sleeping > 0 && st.permits > 0
    }
}

/// Condition variable. A wait is recorded as two events so replay can order
/// the mutex release and reacquisition independently.
#[derive(Clone)]
pub struct TrackedCondvar {
    core: Arc<CondCore>,
}

impl TrackedCondvar {
    #[must_use]
    pub fn id(&self) -> SyncObjectId {
        self.core.id
    }

    fn target(&self) -> SyncTarget {
        SyncTarget::Object(self.core.id)
    }

    /// Atomically release `mutex` and wait for a signal, then reacquire it.
    pub fn wait(&self, mutex: &TrackedMutex, env: &SyncEnv<'_>) -> Result<(), DetectorError> {
        gated(env, SyncOp::CondWaitRelease, self.target(), |_| {
            let mut cs = self.core.state.lock();
            let mut ms = mutex.core.state.lock();
            if ms.owner != Some(env.thread) {
                return Err(env.misuse(format!(
                    "wait on {} without holding {}",
                    self.core.id, mutex.core.id
                )));
            }
            cs.waiters += 1;
            ms.owner = None;
            env.record(SyncOp::CondWaitRelease, self.target(), None);
            env.quiescer.bump();
            mutex.core.cond.notify_all();
            Ok(())
        })?;
        gated(env, SyncOp::CondWaitResume, self.target(), |_| {
            {
                let mut cs = self.core.state.lock();
                blocking_wait(env, &self.core.cond, &mut cs, |s| &mut s.sleeping, |s| s.permits > 0)?;
                cs.permits -= 1;
                cs.waiters -= 1;
            }
            let mut ms = mutex.core.state.lock();
            mutex.core.acquire(env, &mut ms)?;
            env.record(SyncOp::CondWaitResume, self.target(), None);
            Ok(())
        })
    }

    /// Wake one waiter, if any.
    pub fn signal(&self, env: &SyncEnv<'_>) -> Result<(), DetectorError> {
        gated(env, SyncOp::CondSignal, self.target(), |_| {
            let mut cs = self.core.state.lock();
            if cs.waiters > cs.permits {
                cs.permits += 1;
            }
            env.record(SyncOp::CondSignal, self.target(), None);
            env.quiescer.bump();
            self.core.cond.notify_all();
            Ok(())
        })
    }

    /// Wake every current waiter.
    pub fn broadcast(&self, env: &SyncEnv<'_>) -> Result<(), DetectorError> {
        gated(env, SyncOp::CondBroadcast, self.target(), |_| {
            let mut cs = self.core.state.lock();
            cs.permits = cs.waiters;
            env.record(SyncOp::CondBroadcast, self.target(), None);
            env.quiescer.bump();
            self.core.cond.notify_all();
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    /// Blocked threads and the generation each is waiting to see end.
    waiting: BTreeMap<ThreadId, u64>,
}

struct BarrierCore {
    id: SyncObjectId,
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl SyncObject for BarrierCore {
    fn id(&self) -> SyncObjectId {
        self.id
    }

    fn snapshot(&self) -> SyncObjectState {
        let st = self.state.lock();
        SyncObjectState::Barrier {
            arrived: st.arrived,
            generation: st.generation,
        }
    }

    fn restore(&self, state: &SyncObjectState) {
        let (arrived, generation) = match state {
            SyncObjectState::Barrier { arrived, generation } => (*arrived, *generation),
            _ => (0, 0),
        };
        *self.state.lock() = BarrierState {
            arrived,
            generation,
            waiting: BTreeMap::new(),
        };
        self.cond.notify_all();
    }

    fn has_runnable_waiter(&self) -> bool {
        let st = self.state.lock();
        st.waiting.values().any(|g| *g != st.generation)
    }
}

/// Reusable barrier for a fixed number of parties.
#[derive(Clone)]
pub struct TrackedBarrier {
    core: Arc<BarrierCore>,
}

impl TrackedBarrier {
    #[must_use]
    pub fn id(&self) -> SyncObjectId {
        self.core.id
    }

    #[must_use]
    pub fn parties(&self) -> usize {
        self.core.parties
    }

    fn target(&self) -> SyncTarget {
        SyncTarget::Object(self.core.id)
    }

    /// Wait for all parties. Returns `true` in exactly one thread per round.
    pub fn wait(&self, env: &SyncEnv<'_>) -> Result<bool, DetectorError> {
        let (leader, generation) = gated(env, SyncOp::BarrierArrive, self.target(), |turn| {
            let mut st = self.core.state.lock();
            let generation = st.generation;
            st.arrived += 1;
            let leader = st.arrived >= self.core.parties;
            if let Turn::Replay(ev) = turn {
                if ev.result.is_some_and(|r| r != leader) {
                    st.arrived -= 1;
                    return Err(DetectorError::ReplayDivergence {
                        thread: env.thread,
                        expected: format!("BarrierArrive({}) -> {:?}", self.core.id, ev.result),
                        observed: format!("BarrierArrive({}) -> {leader}", self.core.id),
                        diagnostics: format!("arrived={} parties={}", st.arrived, self.core.parties),
                    });
                }
            }
            if leader {
                st.arrived = 0;
                st.generation += 1;
                env.quiescer.bump();
                self.core.cond.notify_all();
            }
            env.record(SyncOp::BarrierArrive, self.target(), Some(leader));
            Ok((leader, generation))
        })?;
        if leader {
            return Ok(true);
        }
        let mut st = self.core.state.lock();
        if st.generation != generation {
            return Ok(false);
        }
        st.waiting.insert(env.thread, generation);
        env.quiescer.block_begin(env.thread);
        let result = loop {
            if env.quiescer.interrupted() {
                break Err(DetectorError::Interrupted);
            }
            if st.generation != generation {
                break Ok(false);
            }
            self.core.cond.wait_for(&mut st, env.tick);
        };
        st.waiting.remove(&env.thread);
        env.quiescer.block_end(env.thread);
        result
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All primitives of one engine, indexed by id.
#[derive(Default)]
pub struct SyncRegistry {
    next: AtomicU32,
    objects: Mutex<Vec<Arc<dyn SyncObject>>>,
}

impl SyncRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SyncObjectId {
        SyncObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn mutex(&self) -> TrackedMutex {
        let core = Arc::new(MutexCore {
            id: self.next_id(),
            state: Mutex::new(MutexState::default()),
            cond: Condvar::new(),
        });
        self.objects.lock().push(Arc::clone(&core) as Arc<dyn SyncObject>);
        TrackedMutex { core }
    }

    pub fn condvar(&self) -> TrackedCondvar {
        let core = Arc::new(CondCore {
            id: self.next_id(),
            state: Mutex::new(CondState::default()),
            cond: Condvar::new(),
        });
        self.objects.lock().push(Arc::clone(&core) as Arc<dyn SyncObject>);
        TrackedCondvar { core }
    }

    /// Barrier for `parties` threads (at least one).
    pub fn barrier(&self, parties: usize) -> TrackedBarrier {
        let core = Arc::new(BarrierCore {
            id: self.next_id(),
            parties: parties.max(1),
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        });
        self.objects.lock().push(Arc::clone(&core) as Arc<dyn SyncObject>);
        TrackedBarrier { core }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(SyncObjectId, SyncObjectState)> {
        self.objects
            .lock()
            .iter()
            .map(|o| (o.id(), o.snapshot()))
            .collect()
    }

    pub fn restore(&self, states: &[(SyncObjectId, SyncObjectState)]) {
        let objects = self.objects.lock().clone();
        for obj in objects {
            if let Some((_, state)) = states.iter().find(|(id, _)| *id == obj.id()) {
                obj.restore(state);
            }
        }
    }

    #[must_use]
    pub fn any_runnable_waiter(&self) -> bool {
        let objects = self.objects.lock().clone();
        objects.iter().any(|o| o.has_runnable_waiter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::SyncLog;

    const TICK: Duration = Duration::from_millis(1);

    struct Rig {
        recorder: SyncRecorder,
        gate: ReplayGate,
        quiescer: Quiescer,
        registry: SyncRegistry,
    }

    impl Rig {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                recorder: SyncRecorder::new(),
                gate: ReplayGate::new(),
                quiescer: Quiescer::new(),
                registry: SyncRegistry::new(),
            })
        }

        fn with_env<R>(&self, thread: u32, f: impl FnOnce(&SyncEnv<'_>) -> R) -> R {
            let segment = self.recorder.segment(ThreadId(thread));
            let env = SyncEnv {
                thread: ThreadId(thread),
                recorder: &self.recorder,
                segment: &segment,
                gate: &self.gate,
                quiescer: &self.quiescer,
                tick: TICK,
            };
            f(&env)
        }
    }

    #[test]
    fn mutex_records_lock_and_unlock() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        rig.with_env(0, |env| {
            m.lock(env).unwrap();
            assert_eq!(m.owner(), Some(ThreadId(0)));
            assert!(matches!(m.lock(env), Err(DetectorError::SyncMisuse { .. })));
            m.unlock(env).unwrap();
        });
        let log = rig.recorder.close_epoch(1);
        let ops: Vec<_> = log.events().iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![SyncOp::MutexLock, SyncOp::MutexUnlock]);
    }

    #[test]
    fn unlock_by_non_owner_is_misuse() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        rig.with_env(0, |env| m.lock(env).unwrap());
        let err = rig.with_env(1, |env| m.unlock(env)).unwrap_err();
        assert!(err.to_string().contains("not held"));
    }

    #[test]
    fn try_lock_replays_recorded_result() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        rig.with_env(0, |env| m.lock(env).unwrap());
        assert!(!rig.with_env(1, |env| m.try_lock(env)).unwrap());
        rig.with_env(0, |env| m.unlock(env).unwrap());
        let log = rig.recorder.close_epoch(1);
        assert_eq!(log.events()[1].result, Some(false));

        // Replay with the mutex free: the recorded failure is reproduced.
        m.core.restore(&SyncObjectState::Mutex { owner: None });
        let replay = SyncLog::from_events(0, vec![log.events()[1]]);
        rig.gate.load(&replay);
        assert!(!rig.with_env(1, |env| m.try_lock(env)).unwrap());
        assert_eq!(m.owner(), None);
        assert!(!rig.gate.is_active());
    }

    #[test]
    fn condvar_handoff_between_threads() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        let cv = rig.registry.condvar();
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        rig.quiescer.register(ThreadId(1));
        let waiter = {
            let (rig, m, cv, ready) = (Arc::clone(&rig), m.clone(), cv.clone(), Arc::clone(&ready));
            std::thread::spawn(move || {
                rig.with_env(1, |env| {
                    m.lock(env)?;
                    while !ready.load(Ordering::Acquire) {
                        cv.wait(&m, env)?;
                    }
                    m.unlock(env)
                })
            })
        };
        loop {
            let done = rig.with_env(0, |env| {
                m.lock(env).unwrap();
                let waiting = cv.core.state.lock().waiters > 0;
                if waiting {
                    ready.store(true, Ordering::Release);
                    cv.signal(env).unwrap();
                }
                m.unlock(env).unwrap();
                waiting
            });
            if done {
                break;
            }
            std::thread::yield_now();
        }
        waiter.join().unwrap().unwrap();
        let log = rig.recorder.close_epoch(1);
        let t1_ops: Vec<_> = log
            .events()
            .iter()
            .filter(|e| e.thread == ThreadId(1))
            .map(|e| e.op)
            .collect();
        assert_eq!(
            t1_ops,
            vec![
                SyncOp::MutexLock,
                SyncOp::CondWaitRelease,
                SyncOp::CondWaitResume,
                SyncOp::MutexUnlock
            ]
        );
    }

    #[test]
    fn signal_without_waiters_is_lost() {
        let rig = Rig::new();
        let cv = rig.registry.condvar();
        rig.with_env(0, |env| cv.signal(env).unwrap());
        assert_eq!(
            cv.core.snapshot(),
            SyncObjectState::Condvar {
                waiters: 0,
                permits: 0
            }
        );
    }

    #[test]
    fn barrier_elects_one_leader_per_round() {
        let rig = Rig::new();
        let b = rig.registry.barrier(3);
        let handles: Vec<_> = (0..3u32)
            .map(|t| {
                let (rig, b) = (Arc::clone(&rig), b.clone());
                rig.quiescer.register(ThreadId(t));
                std::thread::spawn(move || {
                    rig.with_env(t, |env| {
                        let mut leads = 0;
                        for _ in 0..5 {
                            if b.wait(env).unwrap() {
                                leads += 1;
                            }
                        }
                        leads
                    })
                })
            })
            .collect();
        let leads: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(leads, 5);
        assert_eq!(
            b.core.snapshot(),
            SyncObjectState::Barrier {
                arrived: 0,
                generation: 5
            }
        );
    }

    #[test]
    fn registry_snapshot_restores_owner() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        let _cv = rig.registry.condvar();
        let saved = rig.registry.snapshot();
        assert_eq!(saved.len(), 2);
        rig.with_env(2, |env| m.lock(env).unwrap());
        rig.registry.restore(&saved);
        assert_eq!(m.owner(), None);
        assert!(!rig.registry.any_runnable_waiter());
    }

    #[test]
    fn interrupted_lock_wait_unwinds() {
        let rig = Rig::new();
        let m = rig.registry.mutex();
        rig.with_env(0, |env| m.lock(env).unwrap());
        rig.quiescer.register(ThreadId(1));
        let h = {
            let (rig, m) = (Arc::clone(&rig), m.clone());
            std::thread::spawn(move || rig.with_env(1, |env| m.lock(env)))
        };
        while m.core.state.lock().waiters == 0 {
            std::thread::yield_now();
        }
        assert!(!rig.registry.any_runnable_waiter());
        rig.quiescer.interrupt_all();
        assert!(matches!(h.join().unwrap(), Err(DetectorError::Interrupted)));
    }
}
