//! Tracked threads: identities, re-executable bodies, the thread table and
//! the per-thread [`ThreadContext`] through which every memory and sync
//! operation is intercepted.
//!
//! A thread body is called for `unit = 0, 1, 2, ...` until it returns
//! [`Flow::Done`]. Its restart point is simply the next unit index, which is
//! what the thread table records and what checkpoints snapshot.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::engine::{EngineEvent, Shared};
use crate::error::{DetectorError, ErrorKind};
use crate::heap::{AllocId, HeapPtr, SiteLoc};
use crate::metrics::EngineMetrics;
use crate::sync::event::{SyncOp, SyncTarget};
use crate::sync::primitives::gated;
use crate::sync::replay::Turn;
use crate::sync::{Segment, SyncEnv, TrackedBarrier, TrackedCondvar, TrackedMutex};
use crate::validator::{Access, DetectionSource, Evidence, ValidationLevel};

/// Per-thread operations kept for reports.
pub const HISTORY_LEN: usize = 32;

/// Deterministic thread identity. Root threads are numbered from 0 in
/// registration order; spawned threads take the next free number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadId(pub u32);

impl ThreadId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a body asks for after finishing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// A re-executable thread body.
pub type ThreadBody = Arc<dyn Fn(&ThreadContext, u64) -> Result<Flow, DetectorError> + Send + Sync>;

/// Wrap a closure as a [`ThreadBody`].
pub fn thread_body<F>(f: F) -> ThreadBody
where
    F: Fn(&ThreadContext, u64) -> Result<Flow, DetectorError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle to a spawned thread, consumed by [`ThreadContext::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    id: ThreadId,
}

impl ThreadHandle {
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Operation history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpKind {
    Malloc,
    Calloc,
    Realloc,
    Free,
    Read,
    Write,
    Fill,
    Sync(SyncOp),
}

/// One intercepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpRecord {
    pub unit: u64,
    pub kind: OpKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    pub len: usize,
    pub site: SiteLoc,
}

impl std::fmt::Display for OpRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit {} {:?}", self.unit, self.kind)?;
        if let Some(addr) = self.addr {
            write!(f, " {addr:#x}")?;
        }
        if self.len > 0 {
            write!(f, " len {}", self.len)?;
        }
        write!(f, " at {}", self.site)
    }
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    Running,
    Exited,
}

#[derive(Clone)]
struct ThreadSlot {
    body: ThreadBody,
    next_unit: u64,
    status: SlotStatus,
    joined: bool,
}

/// Restart points of every thread, as saved in a checkpoint.
#[derive(Clone, Default)]
pub struct ThreadTableSnapshot {
    slots: Vec<ThreadSlot>,
}

impl ThreadTableSnapshot {
    /// `(thread, next unit, status)` for every known thread.
    #[must_use]
    pub fn restart_points(&self) -> Vec<(ThreadId, u64, SlotStatus)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (ThreadId(i as u32), s.next_unit, s.status))
            .collect()
    }
}

/// How a thread's OS thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExit {
    Done,
    /// Unwound by a rollback while executing `unit` (`in_unit`) or waiting
    /// at its boundary.
    Interrupted { unit: u64, in_unit: bool },
    /// Raised a detection in `unit`.
    Stopped { unit: u64 },
    Failed { unit: u64 },
}

impl ThreadExit {
    /// Replay limit for this thread: units below it may run.
    #[must_use]
    pub const fn frontier(self) -> Option<u64> {
        match self {
            Self::Done => None,
            Self::Interrupted { unit, in_unit } => Some(if in_unit { unit + 1 } else { unit }),
            Self::Stopped { unit } | Self::Failed { unit } => Some(unit + 1),
        }
    }
}

/// Registry of tracked threads, their bodies and restart points.
pub struct ThreadTable {
    slots: Mutex<Vec<ThreadSlot>>,
    cond: Condvar,
    /// Joiner -> joined thread, for settle detection.
    joiners: Mutex<BTreeMap<ThreadId, ThreadId>>,
    handles: Mutex<Vec<(ThreadId, JoinHandle<ThreadExit>)>>,
    limit: usize,
}

impl ThreadTable {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            joiners: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            limit,
        }
    }

    /// Add a thread with the next free id.
    pub fn add(&self, body: ThreadBody) -> Result<ThreadId, DetectorError> {
        let mut slots = self.slots.lock();
        Self::push(&mut slots, body, self.limit)
    }

    fn push(slots: &mut Vec<ThreadSlot>, body: ThreadBody, limit: usize) -> Result<ThreadId, DetectorError> {
        if slots.len() >= limit {
            return Err(DetectorError::TooManyThreads { limit });
        }
        let id = ThreadId(slots.len() as u32);
        slots.push(ThreadSlot {
            body,
            next_unit: 0,
            status: SlotStatus::Running,
            joined: false,
        });
        Ok(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn body_and_unit(&self, id: ThreadId) -> Result<(ThreadBody, u64), DetectorError> {
        let slots = self.slots.lock();
        let slot = slots.get(id.index()).ok_or(DetectorError::UnknownThread(id))?;
        Ok((Arc::clone(&slot.body), slot.next_unit))
    }

    fn set_next_unit(&self, id: ThreadId, unit: u64) {
        if let Some(slot) = self.slots.lock().get_mut(id.index()) {
            slot.next_unit = unit;
        }
    }

    fn finish(&self, id: ThreadId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id.index()) {
            slot.status = SlotStatus::Exited;
        }
        self.cond.notify_all();
    }

    #[must_use]
    pub fn status(&self, id: ThreadId) -> Option<SlotStatus> {
        self.slots.lock().get(id.index()).map(|s| s.status)
    }

    /// Threads that have not exited.
    #[must_use]
    pub fn running(&self) -> Vec<ThreadId> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SlotStatus::Running)
            .map(|(i, _)| ThreadId(i as u32))
            .collect()
    }

    #[must_use]
    pub fn all_exited(&self) -> bool {
        self.slots.lock().iter().all(|s| s.status == SlotStatus::Exited)
    }

    #[must_use]
    pub fn snapshot(&self) -> ThreadTableSnapshot {
        ThreadTableSnapshot {
            slots: self.slots.lock().clone(),
        }
    }

    pub fn restore(&self, snapshot: &ThreadTableSnapshot) {
        *self.slots.lock() = snapshot.slots.clone();
        self.joiners.lock().clear();
        self.cond.notify_all();
    }

    /// A joiner is blocked on a thread that has already exited.
    #[must_use]
    pub fn has_runnable_joiner(&self) -> bool {
        let joiners = self.joiners.lock().clone();
        let slots = self.slots.lock();
        joiners.values().any(|t| {
            slots
                .get(t.index())
                .is_some_and(|s| s.status == SlotStatus::Exited)
        })
    }

    fn add_handle(&self, id: ThreadId, handle: JoinHandle<ThreadExit>) {
        self.handles.lock().push((id, handle));
    }

    /// Join every launched OS thread and collect how each ended.
    pub fn join_all(&self) -> BTreeMap<ThreadId, ThreadExit> {
        let mut out = BTreeMap::new();
        loop {
            let batch: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if batch.is_empty() {
                return out;
            }
            for (id, handle) in batch {
                let exit = handle.join().unwrap_or(ThreadExit::Failed { unit: 0 });
                out.insert(id, exit);
            }
        }
    }
}

/// Start an OS thread for `id`, resuming at its recorded restart point.
pub(crate) fn launch(shared: &Arc<Shared>, id: ThreadId) -> Result<(), DetectorError> {
    shared.quiescer.register(id);
    let runner_shared = Arc::clone(shared);
    let handle = std::thread::Builder::new()
        .name(format!("rollguard-t{}", id.0))
        .spawn(move || run_thread(&runner_shared, id))?;
    shared.threads.add_handle(id, handle);
    Ok(())
}

fn run_thread(shared: &Arc<Shared>, id: ThreadId) -> ThreadExit {
    let (body, mut unit) = match shared.threads.body_and_unit(id) {
        Ok(found) => found,
        Err(err) => {
            shared.send(EngineEvent::Fatal(err));
            shared.quiescer.stop(id);
            return ThreadExit::Failed { unit: 0 };
        }
    };
    let ctx = ThreadContext::new(Arc::clone(shared), id);
    loop {
        if shared.frontier_of(id).is_some_and(|f| unit >= f) {
            if let Err(err) = shared.quiescer.park_frontier(id) {
                return fail(shared, id, err, unit, false);
            }
        }
        if let Err(err) = shared.quiescer.boundary(id) {
            return fail(shared, id, err, unit, false);
        }
        ctx.unit.set(unit);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| body(&ctx, unit)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(DetectorError::ThreadFailed { thread: id, message })
            });
        match outcome {
            Ok(Flow::Continue) => {
                unit += 1;
                shared.threads.set_next_unit(id, unit);
            }
            Ok(Flow::Done) => {
                shared.threads.set_next_unit(id, unit + 1);
                shared.threads.finish(id);
                shared.quiescer.exit(id);
                shared.send(EngineEvent::ThreadExited(id));
                return ThreadExit::Done;
            }
            Err(err) => return fail_with_history(shared, &ctx, err, unit),
        }
    }
}

fn fail(shared: &Shared, id: ThreadId, err: DetectorError, unit: u64, in_unit: bool) -> ThreadExit {
    match err {
        DetectorError::Interrupted => {
            shared.quiescer.exit(id);
            ThreadExit::Interrupted { unit, in_unit }
        }
        other => {
            shared.send(EngineEvent::Fatal(other));
            shared.quiescer.stop(id);
            ThreadExit::Failed { unit }
        }
    }
}

fn fail_with_history(shared: &Shared, ctx: &ThreadContext, err: DetectorError, unit: u64) -> ThreadExit {
    match err {
        DetectorError::Detected(evidence) => {
            let incident = shared.incident(*evidence, Some(ctx.id), ctx.history());
            // Caught at the operation itself when validating every access.
            if shared.pinpointing() {
                shared.send(EngineEvent::Pinpointed(Box::new(incident)));
            } else {
                shared.send(EngineEvent::Detection(Box::new(incident)));
            }
            // Only counts as stopped once the incident is queued.
            shared.quiescer.stop(ctx.id);
            ThreadExit::Stopped { unit }
        }
        other => fail(shared, ctx.id, other, unit, true),
    }
}

// ---------------------------------------------------------------------------
// Thread context
// ---------------------------------------------------------------------------

/// Interception surface handed to a thread body.
pub struct ThreadContext {
    shared: Arc<Shared>,
    id: ThreadId,
    segment: Segment,
    unit: Cell<u64>,
    history: RefCell<VecDeque<OpRecord>>,
}

impl ThreadContext {
    pub(crate) fn new(shared: Arc<Shared>, id: ThreadId) -> Self {
        let segment = shared.recorder.segment(id);
        Self {
            shared,
            id,
            segment,
            unit: Cell::new(0),
            history: RefCell::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Unit currently executing.
    #[must_use]
    pub fn unit(&self) -> u64 {
        self.unit.get()
    }

    /// True while a rollback is re-executing recorded work.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.shared.is_replaying()
    }

    /// Most recent operations of this thread, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<OpRecord> {
        self.history.borrow().iter().copied().collect()
    }

    fn note(&self, kind: OpKind, addr: Option<usize>, len: usize, site: SiteLoc) {
        let mut history = self.history.borrow_mut();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(OpRecord {
            unit: self.unit.get(),
            kind,
            addr,
            len,
            site,
        });
    }

    fn env(&self) -> SyncEnv<'_> {
        SyncEnv {
            thread: self.id,
            recorder: &self.shared.recorder,
            segment: &self.segment,
            gate: &self.shared.gate,
            quiescer: &self.shared.quiescer,
            tick: self.shared.config.tick(),
        }
    }

    /// Explicit safe point for long computations without other operations.
    pub fn yield_point(&self) -> Result<(), DetectorError> {
        self.shared.quiescer.op_point()
    }

    /// Ask the coordinator for a checkpoint at the next opportunity.
    pub fn request_checkpoint(&self) {
        self.shared.checkpoint_requested.store(true, Ordering::Release);
        self.shared.send(EngineEvent::CheckpointRequested(self.id));
    }

    /// Report an access trapped outside the instrumented operations.
    pub fn report_external(&self, evidence: Evidence) {
        let evidence = evidence
            .with_source(DetectionSource::External)
            .with_thread(self.id);
        let incident = self.shared.incident(evidence, Some(self.id), self.history());
        self.shared.send(EngineEvent::Detection(Box::new(incident)));
    }

    /// Handle a violation caught at the operation. Under `Continue` the
    /// incident is reported and the caller neutralizes the operation;
    /// otherwise the violation unwinds the unit.
    fn violation(&self, evidence: Evidence) -> Result<(), DetectorError> {
        let evidence = evidence.with_thread(self.id);
        if !self.shared.continue_mode() {
            return Err(DetectorError::detected(evidence));
        }
        let incident = self.shared.incident(evidence, Some(self.id), self.history());
        self.shared.send(EngineEvent::Pinpointed(Box::new(incident)));
        EngineMetrics::inc(&self.shared.metrics.neutralized);
        Ok(())
    }

    fn full_validation(&self) -> bool {
        self.shared.validator.level() == ValidationLevel::Full
    }

    // -- memory -------------------------------------------------------------

    #[track_caller]
    pub fn malloc(&self, size: usize) -> Result<HeapPtr, DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Malloc, None, size, site);
        let ptr = self.shared.heap.malloc(self.id, size, site)?;
        self.count_allocation();
        Ok(ptr)
    }

    #[track_caller]
    pub fn calloc(&self, count: usize, size: usize) -> Result<HeapPtr, DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Calloc, None, count.saturating_mul(size), site);
        let ptr = self.shared.heap.calloc(self.id, count, size, site)?;
        self.count_allocation();
        Ok(ptr)
    }

    #[track_caller]
    pub fn realloc(&self, ptr: Option<HeapPtr>, size: usize) -> Result<HeapPtr, DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Realloc, ptr.map(HeapPtr::addr), size, site);
        match self.shared.heap.realloc(self.id, ptr, size, site) {
            Ok(fresh) => {
                self.count_allocation();
                Ok(fresh)
            }
            Err(DetectorError::Detected(ev)) if self.full_validation() => {
                let rec = ev.allocation.as_ref().map(|r| r.id);
                self.violation(*ev)?;
                self.neutralize_damaged(rec)?;
                Ok(self.shared.heap.realloc(self.id, ptr, size, site)?)
            }
            Err(err) => Err(err),
        }
    }

    fn count_allocation(&self) {
        EngineMetrics::inc(&self.shared.metrics.allocations);
        self.shared.allocs_since_checkpoint.fetch_add(1, Ordering::Relaxed);
    }

    #[track_caller]
    pub fn free(&self, ptr: HeapPtr) -> Result<(), DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Free, Some(ptr.addr()), 0, site);
        match self.shared.heap.free(self.id, ptr, site) {
            Ok(recycled) => {
                EngineMetrics::inc(&self.shared.metrics.frees);
                EngineMetrics::add(&self.shared.metrics.quarantine_evictions, recycled as u64);
                Ok(())
            }
            Err(DetectorError::Detected(ev)) if self.full_validation() => {
                let kind = ev.kind;
                let source = ev.source;
                let rec = ev.allocation.as_ref().map(|r| r.id);
                self.violation(*ev)?;
                // Double frees and dirty evictions are already neutralized:
                // the block is in quarantine or retired.
                if kind == ErrorKind::DoubleFree || source == DetectionSource::QuarantineEviction {
                    return Ok(());
                }
                self.neutralize_damaged(rec)?;
                self.shared.heap.free(self.id, ptr, site).map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    fn neutralize_damaged(&self, rec: Option<AllocId>) -> Result<(), DetectorError> {
        if let Some(id) = rec {
            self.shared.heap.repair(id)?;
        }
        Ok(())
    }

    #[track_caller]
    pub fn write(&self, ptr: HeapPtr, bytes: &[u8]) -> Result<(), DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Write, Some(ptr.addr()), bytes.len(), site);
        if self.full_validation() {
            if let Some(ev) = self.check(ptr.addr(), bytes.len(), Access::Write) {
                self.violation(ev)?;
                return self.write_clipped(ptr.addr(), bytes);
            }
        }
        self.raw_write(ptr.addr(), bytes)
    }

    #[track_caller]
    pub fn fill(&self, ptr: HeapPtr, byte: u8, len: usize) -> Result<(), DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Fill, Some(ptr.addr()), len, site);
        if self.full_validation() {
            if let Some(ev) = self.check(ptr.addr(), len, Access::Write) {
                self.violation(ev)?;
                return self.write_clipped(ptr.addr(), &vec![byte; len]);
            }
        }
        if self.shared.heap.tracker().fill(ptr.addr(), byte, len, Some(self.id)) {
            Ok(())
        } else {
            Err(DetectorError::OutOfRegion { addr: ptr.addr(), len })
        }
    }

    #[track_caller]
    pub fn read(&self, ptr: HeapPtr, len: usize) -> Result<Vec<u8>, DetectorError> {
        let site = SiteLoc::caller();
        self.shared.quiescer.op_point()?;
        self.note(OpKind::Read, Some(ptr.addr()), len, site);
        if self.full_validation() {
            if let Some(ev) = self.check(ptr.addr(), len, Access::Read) {
                // Reads change nothing; under Continue the bytes are returned.
                self.violation(ev)?;
            }
        }
        self.shared
            .heap
            .tracker()
            .read_vec(ptr.addr(), len)
            .ok_or(DetectorError::OutOfRegion { addr: ptr.addr(), len })
    }

    #[track_caller]
    pub fn write_u64(&self, ptr: HeapPtr, value: u64) -> Result<(), DetectorError> {
        self.write(ptr, &value.to_le_bytes())
    }

    #[track_caller]
    pub fn read_u64(&self, ptr: HeapPtr) -> Result<u64, DetectorError> {
        let bytes = self.read(ptr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn check(&self, addr: usize, len: usize, access: Access) -> Option<Evidence> {
        self.shared
            .validator
            .check_access(&self.shared.heap, self.id, addr, len, access)
    }

    fn raw_write(&self, addr: usize, bytes: &[u8]) -> Result<(), DetectorError> {
        if self.shared.heap.tracker().write(addr, bytes, Some(self.id)) {
            Ok(())
        } else {
            Err(DetectorError::OutOfRegion {
                addr,
                len: bytes.len(),
            })
        }
    }

    /// Perform only the part of a write that lands in the live payload it
    /// starts in. Writes starting in a freed payload are dropped and the
    /// block is retired.
    fn write_clipped(&self, addr: usize, bytes: &[u8]) -> Result<(), DetectorError> {
        let heap = &self.shared.heap;
        match heap.find_containing(addr) {
            Some(rec) if rec.is_live() && addr >= rec.user_base && addr < rec.user_end() => {
                let keep = (rec.user_end() - addr).min(bytes.len());
                self.raw_write(addr, &bytes[..keep])
            }
            Some(rec) if !rec.is_live() => {
                heap.evict(rec.id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -- synchronization ----------------------------------------------------

    #[track_caller]
    pub fn lock(&self, mutex: &TrackedMutex) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::MutexLock);
        mutex.lock(&self.env())
    }

    #[track_caller]
    pub fn try_lock(&self, mutex: &TrackedMutex) -> Result<bool, DetectorError> {
        self.note_sync(SyncOp::MutexTryLock);
        mutex.try_lock(&self.env())
    }

    #[track_caller]
    pub fn unlock(&self, mutex: &TrackedMutex) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::MutexUnlock);
        mutex.unlock(&self.env())
    }

    #[track_caller]
    pub fn wait(&self, condvar: &TrackedCondvar, mutex: &TrackedMutex) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::CondWaitRelease);
        condvar.wait(mutex, &self.env())
    }

    #[track_caller]
    pub fn signal(&self, condvar: &TrackedCondvar) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::CondSignal);
        condvar.signal(&self.env())
    }

    #[track_caller]
    pub fn broadcast(&self, condvar: &TrackedCondvar) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::CondBroadcast);
        condvar.broadcast(&self.env())
    }

    /// Returns `true` in the one thread that completed the round.
    #[track_caller]
    pub fn barrier_wait(&self, barrier: &TrackedBarrier) -> Result<bool, DetectorError> {
        self.note_sync(SyncOp::BarrierArrive);
        barrier.wait(&self.env())
    }

    #[track_caller]
    fn note_sync(&self, op: SyncOp) {
        self.note(OpKind::Sync(op), None, 0, SiteLoc::caller());
    }

    /// Start a new tracked thread running `body` from unit 0.
    #[track_caller]
    pub fn spawn(&self, body: ThreadBody) -> Result<ThreadHandle, DetectorError> {
        self.note_sync(SyncOp::ThreadSpawn);
        let env = self.env();
        let threads = &self.shared.threads;
        let expected = ThreadId(threads.len() as u32);
        let child = gated(&env, SyncOp::ThreadSpawn, SyncTarget::Thread(expected), |turn| {
            let mut slots = threads.slots.lock();
            let child = ThreadTable::push(&mut slots, body, threads.limit)?;
            if let Turn::Replay(ev) = turn {
                if ev.target != SyncTarget::Thread(child) {
                    slots.pop();
                    return Err(DetectorError::ReplayDivergence {
                        thread: self.id,
                        expected: format!("ThreadSpawn({})", ev.target),
                        observed: format!("ThreadSpawn(thread {child})"),
                        diagnostics: format!("threads={}", slots.len()),
                    });
                }
            }
            env.recorder
                .record(&self.segment, self.id, SyncOp::ThreadSpawn, SyncTarget::Thread(child), None);
            Ok(child)
        })?;
        launch(&self.shared, child)?;
        Ok(ThreadHandle { id: child })
    }

    /// Wait for a spawned thread to finish.
    #[track_caller]
    pub fn join(&self, handle: ThreadHandle) -> Result<(), DetectorError> {
        self.note_sync(SyncOp::ThreadJoin);
        let env = self.env();
        let child = handle.id;
        if child == self.id {
            return Err(DetectorError::SyncMisuse {
                thread: self.id,
                message: "thread joined itself".into(),
            });
        }
        let threads = &self.shared.threads;
        gated(&env, SyncOp::ThreadJoin, SyncTarget::Thread(child), |_| {
            let mut slots = threads.slots.lock();
            let exited = |slots: &Vec<ThreadSlot>| -> Result<bool, DetectorError> {
                let slot = slots.get(child.index()).ok_or(DetectorError::UnknownThread(child))?;
                Ok(slot.status == SlotStatus::Exited)
            };
            if !exited(&slots)? {
                threads.joiners.lock().insert(self.id, child);
                self.shared.quiescer.block_begin(self.id);
                let waited = loop {
                    if self.shared.quiescer.interrupted() {
                        break Err(DetectorError::Interrupted);
                    }
                    match exited(&slots) {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(err) => break Err(err),
                    }
                    threads.cond.wait_for(&mut slots, env.tick);
                };
                threads.joiners.lock().remove(&self.id);
                self.shared.quiescer.block_end(self.id);
                waited?;
            }
            let slot = &mut slots[child.index()];
            if slot.joined {
                return Err(DetectorError::SyncMisuse {
                    thread: self.id,
                    message: format!("thread {child} joined twice"),
                });
            }
            slot.joined = true;
            env.recorder
                .record(&self.segment, self.id, SyncOp::ThreadJoin, SyncTarget::Thread(child), None);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ThreadBody {
        thread_body(|_, _| Ok(Flow::Done))
    }

    #[test]
    fn table_assigns_sequential_ids_up_to_limit() {
        let table = ThreadTable::new(2);
        assert_eq!(table.add(noop()).unwrap(), ThreadId(0));
        assert_eq!(table.add(noop()).unwrap(), ThreadId(1));
        assert!(matches!(
            table.add(noop()),
            Err(DetectorError::TooManyThreads { limit: 2 })
        ));
    }

    #[test]
    fn snapshot_restores_restart_points() {
        let table = ThreadTable::new(4);
        let t0 = table.add(noop()).unwrap();
        table.set_next_unit(t0, 3);
        let snap = table.snapshot();
        table.set_next_unit(t0, 9);
        table.finish(t0);
        assert!(table.all_exited());
        table.restore(&snap);
        assert_eq!(snap.restart_points(), vec![(t0, 3, SlotStatus::Running)]);
        assert_eq!(table.status(t0), Some(SlotStatus::Running));
        assert_eq!(table.running(), vec![t0]);
    }

    #[test]
    fn frontier_depends_on_where_the_thread_stopped() {
        assert_eq!(ThreadExit::Done.frontier(), None);
        assert_eq!(
            ThreadExit::Interrupted {
                unit: 4,
                in_unit: true
            }
            .frontier(),
            Some(5)
        );
        assert_eq!(
            ThreadExit::Interrupted {
                unit: 4,
                in_unit: false
            }
            .frontier(),
            Some(4)
        );
        assert_eq!(ThreadExit::Stopped { unit: 2 }.frontier(), Some(3));
    }

    #[test]
    fn op_record_display_names_site() {
        let rec = OpRecord {
            unit: 2,
            kind: OpKind::Write,
            addr: Some(0x1000),
            len: 9,
            site: SiteLoc {
                file: "prog.rs",
                line: 12,
            },
        };
        assert_eq!(rec.to_string(), "unit 2 Write 0x1000 len 9 at prog.rs:12");
    }
}
