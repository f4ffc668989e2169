//! Synchronization events and closed logs.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::thread::ThreadId;

/// Stable identity of a tracked mutex, condvar or barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SyncObjectId(pub u32);

impl std::fmt::Display for SyncObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Closed set of intercepted operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncOp {
    MutexLock,
    MutexTryLock,
    MutexUnlock,
    /// Condvar wait, first half: waiter registered and mutex released.
    CondWaitRelease,
    /// Condvar wait, second half: woken and mutex reacquired.
    CondWaitResume,
    CondSignal,
    CondBroadcast,
    BarrierArrive,
    ThreadSpawn,
    ThreadJoin,
}

/// What an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncTarget {
    Object(SyncObjectId),
    Thread(ThreadId),
}

impl std::fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(id) => write!(f, "{id}"),
            Self::Thread(t) => write!(f, "thread {t}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncEvent {
    /// Position in the epoch's total order.
    pub seq: u64,
    pub epoch: u64,
    pub thread: ThreadId,
    pub op: SyncOp,
    pub target: SyncTarget,
    /// Outcome of operations that have one (try-lock, barrier leader).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} t{} {:?}({})", self.seq, self.thread.0, self.op, self.target)?;
        if let Some(r) = self.result {
            write!(f, " -> {r}")?;
        }
        Ok(())
    }
}

/// All events of one epoch, sorted by sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncLog {
    pub epoch: u64,
    events: Vec<SyncEvent>,
}

impl SyncLog {
    /// Build a log from unsorted events.
    #[must_use]
    pub fn from_events(epoch: u64, mut events: Vec<SyncEvent>) -> Self {
        events.sort_by_key(|e| e.seq);
        Self { epoch, events }
    }

    #[must_use]
    pub fn events(&self) -> &[SyncEvent] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Indices of each thread's events, in order.
    #[must_use]
    pub fn per_thread(&self) -> BTreeMap<ThreadId, VecDeque<usize>> {
        let mut out: BTreeMap<ThreadId, VecDeque<usize>> = BTreeMap::new();
        for (i, e) in self.events.iter().enumerate() {
            out.entry(e.thread).or_default().push_back(i);
        }
        out
    }

    /// The order of (thread, op, target), ignoring sequence numbers.
    #[must_use]
    pub fn order(&self) -> Vec<(ThreadId, SyncOp, SyncTarget)> {
        self.events.iter().map(|e| (e.thread, e.op, e.target)).collect()
    }
}
