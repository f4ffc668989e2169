//! Append-only per-thread recording of synchronization order.
//!
//! Each thread appends to its own segment, so recording never contends with
//! other threads. The sequence number is drawn from one global counter while
//! the primitive's internal lock is held; that makes sequence order agree with
//! the order in which the operations really took effect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::event::{SyncEvent, SyncLog, SyncOp, SyncTarget};
use crate::thread::ThreadId;

/// One thread's pending events.
pub type Segment = Arc<Mutex<Vec<SyncEvent>>>;

pub struct SyncRecorder {
    seq: AtomicU64,
    epoch: AtomicU64,
    recorded: AtomicU64,
    segments: Mutex<Vec<Segment>>,
}

impl Default for SyncRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
            segments: Mutex::new(Vec::new()),
        }
    }

    /// The segment belonging to `thread`, created on first use.
    #[must_use]
    pub fn segment(&self, thread: ThreadId) -> Segment {
        let mut segments = self.segments.lock();
        while segments.len() <= thread.index() {
            segments.push(Arc::new(Mutex::new(Vec::new())));
        }
        Arc::clone(&segments[thread.index()])
    }

    /// Append one event. Call with the primitive's state lock held.
    pub fn record(
        &self,
        segment: &Segment,
        thread: ThreadId,
        op: SyncOp,
        target: SyncTarget,
        result: Option<bool>,
    ) -> SyncEvent {
        let event = SyncEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            epoch: self.epoch.load(Ordering::Relaxed),
            thread,
            op,
            target,
            result,
        };
        segment.lock().push(event);
        self.recorded.fetch_add(1, Ordering::Relaxed);
        event
    }

    /// Next sequence number to be handed out in the open epoch.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Total events recorded since creation.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Events recorded in the open epoch and not yet closed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.segments.lock().iter().map(|s| s.lock().len()).sum()
    }

    /// Merge all segments into a log sorted by sequence number, then start
    /// `next_epoch` with the counter reset. Callers hold quiescence.
    pub fn close_epoch(&self, next_epoch: u64) -> SyncLog {
        let segments = self.segments.lock();
        let mut events = Vec::new();
        for seg in segments.iter() {
            events.append(&mut seg.lock());
        }
        let closed = self.epoch.swap(next_epoch, Ordering::Relaxed);
        self.seq.store(0, Ordering::SeqCst);
        SyncLog::from_events(closed, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::SyncObjectId;

    const M: SyncTarget = SyncTarget::Object(SyncObjectId(0));

    #[test]
    fn close_epoch_merges_by_sequence() {
        let r = SyncRecorder::new();
        let s0 = r.segment(ThreadId(0));
        let s1 = r.segment(ThreadId(1));
        r.record(&s1, ThreadId(1), SyncOp::MutexLock, M, None);
        r.record(&s0, ThreadId(0), SyncOp::MutexLock, M, None);
        r.record(&s1, ThreadId(1), SyncOp::MutexUnlock, M, None);
        assert_eq!(r.pending(), 3);

        let log = r.close_epoch(1);
        assert_eq!(log.epoch, 0);
        let threads: Vec<_> = log.events().iter().map(|e| e.thread.0).collect();
        assert_eq!(threads, vec![1, 0, 1]);
        assert_eq!(r.current_seq(), 0);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.epoch(), 1);
        assert_eq!(r.record(&s0, ThreadId(0), SyncOp::MutexUnlock, M, None).epoch, 1);
    }

    #[test]
    fn concurrent_recording_yields_dense_sequence() {
        let r = Arc::new(SyncRecorder::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    let seg = r.segment(ThreadId(t));
                    for _ in 0..250 {
                        r.record(&seg, ThreadId(t), SyncOp::CondSignal, M, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let log = r.close_epoch(1);
        let seqs: Vec<_> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..1000).collect::<Vec<_>>());
    }
}
