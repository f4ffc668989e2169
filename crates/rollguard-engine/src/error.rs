//! Error taxonomy.
//!
//! [`ErrorKind`] classifies bugs in the *tracked program*; they are detected,
//! localized through rollback and replay, and reported. [`DetectorError`] is
//! the engine's own error type. Two of its variants are special: `Detected`
//! carries a user-bug detection up to the thread context, and `Interrupted`
//! is the unwinding signal a rollback uses to stop every tracked thread.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::thread::ThreadId;
use crate::validator::Evidence;

/// User-program bug classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Guard bytes adjacent to a live allocation were modified.
    BufferOverflow,
    /// A quarantined (freed) object was read or written.
    UseAfterFree,
    /// Free of an already-freed or never-allocated address.
    DoubleFree,
    /// An in-heap object header or an allocation record failed its checksum.
    HeapMetadataCorruption,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BufferOverflow => "BufferOverflow",
            Self::UseAfterFree => "UseAfterFree",
            Self::DoubleFree => "DoubleFree",
            Self::HeapMetadataCorruption => "HeapMetadataCorruption",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// A user-program bug was detected by an instrumented operation.
    #[error("detected {0}")]
    Detected(Box<Evidence>),

    /// Rollback in progress; the current thread must unwind.
    #[error("interrupted by rollback")]
    Interrupted,

    /// Replayed execution did not match the recorded synchronization log.
    #[error("replay divergence in thread {thread}: expected {expected}, observed {observed}\n{diagnostics}")]
    ReplayDivergence {
        thread: ThreadId,
        expected: String,
        observed: String,
        diagnostics: String,
    },

    #[error("{pending} thread(s) did not reach a safe point within {timeout_ms} ms")]
    QuiescenceTimeout { pending: usize, timeout_ms: u64 },

    #[error("second rollback requested before epoch {epoch} was superseded")]
    RepeatedRollback { epoch: u64 },

    /// Rollback needs a sealed checkpoint; `run` seals one before any thread starts.
    #[error("rollback requested before any checkpoint was sealed")]
    NoCheckpoint,

    #[error("sub-heap of thread {thread} exhausted (requested {requested} bytes)")]
    HeapExhausted { thread: ThreadId, requested: usize },

    #[error("thread limit of {limit} reached")]
    TooManyThreads { limit: usize },

    #[error("access of {len} bytes at {addr:#x} lies outside the tracked heap")]
    OutOfRegion { addr: usize, len: usize },

    #[error("synchronization misuse by thread {thread}: {message}")]
    SyncMisuse { thread: ThreadId, message: String },

    #[error("thread {thread} failed: {message}")]
    ThreadFailed { thread: ThreadId, message: String },

    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    /// Wrap evidence into the `Detected` variant.
    #[must_use]
    pub fn detected(evidence: Evidence) -> Self {
        Self::Detected(Box::new(evidence))
    }

    /// True for errors that end the run regardless of configuration.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Detected(_) | Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::DetectionSource;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::BufferOverflow.to_string(), "BufferOverflow");
        assert_eq!(ErrorKind::UseAfterFree.as_str(), "UseAfterFree");
        assert_eq!(
            serde_json::to_string(&ErrorKind::DoubleFree).unwrap(),
            "\"DoubleFree\""
        );
    }

    #[test]
    fn detections_and_interrupts_are_not_fatal() {
        let ev = Evidence::new(ErrorKind::DoubleFree, 0x1000, DetectionSource::Free);
        assert!(!DetectorError::detected(ev).is_fatal());
        assert!(!DetectorError::Interrupted.is_fatal());
        assert!(DetectorError::RepeatedRollback { epoch: 3 }.is_fatal());
        assert!(DetectorError::NoCheckpoint.is_fatal());
        assert!(
            DetectorError::QuiescenceTimeout {
                pending: 1,
                timeout_ms: 10
            }
            .is_fatal()
        );
    }

    #[test]
    fn divergence_message_carries_diagnostics() {
        let err = DetectorError::ReplayDivergence {
            thread: ThreadId(2),
            expected: "MutexLock(m0)".into(),
            observed: "MutexUnlock(m0)".into(),
            diagnostics: "cursor=4 horizon=9".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("thread 2"));
        assert!(msg.contains("cursor=4"));
    }
}
