//! Checkpoint/rollback engine for a multithreaded heap-error detector.
//!
//! Programs run against a tracked heap region. Execution is never stopped at
//! the instant a bug is tripped: the engine checkpoints periodically, and
//! when corruption evidence surfaces later it rolls the heap back to the last
//! checkpoint and replays the recorded synchronization order with full
//! validation, so the report points at the operation that did the damage.
//!
//! # Architecture
//!
//! - **Bootstrap arena** (`bootstrap`): fixed mmap arena for engine metadata
//! - **Heap region** (`region`): the mmap'd, page-protected heap
//! - **Page tracker** (`page_tracker`): CLEAN/CAPTURING/DIRTY page states and twins
//! - **Fault interception** (`fault`): SIGSEGV dispatch into page trackers
//! - **Fingerprints** (`fingerprint`): per-allocation guard patterns and checksums
//! - **Heap shim** (`heap`, `quarantine`): per-thread sub-heaps and quarantine
//! - **Validator** (`validator`): guard, header and quarantine checks
//! - **Sync record/replay** (`sync`): tracked primitives, logs and the replay gate
//! - **Quiescence** (`quiesce`): cooperative stop-the-world barrier
//! - **Checkpoints** (`checkpoint`): epoch state machine and snapshots
//! - **Rollback** (`rollback`): restore, replay, report, neutralize
//! - **Engine** (`engine`, `thread`): thread runtime and coordinator loop
//! - **Configuration** (`config`), **Errors** (`error`), **Metrics** (`metrics`),
//!   **Structured logging** (`structured_log`), **Reports** (`report`)

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod fingerprint;
pub mod heap;
pub mod metrics;
pub mod page_tracker;
pub mod quarantine;
pub mod quiesce;
pub mod region;
pub mod report;
pub mod rollback;
pub mod structured_log;
pub mod sync;
pub mod thread;
pub mod validator;

pub use config::{CheckpointPolicy, OnDetection, RollguardConfig, TrackingMode, Verbosity};
pub use engine::{Engine, EngineEvent, ExternalReporter, Incident, RunOutcome, RunSummary};
pub use error::{DetectorError, ErrorKind};
pub use heap::{AllocId, HeapPtr, SiteLoc};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use report::{DetectionReport, LeakSite, Reproduction, Resolution};
pub use rollback::Neutralization;
pub use structured_log::{LogEmitter, LogEntry, LogLevel, SharedBuffer};
pub use sync::{SyncEvent, SyncLog, SyncOp, TrackedBarrier, TrackedCondvar, TrackedMutex};
pub use thread::{Flow, ThreadBody, ThreadContext, ThreadHandle, ThreadId, thread_body};
pub use validator::{DetectionSource, Evidence};
