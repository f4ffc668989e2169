//! Synchronization record and replay.
//!
//! - [`event`]: event types and closed per-epoch logs
//! - [`recorder`]: lock-free-per-thread recording of the total order
//! - [`replay`]: the gate that enforces a recorded order
//! - [`primitives`]: tracked mutex, condvar and barrier

pub mod event;
pub mod primitives;
pub mod recorder;
pub mod replay;

pub use event::{SyncEvent, SyncLog, SyncObjectId, SyncOp, SyncTarget};
pub use primitives::{
    SyncEnv, SyncObject, SyncObjectState, SyncRegistry, TrackedBarrier, TrackedCondvar, TrackedMutex,
};
pub use recorder::{Segment, SyncRecorder};
pub use replay::{ReplayGate, Turn};
