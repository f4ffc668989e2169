//! Rollback controller.
//!
//! On a detection the coordinator hands control here. Every tracked thread
//! is unwound, the heap and all engine state go back to the last checkpoint,
//! and the threads are relaunched under the recorded synchronization order
//! with full validation. Each thread may only run up to the unit it had
//! reached when the detection fired (its frontier). Replay ends when an
//! instrumented operation trips over the corruption, or when nothing can
//! make progress any more, at which point a validation scan decides
//! whether the damage reappeared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::engine::{EngineEvent, Incident, Shared};
use crate::error::{DetectorError, ErrorKind};
use crate::heap::AllocId;
use crate::metrics::EngineMetrics;
use crate::report::{DetectionReport, Reproduction, Resolution};
use crate::structured_log::{LogEmitter, LogLevel};
use crate::thread::{self, ThreadId};
use crate::validator::{Evidence, ValidationLevel};

/// What the coordinator lends the controller for one rollback.
pub(crate) struct RollbackParts<'a> {
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) events: &'a Receiver<EngineEvent>,
    pub(crate) checkpoint: &'a Checkpoint,
    pub(crate) log: &'a mut LogEmitter,
}

pub(crate) enum RollbackResult {
    /// Every thread has been stopped.
    Terminated(DetectionReport),
    /// The corruption was neutralized and execution resumed past the frontier.
    Continued(DetectionReport),
}

/// Repair applied to the heap before execution continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neutralization {
    /// Retire a freed block that was written after free.
    Evict(AllocId),
    /// Rewrite guard bytes and header of a damaged allocation.
    Repair(AllocId),
    /// The second free never took effect.
    IgnoreDoubleFree,
    None,
}

impl Neutralization {
    /// Action for evidence surfaced by a scan rather than at the operation.
    #[must_use]
    pub fn for_evidence(evidence: &Evidence) -> Self {
        let Some(rec) = evidence.allocation.as_ref() else {
            return match evidence.kind {
                ErrorKind::DoubleFree => Self::IgnoreDoubleFree,
                _ => Self::None,
            };
        };
        match evidence.kind {
            ErrorKind::UseAfterFree => Self::Evict(rec.id),
            ErrorKind::BufferOverflow | ErrorKind::HeapMetadataCorruption => Self::Repair(rec.id),
            ErrorKind::DoubleFree => Self::IgnoreDoubleFree,
        }
    }

    fn apply(self, shared: &Shared) -> Result<bool, DetectorError> {
        match self {
            Self::Evict(id) => Ok(shared.heap.evict(id)),
            Self::Repair(id) => shared.heap.repair(id),
            Self::IgnoreDoubleFree | Self::None => Ok(false),
        }
    }
}

/// Restore, replay and resolve one detection.
pub(crate) fn run(parts: RollbackParts<'_>, trigger: Incident) -> Result<RollbackResult, DetectorError> {
    let RollbackParts {
        shared,
        events,
        checkpoint,
        log,
    } = parts;
    let started = Instant::now();

    let exits = shared.stop_all();
    drain(events)?;
    let frontiers: BTreeMap<ThreadId, Option<u64>> =
        exits.iter().map(|(id, exit)| (*id, exit.frontier())).collect();

    // The epoch is re-run, so the recorder keeps its number.
    let sync_log = shared.recorder.close_epoch(checkpoint.epoch);
    let restored = shared.heap.tracker().restore_all_dirty()?;
    EngineMetrics::add(&shared.metrics.pages_restored, restored as u64);
    shared.heap.restore(&checkpoint.heap);
    shared.heap.set_epoch(checkpoint.epoch);
    shared.registry.restore(&checkpoint.objects);
    shared.threads.restore(&checkpoint.threads);
    shared.quiescer.reset();

    if log.enabled(LogLevel::Warn) {
        let limits: BTreeMap<String, Option<u64>> =
            frontiers.iter().map(|(id, f)| (id.to_string(), *f)).collect();
        let entry = log
            .entry(LogLevel::Warn, "rollback")
            .with_epoch(checkpoint.epoch)
            .with_kind(trigger.evidence.kind)
            .with_address(trigger.evidence.address)
            .with_details(serde_json::json!({
                "trigger": trigger.evidence.source,
                "pages_restored": restored,
                "sync_events": sync_log.len(),
                "frontiers": limits,
            }));
        let _ = log.emit_entry(entry);
    }

    shared.validator.set_level(ValidationLevel::Full);
    *shared.frontiers.lock() = frontiers;
    shared.replaying.store(true, Ordering::Release);
    shared.gate.load(&sync_log);
    shared.quiescer.close_frontier();
    for id in shared.threads.running() {
        thread::launch(shared, id)?;
    }

    let (found, reproduction) = match await_reproduction(shared, events, &trigger) {
        Ok(found) => found,
        Err(err) => {
            shared.stop_all();
            end_replay(shared);
            return Err(err);
        }
    };
    let (cursor, horizon) = shared.gate.progress();

    if log.enabled(LogLevel::Info) {
        let entry = log
            .entry(LogLevel::Info, "replay_end")
            .with_epoch(checkpoint.epoch)
            .with_kind(found.evidence.kind)
            .with_duration_us(started.elapsed().as_micros() as u64)
            .with_details(serde_json::json!({
                "reproduction": reproduction,
                "replayed": cursor,
                "recorded": horizon,
            }));
        let _ = log.emit_entry(entry);
    }

    if !shared.continue_mode() {
        shared.stop_all();
        drain(events)?;
        end_replay(shared);
        let report = DetectionReport::new(&trigger, &found, reproduction, Resolution::Terminated);
        return Ok(RollbackResult::Terminated(report));
    }

    // Pinpointed violations were already neutralized at the operation.
    if reproduction != Reproduction::Pinpointed {
        let action = Neutralization::for_evidence(&found.evidence);
        if action.apply(shared)? {
            EngineMetrics::inc(&shared.metrics.neutralized);
        }
        if log.enabled(LogLevel::Debug) {
            let entry = log
                .entry(LogLevel::Debug, "neutralize")
                .with_epoch(checkpoint.epoch)
                .with_details(serde_json::json!({ "action": format!("{action:?}") }));
            let _ = log.emit_entry(entry);
        }
    }
    end_replay(shared);
    let report = DetectionReport::new(&trigger, &found, reproduction, Resolution::Neutralized);
    Ok(RollbackResult::Continued(report))
}

/// Leave replay mode and let held threads run on. Full validation stays on
/// until the next checkpoint seals.
fn end_replay(shared: &Shared) {
    shared.replaying.store(false, Ordering::Release);
    shared.frontiers.lock().clear();
    shared.quiescer.lift_frontier();
}

/// Discard events from the unwound generation. A fatal error still wins.
fn drain(events: &Receiver<EngineEvent>) -> Result<(), DetectorError> {
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Fatal(err) = event {
            return Err(err);
        }
    }
    Ok(())
}

fn await_reproduction(
    shared: &Shared,
    events: &Receiver<EngineEvent>,
    trigger: &Incident,
) -> Result<(Incident, Reproduction), DetectorError> {
    let tick = shared.config.tick();
    let stuck_after = shared.config.quiesce_timeout();
    let mut activity = shared.quiescer.activity();
    let mut last_change = Instant::now();
    loop {
        match events.recv_timeout(tick) {
            Ok(event) => {
                if let Some(found) = reproduced(event)? {
                    return Ok(found);
                }
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
        if let Some(found) = drain_pending(events)? {
            return Ok(found);
        }
        let now = shared.quiescer.activity();
        if now != activity {
            activity = now;
            last_change = Instant::now();
        }
        if shared.settled() || last_change.elapsed() >= stuck_after {
            // A thread queues its incident before it counts as stopped, so
            // anything sent before settling is visible now.
            if let Some(found) = drain_pending(events)? {
                return Ok(found);
            }
            let evidence = shared.validator.scan_all(&shared.heap, trigger.evidence.source);
            return Ok(match evidence.into_iter().next() {
                Some(ev) => (shared.incident(ev, None, Vec::new()), Reproduction::ConfirmedByScan),
                None => (trigger.clone(), Reproduction::NotReproduced),
            });
        }
    }
}

/// Read everything already queued, stopping at the first reproduction.
fn drain_pending(events: &Receiver<EngineEvent>) -> Result<Option<(Incident, Reproduction)>, DetectorError> {
    while let Ok(event) = events.try_recv() {
        if let Some(found) = reproduced(event)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn reproduced(event: EngineEvent) -> Result<Option<(Incident, Reproduction)>, DetectorError> {
    match event {
        EngineEvent::Pinpointed(found) | EngineEvent::Detection(found) => Ok(Some((*found, Reproduction::Pinpointed))),
        EngineEvent::Fatal(err) => Err(err),
        EngineEvent::ThreadExited(_) | EngineEvent::CheckpointRequested(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointPolicy, RollguardConfig, TrackingMode, Verbosity};
    use crate::engine::Engine;
    use crate::heap::SiteLoc;
    use crate::validator::DetectionSource;

    fn idle_engine() -> Engine {
        let config = RollguardConfig::new()
            .with_heap_size(1 << 20)
            .with_max_threads(2)
            .with_checkpoint(CheckpointPolicy::Manual)
            .with_verbosity(Verbosity::Quiet)
            .with_tracking(TrackingMode::WriteBarrier);
        Engine::new(config).unwrap()
    }

    fn trigger(shared: &Shared) -> Incident {
        let ev = Evidence::new(ErrorKind::BufferOverflow, 0x4010, DetectionSource::ProgramEnd);
        shared.incident(ev, None, Vec::new())
    }

    fn with_record(kind: ErrorKind) -> Evidence {
        let rec = crate::heap::AllocationRecord::new(
            AllocId {
                thread: ThreadId(2),
                serial: 9,
            },
            0x4000,
            64,
            24,
            1,
            SiteLoc {
                file: "prog.rs",
                line: 3,
            },
        );
        Evidence::new(kind, 0x4010, DetectionSource::Checkpoint).with_allocation(rec)
    }

    #[test]
    fn neutralization_follows_error_kind() {
        let id = AllocId {
            thread: ThreadId(2),
            serial: 9,
        };
        assert_eq!(
            Neutralization::for_evidence(&with_record(ErrorKind::UseAfterFree)),
            Neutralization::Evict(id)
        );
        assert_eq!(
            Neutralization::for_evidence(&with_record(ErrorKind::BufferOverflow)),
            Neutralization::Repair(id)
        );
        assert_eq!(
            Neutralization::for_evidence(&with_record(ErrorKind::HeapMetadataCorruption)),
            Neutralization::Repair(id)
        );
        let bare = Evidence::new(ErrorKind::DoubleFree, 0x4010, DetectionSource::Free);
        assert_eq!(Neutralization::for_evidence(&bare), Neutralization::IgnoreDoubleFree);
        let bare = Evidence::new(ErrorKind::BufferOverflow, 0x4010, DetectionSource::External);
        assert_eq!(Neutralization::for_evidence(&bare), Neutralization::None);
    }

    #[test]
    fn queued_pinpoint_behind_an_exit_is_not_lost() {
        let engine = idle_engine();
        let (shared, events) = engine.parts();
        // No live threads: execution already counts as settled.
        assert!(shared.settled());
        shared.send(EngineEvent::ThreadExited(ThreadId(0)));
        let ev = Evidence::new(ErrorKind::BufferOverflow, 0x4010, DetectionSource::Replay);
        let found = shared.incident(ev, Some(ThreadId(1)), Vec::new());
        shared.send(EngineEvent::Pinpointed(Box::new(found)));

        let (incident, reproduction) = await_reproduction(shared, events, &trigger(shared)).unwrap();
        assert_eq!(reproduction, Reproduction::Pinpointed);
        assert_eq!(incident.thread, Some(ThreadId(1)));
        assert_eq!(incident.evidence.source, DetectionSource::Replay);
    }

    #[test]
    fn settled_without_incident_falls_back_to_scan() {
        let engine = idle_engine();
        let (shared, events) = engine.parts();
        shared.send(EngineEvent::CheckpointRequested(ThreadId(0)));
        let (incident, reproduction) = await_reproduction(shared, events, &trigger(shared)).unwrap();
        assert_eq!(reproduction, Reproduction::NotReproduced);
        assert_eq!(incident.thread, None);
    }

    #[test]
    fn fatal_behind_other_events_wins() {
        let engine = idle_engine();
        let (shared, events) = engine.parts();
        shared.send(EngineEvent::ThreadExited(ThreadId(0)));
        shared.send(EngineEvent::Fatal(DetectorError::QuiescenceTimeout {
            pending: 1,
            timeout_ms: 10,
        }));
        let err = await_reproduction(shared, events, &trigger(shared)).unwrap_err();
        assert!(matches!(err, DetectorError::QuiescenceTimeout { pending: 1, .. }));
    }
}
