//! Engine: owns the tracked heap and every runtime component, launches the
//! tracked threads and runs the coordinator loop that drives checkpoints,
//! rollbacks and the final program-end check.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::checkpoint::{CheckpointManager, EpochPhase, SealInputs, SealOutcome};
use crate::config::{OnDetection, RollguardConfig};
use crate::error::DetectorError;
use crate::fault::{self, FaultRegistration};
use crate::heap::{AllocId, Heap, HeapPtr, SiteLoc};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::page_tracker::PageTracker;
use crate::quiesce::{QuiesceOutcome, Quiescer};
use crate::report::{self, DetectionReport, LeakSite, Reproduction, Resolution};
use crate::rollback::{self, RollbackParts, RollbackResult};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};
use crate::sync::{ReplayGate, SyncEvent, SyncRecorder, SyncRegistry, TrackedBarrier, TrackedCondvar, TrackedMutex};
use crate::thread::{self, OpRecord, ThreadBody, ThreadId, ThreadTable};
use crate::validator::{DetectionSource, Evidence, ValidationLevel, Validator};

/// A detection together with the context captured when it was raised.
#[derive(Debug, Clone)]
pub struct Incident {
    pub evidence: Evidence,
    pub thread: Option<ThreadId>,
    pub history: Vec<OpRecord>,
    /// Sync sequence number within the epoch.
    pub seq: u64,
    pub epoch: u64,
    /// Time since the engine started running.
    pub at: Duration,
    /// Sync events replayed so far (empty outside replay).
    pub replayed: Vec<SyncEvent>,
}

/// Messages from tracked threads to the coordinator.
#[derive(Debug)]
pub enum EngineEvent {
    /// Corruption evidence that needs a rollback to localize.
    Detection(Box<Incident>),
    /// A violation caught at the operation that caused it.
    Pinpointed(Box<Incident>),
    Fatal(DetectorError),
    ThreadExited(ThreadId),
    CheckpointRequested(ThreadId),
}

/// State shared by the coordinator and every tracked thread.
pub(crate) struct Shared {
    pub(crate) config: RollguardConfig,
    pub(crate) heap: Heap,
    pub(crate) validator: Validator,
    pub(crate) recorder: SyncRecorder,
    pub(crate) gate: ReplayGate,
    pub(crate) quiescer: Quiescer,
    pub(crate) registry: SyncRegistry,
    pub(crate) threads: ThreadTable,
    pub(crate) metrics: EngineMetrics,
    pub(crate) replaying: AtomicBool,
    /// Replay limits per thread; `None` means run to completion.
    pub(crate) frontiers: Mutex<BTreeMap<ThreadId, Option<u64>>>,
    pub(crate) checkpoint_requested: AtomicBool,
    pub(crate) allocs_since_checkpoint: AtomicU64,
    started: Mutex<Option<Instant>>,
    events: Sender<EngineEvent>,
}

impl Shared {
    pub(crate) fn send(&self, event: EngineEvent) {
        // The receiver lives as long as the engine; a failed send means the
        // engine is being dropped and nobody is listening.
        let _ = self.events.send(event);
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    /// Whether violations are caught at the offending operation.
    pub(crate) fn pinpointing(&self) -> bool {
        self.is_replaying() || self.validator.level() == ValidationLevel::Full
    }

    pub(crate) fn continue_mode(&self) -> bool {
        self.config.on_detection == OnDetection::Continue
    }

    pub(crate) fn frontier_of(&self, thread: ThreadId) -> Option<u64> {
        if !self.is_replaying() {
            return None;
        }
        // Threads unknown at detection time did not exist yet: hold them.
        self.frontiers.lock().get(&thread).copied().unwrap_or(Some(0))
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.lock().map(|t| t.elapsed()).unwrap_or_default()
    }

    pub(crate) fn incident(&self, evidence: Evidence, thread: Option<ThreadId>, history: Vec<OpRecord>) -> Incident {
        Incident {
            thread: thread.or(evidence.thread),
            evidence,
            history,
            seq: self.recorder.current_seq(),
            epoch: self.heap.epoch(),
            at: self.elapsed(),
            replayed: if self.is_replaying() {
                self.gate.replayed()
            } else {
                Vec::new()
            },
        }
    }

    pub(crate) fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .sync_events_recorded
            .store(self.recorder.recorded(), Ordering::Relaxed);
        self.metrics
            .sync_events_replayed
            .store(self.gate.replayed_total(), Ordering::Relaxed);
        let tracker = self.heap.tracker();
        self.metrics.snapshot(tracker.faults(), tracker.captures())
    }

    /// Nothing can make progress: no thread runs and no waiter is runnable.
    /// The activity counter brackets the reads so a transition in between
    /// is noticed.
    pub(crate) fn settled(&self) -> bool {
        let before = self.quiescer.activity();
        let quiet = self.quiescer.settled()
            && !self.registry.any_runnable_waiter()
            && !self.gate.turn_waiter_ready()
            && !self.threads.has_runnable_joiner();
        quiet && self.quiescer.activity() == before
    }

    /// Stop every thread and wait for all of them to end.
    pub(crate) fn stop_all(&self) -> BTreeMap<ThreadId, thread::ThreadExit> {
        self.quiescer.interrupt_all();
        self.quiescer.release();
        let exits = self.threads.join_all();
        self.gate.deactivate();
        exits
    }
}

/// How a run ended.
#[derive(Debug, Clone, Serialize)]
pub enum RunOutcome {
    /// Every thread finished and the program-end check passed.
    Completed,
    /// A detection was reported and the run was stopped.
    Terminated(Box<DetectionReport>),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Every report, including neutralized ones.
    pub reports: Vec<DetectionReport>,
    pub metrics: MetricsSnapshot,
    /// Checkpoints sealed, including the initial one.
    pub epochs: u64,
    /// Blocks never freed, by allocation site. Only filled for completed runs.
    pub leaks: Vec<LeakSite>,
}

impl RunSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed) && self.reports.is_empty()
    }

    /// The report that terminated the run, if any.
    #[must_use]
    pub fn terminating_report(&self) -> Option<&DetectionReport> {
        match &self.outcome {
            RunOutcome::Terminated(report) => Some(report),
            RunOutcome::Completed => None,
        }
    }
}

/// Cloneable handle for reporting accesses trapped outside the engine.
#[derive(Clone)]
pub struct ExternalReporter {
    shared: Arc<Shared>,
}

impl ExternalReporter {
    pub fn report(&self, evidence: Evidence) {
        let evidence = evidence.with_source(DetectionSource::External);
        let incident = self.shared.incident(evidence, None, Vec::new());
        self.shared.send(EngineEvent::Detection(Box::new(incident)));
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    events: Receiver<EngineEvent>,
    checkpoints: CheckpointManager,
    log: LogEmitter,
    reports: Vec<DetectionReport>,
    /// Epoch of the checkpoint the last rollback restored, until the next seal.
    rolled_back_epoch: Option<u64>,
    /// Program state from `alloc_global`; never reported as leaked.
    globals: BTreeSet<AllocId>,
    started: bool,
    _fault: Option<FaultRegistration>,
}

impl Engine {
    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&Arc<Shared>, &Receiver<EngineEvent>) {
        (&self.shared, &self.events)
    }

    /// Map the tracked heap and set up every component. With page
    /// protection the SIGSEGV handler is installed and the heap registered.
    pub fn new(config: RollguardConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        let tracker = Arc::new(PageTracker::new(config.region_size(), config.tracking)?);
        let registration = if tracker.protects_pages() {
            fault::install()?;
            Some(fault::register(&tracker)?)
        } else {
            None
        };
        let heap = Heap::new(
            tracker,
            config.max_threads,
            config.subheap_size(),
            config.quarantine_entries,
            config.quarantine_bytes,
        );
        let (tx, rx) = mpsc::channel();
        let shared = Shared {
            threads: ThreadTable::new(config.max_threads),
            config,
            heap,
            validator: Validator::new(),
            recorder: SyncRecorder::new(),
            gate: ReplayGate::new(),
            quiescer: Quiescer::new(),
            registry: SyncRegistry::new(),
            metrics: EngineMetrics::new(),
            replaying: AtomicBool::new(false),
            frontiers: Mutex::new(BTreeMap::new()),
            checkpoint_requested: AtomicBool::new(false),
            allocs_since_checkpoint: AtomicU64::new(0),
            started: Mutex::new(None),
            events: tx,
        };
        Ok(Self {
            shared: Arc::new(shared),
            events: rx,
            checkpoints: CheckpointManager::new(),
            log: LogEmitter::disabled(),
            reports: Vec::new(),
            rolled_back_epoch: None,
            globals: BTreeSet::new(),
            started: false,
            _fault: registration,
        })
    }

    /// Send structured logs to `log`.
    #[must_use]
    pub fn with_log(mut self, log: LogEmitter) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RollguardConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.shared.heap
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.checkpoints.epoch()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics_snapshot()
    }

    // -- setup --------------------------------------------------------------

    pub fn mutex(&self) -> TrackedMutex {
        self.shared.registry.mutex()
    }

    pub fn condvar(&self) -> TrackedCondvar {
        self.shared.registry.condvar()
    }

    pub fn barrier(&self, parties: usize) -> TrackedBarrier {
        self.shared.registry.barrier(parties)
    }

    /// Register a root thread. Ids are assigned in registration order.
    pub fn add_thread(&mut self, body: ThreadBody) -> Result<ThreadId, DetectorError> {
        if self.started {
            return Err(DetectorError::AlreadyRunning);
        }
        self.shared.threads.add(body)
    }

    /// Allocate shared program state before the run. It lives in thread 0's
    /// sub-heap and is covered by the initial checkpoint.
    #[track_caller]
    pub fn alloc_global(&mut self, size: usize) -> Result<HeapPtr, DetectorError> {
        if self.started {
            return Err(DetectorError::AlreadyRunning);
        }
        let ptr = self.shared.heap.malloc(ThreadId(0), size, SiteLoc::caller())?;
        if let Some(rec) = self.shared.heap.find_containing(ptr.addr()) {
            self.globals.insert(rec.id);
        }
        EngineMetrics::inc(&self.shared.metrics.allocations);
        Ok(ptr)
    }

    pub fn write_global(&self, ptr: HeapPtr, bytes: &[u8]) -> Result<(), DetectorError> {
        if self.shared.heap.tracker().write(ptr.addr(), bytes, None) {
            Ok(())
        } else {
            Err(DetectorError::OutOfRegion {
                addr: ptr.addr(),
                len: bytes.len(),
            })
        }
    }

    pub fn read_global(&self, ptr: HeapPtr, len: usize) -> Result<Vec<u8>, DetectorError> {
        self.shared
            .heap
            .tracker()
            .read_vec(ptr.addr(), len)
            .ok_or(DetectorError::OutOfRegion { addr: ptr.addr(), len })
    }

    pub fn read_global_u64(&self, ptr: HeapPtr) -> Result<u64, DetectorError> {
        let bytes = self.read_global(ptr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    #[must_use]
    pub fn external_reporter(&self) -> ExternalReporter {
        ExternalReporter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Report an illegal access trapped by some other mechanism. It is
    /// handled like any other detection once the run loop sees it.
    pub fn report_external(&self, evidence: Evidence) {
        self.external_reporter().report(evidence);
    }

    // -- run ----------------------------------------------------------------

    /// Run every registered thread to completion (or termination).
    pub fn run(&mut self) -> Result<RunSummary, DetectorError> {
        if self.started {
            return Err(DetectorError::AlreadyRunning);
        }
        self.started = true;
        *self.shared.started.lock() = Some(Instant::now());
        let details = serde_json::json!({
            "threads": self.shared.threads.len(),
            "heap_size": self.shared.config.region_size(),
            "tracking": self.shared.config.tracking,
            "on_detection": self.shared.config.on_detection,
        });
        self.emit(LogLevel::Info, "run_start", |e| e.with_details(details));

        if let Some(outcome) = self.seal_checkpoint()? {
            return Ok(self.finish(outcome));
        }
        for id in self.shared.threads.running() {
            thread::launch(&self.shared, id)?;
        }
        let result = self.coordinate();
        if result.is_err() {
            self.shared.stop_all();
            self.drain();
        }
        result
    }

    fn coordinate(&mut self) -> Result<RunSummary, DetectorError> {
        let tick = self.shared.config.tick();
        loop {
            match self.events.recv_timeout(tick) {
                Ok(event) => {
                    if let Some(outcome) = self.handle(event)? {
                        return Ok(self.finish(outcome));
                    }
                    continue;
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
            }
            if self.shared.gate.is_active() && !self.shared.is_replaying() && self.shared.settled() {
                // Neutralized execution no longer follows the rest of the log.
                self.shared.gate.deactivate();
            }
            if self.shared.threads.all_exited() {
                // Events sent before the last exit are handled first.
                if let Ok(event) = self.events.try_recv() {
                    if let Some(outcome) = self.handle(event)? {
                        return Ok(self.finish(outcome));
                    }
                    continue;
                }
                if let Some(outcome) = self.program_end()? {
                    return Ok(self.finish(outcome));
                }
                continue;
            }
            let due = self.checkpoints.due(
                self.shared.config.checkpoint,
                self.shared.allocs_since_checkpoint.load(Ordering::Relaxed),
                self.shared.checkpoint_requested.load(Ordering::Acquire),
            );
            if due {
                if let Some(outcome) = self.take_checkpoint()? {
                    return Ok(self.finish(outcome));
                }
            }
        }
    }

    fn handle(&mut self, event: EngineEvent) -> Result<Option<RunOutcome>, DetectorError> {
        match event {
            EngineEvent::Detection(incident) => self.roll_back(*incident),
            EngineEvent::Pinpointed(incident) => {
                let resolution = if self.shared.continue_mode() {
                    Resolution::Neutralized
                } else {
                    Resolution::Terminated
                };
                let report = DetectionReport::new(&incident, &incident, Reproduction::Direct, resolution);
                self.publish(&report);
                if resolution == Resolution::Terminated {
                    self.shared.stop_all();
                    self.drain();
                    return Ok(Some(RunOutcome::Terminated(Box::new(report))));
                }
                Ok(None)
            }
            EngineEvent::Fatal(err) => {
                self.emit(LogLevel::Fatal, "fatal", |e| e.with_details(serde_json::json!({ "error": err.to_string() })));
                Err(err)
            }
            EngineEvent::ThreadExited(id) => {
                self.emit(LogLevel::Trace, "thread_exit", |e| e.with_thread(id.0));
                Ok(None)
            }
            EngineEvent::CheckpointRequested(id) => {
                self.emit(LogLevel::Trace, "checkpoint_requested", |e| e.with_thread(id.0));
                Ok(None)
            }
        }
    }

    fn take_checkpoint(&mut self) -> Result<Option<RunOutcome>, DetectorError> {
        self.checkpoints.set_phase(EpochPhase::Quiescing);
        let started = Instant::now();
        let quiesced = self
            .shared
            .quiescer
            .quiesce_for_checkpoint(self.shared.config.quiesce_timeout());
        match quiesced {
            Err(err) => {
                self.checkpoints.set_phase(EpochPhase::Running);
                Err(err)
            }
            Ok(QuiesceOutcome::Deferred { waiting }) => {
                self.checkpoints.set_phase(EpochPhase::Running);
                EngineMetrics::inc(&self.shared.metrics.checkpoints_deferred);
                let waiting: Vec<u32> = waiting.iter().map(|t| t.0).collect();
                let epoch = self.checkpoints.epoch();
                self.emit(LogLevel::Debug, "checkpoint_deferred", |e| {
                    e.with_epoch(epoch)
                        .with_details(serde_json::json!({ "waiting": waiting }))
                });
                Ok(None)
            }
            Ok(QuiesceOutcome::Quiesced) => {
                let outcome = self.seal_checkpoint();
                if !matches!(outcome, Ok(Some(_))) {
                    self.shared.quiescer.release();
                }
                let us = started.elapsed().as_micros() as u64;
                self.emit(LogLevel::Trace, "checkpoint_pause", |e| e.with_duration_us(us));
                outcome
            }
        }
    }

    /// Validate and seal with all threads quiesced (or not yet started).
    fn seal_checkpoint(&mut self) -> Result<Option<RunOutcome>, DetectorError> {
        let inputs = SealInputs {
            heap: &self.shared.heap,
            validator: &self.shared.validator,
            recorder: &self.shared.recorder,
            registry: &self.shared.registry,
            threads: &self.shared.threads,
        };
        match self.checkpoints.seal(&inputs)? {
            SealOutcome::Sealed {
                epoch,
                dirty_pages,
                events,
            } => {
                EngineMetrics::inc(&self.shared.metrics.checkpoints_sealed);
                self.shared.allocs_since_checkpoint.store(0, Ordering::Relaxed);
                self.shared.checkpoint_requested.store(false, Ordering::Release);
                self.rolled_back_epoch = None;
                self.emit(LogLevel::Debug, "checkpoint_sealed", |e| {
                    e.with_epoch(epoch).with_details(serde_json::json!({
                        "dirty_pages": dirty_pages,
                        "sync_events": events,
                    }))
                });
                Ok(None)
            }
            SealOutcome::Detected(evidence) => {
                let Some(first) = evidence.into_iter().next() else {
                    return Ok(None);
                };
                let incident = self.shared.incident(first, None, Vec::new());
                if self.checkpoints.current().is_none() {
                    // Corrupted before the first checkpoint: nothing to replay.
                    let report =
                        DetectionReport::new(&incident, &incident, Reproduction::Direct, Resolution::Terminated);
                    self.publish(&report);
                    return Ok(Some(RunOutcome::Terminated(Box::new(report))));
                }
                self.roll_back(incident)
            }
        }
    }

    fn program_end(&mut self) -> Result<Option<RunOutcome>, DetectorError> {
        let evidence = self
            .shared
            .validator
            .scan_all(&self.shared.heap, DetectionSource::ProgramEnd);
        match evidence.into_iter().next() {
            None => Ok(Some(RunOutcome::Completed)),
            Some(first) => {
                let incident = self.shared.incident(first, None, Vec::new());
                self.roll_back(incident)
            }
        }
    }

    fn roll_back(&mut self, trigger: Incident) -> Result<Option<RunOutcome>, DetectorError> {
        let epoch = match self.checkpoints.current() {
            Some(checkpoint) => checkpoint.epoch,
            None => return Err(DetectorError::NoCheckpoint),
        };
        if self.rolled_back_epoch == Some(epoch) {
            self.emit(LogLevel::Error, "repeated_rollback", |e| e.with_epoch(epoch));
            return Err(DetectorError::RepeatedRollback { epoch });
        }
        self.rolled_back_epoch = Some(epoch);
        EngineMetrics::inc(&self.shared.metrics.rollbacks);
        let Some(checkpoint) = self.checkpoints.current() else {
            return Err(DetectorError::NoCheckpoint);
        };
        let parts = RollbackParts {
            shared: &self.shared,
            events: &self.events,
            checkpoint,
            log: &mut self.log,
        };
        match rollback::run(parts, trigger)? {
            RollbackResult::Terminated(report) => {
                self.publish(&report);
                Ok(Some(RunOutcome::Terminated(Box::new(report))))
            }
            RollbackResult::Continued(report) => {
                self.publish(&report);
                Ok(None)
            }
        }
    }

    fn publish(&mut self, report: &DetectionReport) {
        self.shared.metrics.record_detection(report.kind);
        if self.shared.config.verbosity.prints_reports() {
            eprint!("{}", report.render_text());
        }
        let details = serde_json::to_value(report).unwrap_or_default();
        let mut entry = self
            .log
            .entry(LogLevel::Error, "detection_report")
            .with_epoch(report.epoch)
            .with_kind(report.kind)
            .with_address(report.address)
            .with_details(details);
        if let Some(t) = report.thread {
            entry = entry.with_thread(t.0);
        }
        let _ = self.log.emit_entry(entry);
        self.reports.push(report.clone());
    }

    fn drain(&self) {
        while self.events.try_recv().is_ok() {}
    }

    fn finish(&mut self, outcome: RunOutcome) -> RunSummary {
        let metrics = self.shared.metrics_snapshot();
        let completed = matches!(outcome, RunOutcome::Completed);
        let reports = self.reports.len();
        let epoch = self.checkpoints.epoch();
        let leaks = if completed { self.report_leaks(epoch) } else { Vec::new() };
        self.emit(LogLevel::Info, "run_end", |e| {
            e.with_epoch(epoch).with_details(serde_json::json!({
                "completed": completed,
                "reports": reports,
                "rollbacks": metrics.rollbacks,
                "checkpoints": metrics.checkpoints_sealed,
            }))
        });
        let _ = self.log.flush();
        RunSummary {
            outcome,
            reports: std::mem::take(&mut self.reports),
            metrics,
            epochs: self.checkpoints.epoch(),
            leaks,
        }
    }

    fn report_leaks(&mut self, epoch: u64) -> Vec<LeakSite> {
        let records = self.shared.heap.records();
        let leaks = report::summarize_leaks(&records, &self.globals);
        if leaks.is_empty() {
            return leaks;
        }
        if self.shared.config.verbosity.prints_reports() {
            eprint!("{}", report::render_leaks(&leaks));
        }
        for leak in &leaks {
            let details = serde_json::to_value(leak).unwrap_or_default();
            self.emit(LogLevel::Warn, "leak", |e| e.with_epoch(epoch).with_details(details));
        }
        leaks
    }

    fn emit(&mut self, level: LogLevel, event: &str, build: impl FnOnce(LogEntry) -> LogEntry) {
        if !self.log.enabled(level) {
            return;
        }
        let entry = build(self.log.entry(level, event));
        let _ = self.log.emit_entry(entry);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.started {
            self.shared.stop_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointPolicy, TrackingMode, Verbosity};
    use crate::error::ErrorKind;

    #[test]
    fn rollback_before_the_first_seal_is_rejected() {
        let config = RollguardConfig::new()
            .with_heap_size(1 << 20)
            .with_max_threads(1)
            .with_checkpoint(CheckpointPolicy::Manual)
            .with_verbosity(Verbosity::Quiet)
            .with_tracking(TrackingMode::WriteBarrier);
        let mut engine = Engine::new(config).unwrap();
        let ev = Evidence::new(ErrorKind::UseAfterFree, 0x10, DetectionSource::External);
        let trigger = engine.shared.incident(ev, None, Vec::new());
        let result = engine.roll_back(trigger);
        assert!(matches!(result, Err(DetectorError::NoCheckpoint)));
        assert_eq!(engine.metrics().rollbacks, 0);
        assert_eq!(engine.rolled_back_epoch, None);
    }
}
