//! Structured JSONL logging for engine events.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes records to a file, a shared buffer, stderr, or nowhere,
//!   filtered by the configured [`Verbosity`](crate::config::Verbosity).

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Verbosity;
use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
        }
    }
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Hex-formatted faulting or object address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            epoch: None,
            thread: None,
            kind: None,
            address: None,
            duration_us: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: u32) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: usize) -> Self {
        self.address = Some(format!("{address:#x}"));
        self
    }

    #[must_use]
    pub fn with_duration_us(mut self, us: u64) -> Self {
        self.duration_us = Some(us);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Shared buffer
// ---------------------------------------------------------------------------

/// Cloneable in-memory sink; all clones see the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer contents as UTF-8 (lossy).
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Parsed JSONL lines; lines that fail to parse are skipped.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.contents()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Option<Box<dyn Write + Send>>,
    seq: u64,
    run_id: String,
    verbosity: Verbosity,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str, verbosity: Verbosity) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(
            Box::new(std::io::BufWriter::new(file)),
            run_id,
            verbosity,
        ))
    }

    /// Create an emitter over an arbitrary writer.
    #[must_use]
    pub fn to_writer(writer: Box<dyn Write + Send>, run_id: &str, verbosity: Verbosity) -> Self {
        Self {
            writer: Some(writer),
            seq: 0,
            run_id: run_id.to_string(),
            verbosity,
        }
    }

    /// Create an emitter that writes into `buffer` (for tests and the harness).
    #[must_use]
    pub fn to_buffer(buffer: &SharedBuffer, run_id: &str, verbosity: Verbosity) -> Self {
        Self::to_writer(Box::new(buffer.clone()), run_id, verbosity)
    }

    /// Create an emitter that writes to stderr.
    #[must_use]
    pub fn to_stderr(run_id: &str, verbosity: Verbosity) -> Self {
        Self::to_writer(Box::new(std::io::stderr()), run_id, verbosity)
    }

    /// Emitter that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            writer: None,
            seq: 0,
            run_id: String::new(),
            verbosity: Verbosity::Quiet,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.writer.is_some() && self.verbosity.admits(level)
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{:05}", self.run_id, self.seq)
    }

    /// Start an entry carrying this emitter's run id and next trace id.
    #[must_use]
    pub fn entry(&mut self, level: LogLevel, event: &str) -> LogEntry {
        let trace_id = self.next_trace_id();
        LogEntry::new(trace_id, level, event).with_run(self.run_id.clone())
    }

    /// Emit a fully-populated log entry if its level passes the filter.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if !self.enabled(entry.level) {
            return Ok(());
        }
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        match self.writer.as_mut() {
            Some(w) => writeln!(w, "{line}"),
            None => Ok(()),
        }
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("run-1::00001", LogLevel::Info, "checkpoint_sealed");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "run-1::00001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "checkpoint_sealed");
        assert!(parsed.get("epoch").is_none());
    }

    #[test]
    fn builder_sets_optional_fields() {
        let entry = LogEntry::new("t", LogLevel::Error, "detection")
            .with_epoch(3)
            .with_thread(1)
            .with_kind(ErrorKind::UseAfterFree)
            .with_address(0x1000);
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["epoch"], 3);
        assert_eq!(parsed["kind"], "UseAfterFree");
        assert_eq!(parsed["address"], "0x1000");
    }

    #[test]
    fn emitter_filters_by_verbosity() {
        let buf = SharedBuffer::new();
        let mut emitter = LogEmitter::to_buffer(&buf, "run-x", Verbosity::Normal);
        let debug = emitter.entry(LogLevel::Debug, "noise");
        emitter.emit_entry(debug).unwrap();
        let info = emitter.entry(LogLevel::Info, "signal");
        emitter.emit_entry(info).unwrap();
        let entries = buf.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "signal");
        assert_eq!(entries[0].run_id.as_deref(), Some("run-x"));
        assert_eq!(entries[0].trace_id, "run-x::00002");
    }

    #[test]
    fn disabled_emitter_writes_nothing() {
        let mut emitter = LogEmitter::disabled();
        assert!(!emitter.enabled(LogLevel::Fatal));
        let e = emitter.entry(LogLevel::Fatal, "x");
        emitter.emit_entry(e).unwrap();
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
    }
}
