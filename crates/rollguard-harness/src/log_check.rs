//! Line-by-line validation of engine JSONL logs.
//!
//! Every line must parse into the engine's [`LogEntry`] schema. On top of
//! the field checks, [`check_sequence`] verifies the run-level shape: one
//! `run_start` first, one `run_end` last, and every `detection_report`
//! preceded by the rollback or pinpoint that produced it.

use std::path::Path;

use rollguard_engine::LogEntry;
use serde_json::{Map, Value};

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];
const KINDS: [&str; 4] = ["BufferOverflow", "UseAfterFree", "DoubleFree", "HeapMetadataCorruption"];

/// Schema violation on one log line (line 0 for run-level problems).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogViolation {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl LogViolation {
    fn new(line_number: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            line_number,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LogViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: field '{}': {}", self.line_number, self.field, self.message)
    }
}

/// Result of validating a whole log.
#[derive(Debug, Default)]
pub struct LogCheck {
    pub lines: usize,
    pub entries: Vec<LogEntry>,
    pub violations: Vec<LogViolation>,
}

impl LogCheck {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate a single JSONL line.
pub fn validate_log_line(line: &str, line_number: usize) -> Result<LogEntry, Vec<LogViolation>> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![LogViolation::new(line_number, "<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![LogViolation::new(line_number, "<root>", "expected JSON object")]);
    };
    let mut errors = check_fields(obj, line_number);
    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        errors.push(LogViolation::new(
            line_number,
            "<deserialization>",
            format!("failed to deserialize: {e}"),
        ));
        errors
    })
}

fn check_fields(obj: &Map<String, Value>, line_number: usize) -> Vec<LogViolation> {
    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(LogViolation::new(line_number, field, "required field missing"));
        }
    }
    if let Some(level) = obj.get("level").and_then(Value::as_str) {
        if !LEVELS.contains(&level) {
            errors.push(LogViolation::new(line_number, "level", format!("invalid level: '{level}'")));
        }
    }
    if let Some(trace_id) = obj.get("trace_id").and_then(Value::as_str) {
        if !trace_id.contains("::") {
            errors.push(LogViolation::new(
                line_number,
                "trace_id",
                format!("trace_id should follow <run_id>::<seq>, got: '{trace_id}'"),
            ));
        }
    }
    if let Some(kind) = obj.get("kind") {
        if !kind.as_str().is_some_and(|k| KINDS.contains(&k)) {
            errors.push(LogViolation::new(line_number, "kind", format!("invalid kind: {kind}")));
        }
    }
    if let Some(address) = obj.get("address") {
        let hex = address
            .as_str()
            .and_then(|a| a.strip_prefix("0x"))
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()));
        if !hex {
            errors.push(LogViolation::new(line_number, "address", "address must be 0x-prefixed hex"));
        }
    }
    for field in ["epoch", "thread", "duration_us"] {
        if let Some(v) = obj.get(field) {
            if !v.is_u64() {
                errors.push(LogViolation::new(line_number, field, "expected unsigned integer"));
            }
        }
    }
    if obj.get("event").and_then(Value::as_str) == Some("detection_report") {
        for field in ["kind", "address", "details"] {
            if !obj.contains_key(field) {
                errors.push(LogViolation::new(line_number, field, "detection reports must carry this field"));
            }
        }
    }
    errors
}

/// Validate every non-empty line of `content`.
#[must_use]
pub fn validate_log_text(content: &str) -> LogCheck {
    let mut check = LogCheck::default();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        check.lines += 1;
        match validate_log_line(line, i + 1) {
            Ok(entry) => check.entries.push(entry),
            Err(errs) => check.violations.extend(errs),
        }
    }
    check
}

pub fn validate_log_file(path: &Path) -> Result<LogCheck, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(validate_log_text(&content))
}

/// Run-level ordering checks over parsed entries.
#[must_use]
pub fn check_sequence(entries: &[LogEntry]) -> Vec<LogViolation> {
    let mut errors = Vec::new();
    let events: Vec<&str> = entries.iter().map(|e| e.event.as_str()).collect();
    if events.first() != Some(&"run_start") {
        errors.push(LogViolation::new(0, "event", "log must begin with run_start"));
    }
    let starts = events.iter().filter(|e| **e == "run_start").count();
    if starts > 1 {
        errors.push(LogViolation::new(0, "event", format!("{starts} run_start events")));
    }
    // A fatal error ends a run without run_end.
    let fatal = events.contains(&"fatal");
    if !fatal && events.last() != Some(&"run_end") {
        errors.push(LogViolation::new(0, "event", "log must end with run_end"));
    }
    let mut rollbacks = 0usize;
    let mut reported = 0usize;
    for (i, event) in events.iter().enumerate() {
        match *event {
            "rollback" => rollbacks += 1,
            "detection_report" => {
                reported += 1;
                let direct = entries[i]
                    .details
                    .as_ref()
                    .and_then(|d| d.get("reproduction"))
                    .and_then(Value::as_str)
                    == Some("direct");
                if !direct && reported > rollbacks {
                    errors.push(LogViolation::new(
                        0,
                        "event",
                        format!("detection_report #{reported} has no preceding rollback"),
                    ));
                }
            }
            _ => {}
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"run::00001","level":"info","event":"run_start"}"#;

    #[test]
    fn accepts_minimal_entry() {
        let entry = validate_log_line(GOOD, 1).unwrap();
        assert_eq!(entry.event, "run_start");
    }

    #[test]
    fn reports_every_bad_field() {
        let line = r#"{"timestamp":"t","trace_id":"nocolons","level":"loud","event":"detection_report","address":"1234","epoch":-1}"#;
        let errs = validate_log_line(line, 7).unwrap_err();
        let fields: Vec<&str> = errs.iter().map(|e| e.field.as_str()).collect();
        for expected in ["level", "trace_id", "address", "epoch", "kind", "details"] {
            assert!(fields.contains(&expected), "missing {expected} in {fields:?}");
        }
        assert!(errs.iter().all(|e| e.line_number == 7));
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert_eq!(validate_log_line("[1,2]", 1).unwrap_err()[0].field, "<root>");
        assert_eq!(validate_log_line("{oops", 2).unwrap_err()[0].field, "<json>");
    }

    #[test]
    fn sequence_requires_rollback_before_report() {
        let text = [
            GOOD,
            r#"{"timestamp":"t","trace_id":"run::00002","level":"error","event":"detection_report","kind":"DoubleFree","address":"0x10","details":{"reproduction":"pinpointed"}}"#,
            r#"{"timestamp":"t","trace_id":"run::00003","level":"info","event":"run_end"}"#,
        ]
        .join("\n");
        let check = validate_log_text(&text);
        assert!(check.is_valid(), "{:?}", check.violations);
        assert_eq!(check.lines, 3);
        let errs = check_sequence(&check.entries);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("no preceding rollback"));
    }
}
