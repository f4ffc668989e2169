//! Engine configuration.
//!
//! A [`RollguardConfig`] can be built in code, read from `ROLLGUARD_*`
//! environment variables, or deserialized from JSON:
//! - `ROLLGUARD_HEAP_SIZE`: tracked heap region size (`64M`, `1G`, bytes)
//! - `ROLLGUARD_MAX_THREADS`: number of per-thread sub-heaps
//! - `ROLLGUARD_CHECKPOINT`: `manual`, `interval:<ms>` or `allocations:<n>`
//! - `ROLLGUARD_QUARANTINE_ENTRIES` / `ROLLGUARD_QUARANTINE_BYTES`
//! - `ROLLGUARD_ON_DETECTION`: `terminate` (default) or `continue`
//! - `ROLLGUARD_VERBOSITY`: `quiet`, `normal`, `verbose`, `trace`
//! - `ROLLGUARD_TRACKING`: `protect` (mprotect + SIGSEGV) or `barrier`
//! - `ROLLGUARD_QUIESCE_TIMEOUT_MS`

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::region::PAGE_SIZE;
use crate::structured_log::LogLevel;

/// Default quarantine depth per freeing thread.
pub const DEFAULT_QUARANTINE_ENTRIES: usize = 1024;

/// Default quarantine byte budget per freeing thread.
pub const DEFAULT_QUARANTINE_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_THREADS: usize = 16;
const DEFAULT_QUIESCE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TICK_MS: u64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// What to do once a detection has been reproduced and reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDetection {
    /// Stop every tracked thread and return the report.
    #[default]
    Terminate,
    /// Neutralize the corrupted region and keep running.
    Continue,
}

impl OnDetection {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" | "abort" | "stop" | "exit" => Some(Self::Terminate),
            "continue" | "repair" | "neutralize" | "resume" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Diagnostic output volume.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Reports only.
    Quiet,
    #[default]
    Normal,
    /// Epoch transitions and rollback steps.
    Verbose,
    /// Everything, including per-thread lifecycle.
    Trace,
}

impl Verbosity {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" | "silent" | "0" => Some(Self::Quiet),
            "normal" | "default" | "1" => Some(Self::Normal),
            "verbose" | "debug" | "2" => Some(Self::Verbose),
            "trace" | "all" | "3" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Whether a log record at `level` passes this verbosity.
    #[must_use]
    pub const fn admits(self, level: LogLevel) -> bool {
        let floor = match self {
            Self::Quiet => 4,
            Self::Normal => 2,
            Self::Verbose => 1,
            Self::Trace => 0,
        };
        level.rank() >= floor
    }

    /// Whether reports are printed to stderr.
    #[must_use]
    pub const fn prints_reports(self) -> bool {
        !matches!(self, Self::Quiet)
    }
}

/// How first writes after a checkpoint are intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Pages are armed read-only; the SIGSEGV handler captures twins.
    PageProtection,
    /// Instrumented writes capture twins directly; no page protection.
    WriteBarrier,
}

impl Default for TrackingMode {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::PageProtection
        } else {
            Self::WriteBarrier
        }
    }
}

impl TrackingMode {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "protect" | "mprotect" | "page" | "pageprotection" => Some(Self::PageProtection),
            "barrier" | "software" | "writebarrier" => Some(Self::WriteBarrier),
            _ => None,
        }
    }

    #[must_use]
    pub const fn protects_pages(self) -> bool {
        matches!(self, Self::PageProtection)
    }
}

/// Checkpoint cadence. Only detection latency depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CheckpointPolicy {
    /// Seal after `millis` of wall time.
    Interval { millis: u64 },
    /// Seal after `count` allocations.
    Allocations { count: u64 },
    /// Seal only when a thread calls `request_checkpoint`.
    Manual,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::Interval { millis: 100 }
    }
}

impl CheckpointPolicy {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "manual" || s == "none" {
            return Some(Self::Manual);
        }
        let (kind, value) = s.split_once(':')?;
        let value = value.trim().trim_end_matches("ms").parse::<u64>().ok()?;
        if value == 0 {
            return None;
        }
        match kind.trim() {
            "interval" | "time" | "ms" => Some(Self::Interval { millis: value }),
            "allocations" | "allocs" | "count" => Some(Self::Allocations { count: value }),
            _ => None,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollguardConfig {
    /// Size of the tracked heap region in bytes.
    pub heap_size: usize,
    /// Upper bound on tracked threads; the heap is split into this many sub-heaps.
    pub max_threads: usize,
    pub checkpoint: CheckpointPolicy,
    /// Quarantine depth per freeing thread.
    pub quarantine_entries: usize,
    /// Quarantine byte budget per freeing thread.
    pub quarantine_bytes: usize,
    pub on_detection: OnDetection,
    pub verbosity: Verbosity,
    pub tracking: TrackingMode,
    /// Bound on how long a thread may take to reach a safe point.
    pub quiesce_timeout_ms: u64,
    /// Coordinator polling period.
    pub tick_ms: u64,
}

impl Default for RollguardConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RollguardConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
            checkpoint: CheckpointPolicy::default(),
            quarantine_entries: DEFAULT_QUARANTINE_ENTRIES,
            quarantine_bytes: DEFAULT_QUARANTINE_BYTES,
            on_detection: default_on_detection(),
            verbosity: Verbosity::default(),
            tracking: TrackingMode::default(),
            quiesce_timeout_ms: DEFAULT_QUIESCE_TIMEOUT_MS,
            tick_ms: DEFAULT_TICK_MS,
        }
    }

    #[must_use]
    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }

    #[must_use]
    pub fn with_quarantine(mut self, entries: usize, bytes: usize) -> Self {
        self.quarantine_entries = entries;
        self.quarantine_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_on_detection(mut self, on_detection: OnDetection) -> Self {
        self.on_detection = on_detection;
        self
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_tracking(mut self, tracking: TrackingMode) -> Self {
        self.tracking = tracking;
        self
    }

    #[must_use]
    pub fn with_quiesce_timeout_ms(mut self, ms: u64) -> Self {
        self.quiesce_timeout_ms = ms;
        self
    }

    /// Read overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup` (keys are `ROLLGUARD_*` names).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::new();
        if let Some(v) = lookup("ROLLGUARD_HEAP_SIZE") {
            cfg.heap_size = parse_size(&v).ok_or(ConfigError::InvalidValue {
                key: "ROLLGUARD_HEAP_SIZE",
                value: v,
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_MAX_THREADS") {
            cfg.max_threads = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "ROLLGUARD_MAX_THREADS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_CHECKPOINT") {
            cfg.checkpoint =
                CheckpointPolicy::from_str_loose(&v).ok_or(ConfigError::InvalidValue {
                    key: "ROLLGUARD_CHECKPOINT",
                    value: v,
                })?;
        }
        if let Some(v) = lookup("ROLLGUARD_QUARANTINE_ENTRIES") {
            cfg.quarantine_entries = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "ROLLGUARD_QUARANTINE_ENTRIES",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_QUARANTINE_BYTES") {
            cfg.quarantine_bytes = parse_size(&v).ok_or(ConfigError::InvalidValue {
                key: "ROLLGUARD_QUARANTINE_BYTES",
                value: v,
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_ON_DETECTION") {
            cfg.on_detection =
                OnDetection::from_str_loose(&v).ok_or(ConfigError::InvalidValue {
                    key: "ROLLGUARD_ON_DETECTION",
                    value: v,
                })?;
        }
        if let Some(v) = lookup("ROLLGUARD_VERBOSITY") {
            cfg.verbosity = Verbosity::from_str_loose(&v).ok_or(ConfigError::InvalidValue {
                key: "ROLLGUARD_VERBOSITY",
                value: v,
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_TRACKING") {
            cfg.tracking = TrackingMode::from_str_loose(&v).ok_or(ConfigError::InvalidValue {
                key: "ROLLGUARD_TRACKING",
                value: v,
            })?;
        }
        if let Some(v) = lookup("ROLLGUARD_QUIESCE_TIMEOUT_MS") {
            cfg.quiesce_timeout_ms = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "ROLLGUARD_QUIESCE_TIMEOUT_MS",
                value: v.clone(),
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Inconsistent("max_threads must be at least 1".into()));
        }
        if self.subheap_size() < 4 * PAGE_SIZE {
            return Err(ConfigError::Inconsistent(format!(
                "heap_size {} leaves less than 4 pages per thread for {} threads",
                self.heap_size, self.max_threads
            )));
        }
        if self.quarantine_entries == 0 {
            return Err(ConfigError::Inconsistent(
                "quarantine_entries must be at least 1".into(),
            ));
        }
        if self.quiesce_timeout_ms == 0 || self.tick_ms == 0 {
            return Err(ConfigError::Inconsistent(
                "quiesce_timeout_ms and tick_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Page-aligned size of each per-thread sub-heap.
    #[must_use]
    pub fn subheap_size(&self) -> usize {
        let per = self.heap_size / self.max_threads.max(1);
        per - per % PAGE_SIZE
    }

    /// Total region size actually mapped.
    #[must_use]
    pub fn region_size(&self) -> usize {
        self.subheap_size() * self.max_threads
    }

    #[must_use]
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Parse `4096`, `16k`, `64M`, `1G` (binary multiples).
fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, shift) = match s.chars().last()? {
        'k' => (&s[..s.len() - 1], 10),
        'm' => (&s[..s.len() - 1], 20),
        'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

// Atomic cache: 0=unresolved, 1=Terminate, 2=Continue, 255=resolving.
// Resolved once per process so every engine created without an explicit
// setting agrees on the default.
static CACHED_ON_DETECTION: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_TERMINATE: u8 = 1;
const POLICY_CONTINUE: u8 = 2;
const POLICY_RESOLVING: u8 = 255;

fn policy_from_u8(v: u8) -> OnDetection {
    match v {
        POLICY_CONTINUE => OnDetection::Continue,
        _ => OnDetection::Terminate,
    }
}

/// Process-wide default for [`OnDetection`] (reads `ROLLGUARD_ON_DETECTION` once).
#[must_use]
pub fn default_on_detection() -> OnDetection {
    let cached = CACHED_ON_DETECTION.load(Ordering::Relaxed);
    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return policy_from_u8(cached);
    }
    if cached == POLICY_RESOLVING {
        return OnDetection::Terminate;
    }
    if CACHED_ON_DETECTION
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_ON_DETECTION.load(Ordering::Relaxed);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            policy_from_u8(v)
        } else {
            OnDetection::Terminate
        };
    }
    let policy = std::env::var("ROLLGUARD_ON_DETECTION")
        .ok()
        .and_then(|v| OnDetection::from_str_loose(&v))
        .unwrap_or_default();
    let encoded = match policy {
        OnDetection::Terminate => POLICY_TERMINATE,
        OnDetection::Continue => POLICY_CONTINUE,
    };
    CACHED_ON_DETECTION.store(encoded, Ordering::Release);
    policy
}
