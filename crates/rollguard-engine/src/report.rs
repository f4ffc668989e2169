//! Diagnostic reports.
//!
//! A [`DetectionReport`] joins what first tripped the detector (the trigger)
//! with what replay found (the pinpointed operation, or the scan that
//! confirmed the corruption). It renders as text for humans and serializes
//! to JSON for tooling.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Serialize, Serializer};

use crate::engine::Incident;
use crate::error::ErrorKind;
use crate::heap::{AllocId, AllocState, AllocationRecord};
use crate::sync::SyncEvent;
use crate::thread::{OpRecord, ThreadId};
use crate::validator::{Access, DetectionSource};

fn hex<S: Serializer>(addr: &usize, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{addr:#x}"))
}

/// How the detection was reproduced under replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reproduction {
    /// An instrumented operation violated the heap during replay.
    Pinpointed,
    /// Replay reached every frontier; a validation scan confirmed the damage.
    ConfirmedByScan,
    /// Replay completed without the corruption reappearing.
    NotReproduced,
    /// The detection was already precise; no replay was needed.
    Direct,
}

impl Reproduction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pinpointed => "pinpointed during replay",
            Self::ConfirmedByScan => "confirmed by validation scan",
            Self::NotReproduced => "not reproduced",
            Self::Direct => "caught at the operation",
        }
    }
}

/// What the engine did after reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Terminated,
    Neutralized,
}

/// The allocation a detection is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationSummary {
    pub id: String,
    #[serde(serialize_with = "hex")]
    pub user_base: usize,
    pub size: usize,
    pub thread: ThreadId,
    pub alloc_site: String,
    pub alloc_epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freed_by: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_epoch: Option<u64>,
    pub state: AllocState,
}

impl From<&AllocationRecord> for AllocationSummary {
    fn from(rec: &AllocationRecord) -> Self {
        Self {
            id: rec.id.to_string(),
            user_base: rec.user_base,
            size: rec.size,
            thread: rec.owner(),
            alloc_site: rec.alloc_site.to_string(),
            alloc_epoch: rec.alloc_epoch,
            freed_by: rec.freed_by,
            free_site: rec.free_site.map(|s| s.to_string()),
            free_epoch: rec.free_epoch,
            state: rec.state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub kind: ErrorKind,
    #[serde(serialize_with = "hex")]
    pub address: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    /// Where the reported evidence was raised.
    pub source: DetectionSource,
    /// What started the rollback.
    pub trigger: DetectionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationSummary>,
    pub epoch: u64,
    /// Sync sequence number within the epoch when the evidence was raised.
    pub sequence: u64,
    pub elapsed_us: u64,
    pub reproduction: Reproduction,
    pub resolution: Resolution,
    pub history: Vec<OpRecord>,
    pub replayed: Vec<SyncEvent>,
}

impl DetectionReport {
    /// Build a report from the incident that triggered a rollback and the
    /// incident replay produced (the same one when nothing better was found).
    #[must_use]
    pub fn new(
        trigger: &Incident,
        found: &Incident,
        reproduction: Reproduction,
        resolution: Resolution,
    ) -> Self {
        let ev = &found.evidence;
        let history = if found.history.is_empty() {
            trigger.history.clone()
        } else {
            found.history.clone()
        };
        Self {
            kind: ev.kind,
            address: ev.address,
            offset: ev.offset,
            access: ev.access,
            source: ev.source,
            trigger: trigger.evidence.source,
            thread: found.thread.or(ev.thread),
            allocation: ev.allocation.as_ref().map(AllocationSummary::from),
            epoch: found.epoch,
            sequence: found.seq,
            elapsed_us: found.at.as_micros() as u64,
            reproduction,
            resolution,
            history,
            replayed: found.replayed.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Human-readable multi-line rendering.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = format!("==rollguard== {} at {:#x}", self.kind, self.address);
        if let Some(off) = self.offset {
            let _ = write!(out, " (offset {off})");
        }
        if let Some(t) = self.thread {
            let _ = write!(out, " by thread {t}");
        }
        if let Some(access) = self.access {
            let _ = write!(out, " on {access:?}");
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "  detected by {} in epoch {}; {} ({}, seq {}, +{}us)",
            self.trigger,
            self.epoch,
            self.reproduction.as_str(),
            self.source,
            self.sequence,
            self.elapsed_us
        );
        if let Some(a) = &self.allocation {
            let _ = writeln!(
                out,
                "  allocation {}: {} bytes at {:#x}, allocated by thread {} at {} (epoch {})",
                a.id, a.size, a.user_base, a.thread, a.alloc_site, a.alloc_epoch
            );
            if let (Some(by), Some(site)) = (a.freed_by, &a.free_site) {
                let _ = writeln!(
                    out,
                    "  freed by thread {by} at {site} (epoch {})",
                    a.free_epoch.unwrap_or(0)
                );
            }
        }
        if !self.history.is_empty() {
            let _ = writeln!(out, "  recent operations:");
            for op in &self.history {
                let _ = writeln!(out, "    {op}");
            }
        }
        if !self.replayed.is_empty() {
            let _ = writeln!(out, "  replayed synchronization ({} events):", self.replayed.len());
            for ev in self.replayed.iter().rev().take(16).rev() {
                let _ = writeln!(out, "    {ev}");
            }
        }
        let action = match self.resolution {
            Resolution::Terminated => "terminated",
            Resolution::Neutralized => "neutralized, execution continued",
        };
        let _ = writeln!(out, "  action: {action}");
        out
    }
}

/// Blocks still live at program end, grouped by the call site that
/// allocated them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakSite {
    pub site: String,
    pub blocks: usize,
    /// Requested bytes, summed.
    pub bytes: usize,
    pub threads: Vec<ThreadId>,
}

/// Group live records by allocation site, largest first. Records in `skip`
/// are not leaks (engine-owned program state).
#[must_use]
pub fn summarize_leaks<'a>(
    records: impl IntoIterator<Item = &'a AllocationRecord>,
    skip: &BTreeSet<AllocId>,
) -> Vec<LeakSite> {
    let mut by_site: BTreeMap<String, LeakSite> = BTreeMap::new();
    for rec in records {
        if rec.state != AllocState::Live || skip.contains(&rec.id) {
            continue;
        }
        let site = rec.alloc_site.to_string();
        let entry = by_site.entry(site.clone()).or_insert_with(|| LeakSite {
            site,
            blocks: 0,
            bytes: 0,
            threads: Vec::new(),
        });
        entry.blocks += 1;
        entry.bytes += rec.size;
        if !entry.threads.contains(&rec.id.thread) {
            entry.threads.push(rec.id.thread);
        }
    }
    let mut leaks: Vec<LeakSite> = by_site.into_values().collect();
    leaks.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.site.cmp(&b.site)));
    leaks
}

#[must_use]
pub fn render_leaks(leaks: &[LeakSite]) -> String {
    let mut out = String::new();
    if leaks.is_empty() {
        return out;
    }
    let blocks: usize = leaks.iter().map(|l| l.blocks).sum();
    let bytes: usize = leaks.iter().map(|l| l.bytes).sum();
    let _ = writeln!(out, "rollguard: {bytes} byte(s) in {blocks} block(s) never freed");
    for leak in leaks {
        let _ = writeln!(out, "  {} bytes in {} block(s) allocated at {}", leak.bytes, leak.blocks, leak.site);
    }
    out
}
