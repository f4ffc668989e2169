//! Scenario execution and verdicts.

use rollguard_engine::{
    DetectionReport, Engine, ErrorKind, LogEmitter, MetricsSnapshot, OnDetection, RollguardConfig, RunOutcome,
};
use serde::Serialize;

use crate::error::HarnessError;
use crate::scenarios::{Expectation, SCENARIOS, Scenario};

/// Verdict for one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: &'static str,
    pub expect: Expectation,
    pub passed: bool,
    /// Why the verdict failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<String>,
    pub terminated: bool,
    pub reports: Vec<DetectionReport>,
    pub metrics: MetricsSnapshot,
}

impl ScenarioResult {
    #[must_use]
    pub fn first_kind(&self) -> Option<ErrorKind> {
        self.reports.first().map(|r| r.kind)
    }
}

/// Runs scenarios against one configuration.
pub struct ScenarioRunner {
    pub config: RollguardConfig,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(config: RollguardConfig) -> Self {
        Self { config }
    }

    /// Run one scenario with logs going to `log`.
    pub fn run(&self, scenario: &'static Scenario, log: LogEmitter) -> Result<ScenarioResult, HarnessError> {
        let mut engine = Engine::new(self.config.clone())?.with_log(log);
        scenario.install(&mut engine)?;
        let summary = engine.run()?;
        let terminated = matches!(summary.outcome, RunOutcome::Terminated(_));
        let mismatch = judge(scenario.expect, self.config.on_detection, terminated, &summary.reports);
        Ok(ScenarioResult {
            scenario: scenario.name,
            expect: scenario.expect,
            passed: mismatch.is_none(),
            mismatch,
            terminated,
            reports: summary.reports,
            metrics: summary.metrics,
        })
    }

    /// Run the whole catalog without logging.
    pub fn run_all(&self) -> Result<Vec<ScenarioResult>, HarnessError> {
        SCENARIOS
            .iter()
            .map(|s| self.run(s, LogEmitter::disabled()))
            .collect()
    }
}

fn judge(
    expect: Expectation,
    on_detection: OnDetection,
    terminated: bool,
    reports: &[DetectionReport],
) -> Option<String> {
    match expect {
        Expectation::Clean => {
            if let Some(r) = reports.first() {
                return Some(format!("unexpected {} at {:#x}", r.kind, r.address));
            }
            terminated.then(|| "clean scenario was terminated".to_string())
        }
        Expectation::Detects { kind, offset } => {
            let Some(first) = reports.first() else {
                return Some(format!("{kind} was not detected"));
            };
            if first.kind != kind {
                return Some(format!("expected {kind}, reported {}", first.kind));
            }
            if offset.is_some() && first.offset != offset {
                return Some(format!("expected offset {offset:?}, reported {:?}", first.offset));
            }
            match on_detection {
                OnDetection::Terminate if !terminated => Some("run was not terminated".to_string()),
                OnDetection::Continue if terminated => Some("run was terminated under continue".to_string()),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_expectation_rejects_any_report() {
        assert!(judge(Expectation::Clean, OnDetection::Terminate, false, &[]).is_none());
        assert_eq!(
            judge(Expectation::Clean, OnDetection::Terminate, true, &[]).as_deref(),
            Some("clean scenario was terminated")
        );
    }

    #[test]
    fn missing_detection_is_a_mismatch() {
        let expect = Expectation::Detects {
            kind: ErrorKind::DoubleFree,
            offset: None,
        };
        assert_eq!(
            judge(expect, OnDetection::Terminate, false, &[]).as_deref(),
            Some("DoubleFree was not detected")
        );
    }
}
