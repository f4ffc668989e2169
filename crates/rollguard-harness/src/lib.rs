//! Harness for the rollguard engine.
//!
//! This crate provides:
//! - Scenarios: small multithreaded programs with known heap bugs
//! - Runner: executes scenarios and checks the reports against expectations
//! - Log check: validates engine JSONL logs line by line
//! - The `rollguard` CLI binary

#![forbid(unsafe_code)]

pub mod error;
pub mod log_check;
pub mod runner;
pub mod scenarios;

pub use error::HarnessError;
pub use log_check::{LogCheck, LogViolation, check_sequence, validate_log_file, validate_log_line};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::{Expectation, SCENARIOS, Scenario};
