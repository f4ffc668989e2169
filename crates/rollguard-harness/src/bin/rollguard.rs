//! CLI entrypoint for the rollguard harness.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use rollguard_engine::{CheckpointPolicy, LogEmitter, OnDetection, RollguardConfig, TrackingMode, Verbosity};
use rollguard_harness::{HarnessError, SCENARIOS, ScenarioResult, ScenarioRunner, check_sequence, scenarios, validate_log_file};

/// Checkpoint/rollback heap-error detection scenarios.
#[derive(Debug, Parser)]
#[command(name = "rollguard")]
#[command(about = "Run rollguard detection scenarios and validate their logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Run one scenario.
    Run {
        /// Scenario name (see `list`).
        #[arg(long)]
        scenario: String,
        #[command(flatten)]
        engine: EngineArgs,
        /// Write the structured JSONL log here.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Print the result as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Run every scenario and report pass/fail.
    Suite {
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        json: bool,
    },
    /// Validate a structured JSONL log produced by `run --log`.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Print the effective configuration.
    Config {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// JSON configuration file; `ROLLGUARD_*` variables apply otherwise.
    #[arg(long)]
    config: Option<PathBuf>,
    /// `terminate` or `continue`.
    #[arg(long)]
    on_detection: Option<String>,
    /// `page` (page protection) or `barrier` (write barrier).
    #[arg(long)]
    tracking: Option<String>,
    /// `manual`, `interval:<ms>` or `allocs:<n>`.
    #[arg(long)]
    checkpoint: Option<String>,
    /// `quiet`, `normal`, `verbose` or `trace`.
    #[arg(long)]
    verbosity: Option<String>,
}

impl EngineArgs {
    fn load(&self) -> Result<RollguardConfig, HarnessError> {
        let mut cfg = match &self.config {
            Some(path) => RollguardConfig::from_json(&std::fs::read_to_string(path)?)?,
            None => RollguardConfig::from_env()?,
        };
        if let Some(v) = &self.on_detection {
            cfg.on_detection = parse_opt("--on-detection", v, OnDetection::from_str_loose)?;
        }
        if let Some(v) = &self.tracking {
            cfg.tracking = parse_opt("--tracking", v, TrackingMode::from_str_loose)?;
        }
        if let Some(v) = &self.checkpoint {
            cfg.checkpoint = parse_opt("--checkpoint", v, CheckpointPolicy::from_str_loose)?;
        }
        if let Some(v) = &self.verbosity {
            cfg.verbosity = parse_opt("--verbosity", v, Verbosity::from_str_loose)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_opt<T>(option: &'static str, value: &str, parse: fn(&str) -> Option<T>) -> Result<T, HarnessError> {
    parse(value).ok_or_else(|| HarnessError::InvalidOption {
        option,
        value: value.to_string(),
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("rollguard: {err}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether the command succeeded.
fn execute(command: Command) -> Result<bool, HarnessError> {
    match command {
        Command::List => {
            for s in SCENARIOS {
                println!("{:<18} {}", s.name, s.description);
            }
            Ok(true)
        }
        Command::Run {
            scenario,
            engine,
            log,
            json,
        } => {
            let found = scenarios::find(&scenario).ok_or(HarnessError::UnknownScenario(scenario))?;
            let cfg = engine.load()?;
            let emitter = match &log {
                Some(path) => LogEmitter::to_file(path, found.name, cfg.verbosity)?,
                None => LogEmitter::disabled(),
            };
            let result = ScenarioRunner::new(cfg).run(found, emitter)?;
            print_result(&result, json)?;
            Ok(result.passed)
        }
        Command::Suite { engine, json } => {
            let results = ScenarioRunner::new(engine.load()?).run_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    let verdict = if r.passed { "PASS" } else { "FAIL" };
                    println!("{verdict} {:<18} {}", r.scenario, r.mismatch.as_deref().unwrap_or(""));
                }
            }
            let failed = results.iter().filter(|r| !r.passed).count();
            if failed > 0 {
                return Err(HarnessError::SuiteFailed {
                    failed,
                    total: results.len(),
                });
            }
            eprintln!("{} scenarios passed", results.len());
            Ok(true)
        }
        Command::ValidateLog { log } => validate(&log),
        Command::Config { engine } => {
            println!("{}", serde_json::to_string_pretty(&engine.load()?)?);
            Ok(true)
        }
    }
}

fn print_result(result: &ScenarioResult, json: bool) -> Result<(), HarnessError> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    for report in &result.reports {
        print!("{}", report.render_text());
    }
    let verdict = if result.passed { "PASS" } else { "FAIL" };
    println!(
        "{verdict} {}: {} report(s), {} rollback(s), {} checkpoint(s)",
        result.scenario,
        result.reports.len(),
        result.metrics.rollbacks,
        result.metrics.checkpoints_sealed
    );
    if let Some(why) = &result.mismatch {
        println!("  {why}");
    }
    Ok(())
}

fn validate(path: &Path) -> Result<bool, HarnessError> {
    let check = validate_log_file(path)?;
    let mut violations = check.violations;
    violations.extend(check_sequence(&check.entries));
    for v in &violations {
        eprintln!("{v}");
    }
    if !violations.is_empty() {
        return Err(HarnessError::LogInvalid(violations.len()));
    }
    println!("{}: {} entries valid", path.display(), check.lines);
    Ok(true)
}
