//! PhaseGate - self-repairing CI/CD pipeline runner
//!
//! ## Commands
//!
//! - `check`: Scan a pipeline definition for structural defects
//! - `repair`: Run one circuit-breaker-bounded repair and persist the result
//! - `plan`: Print the execution levels of a definition
//! - `run`: Repair, execute and gate a pipeline

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use phasegate_ci::{
    CiPipeline, DeployStageRunner, PipelineConfig, PipelineError, RoutingRunner, ShellConfig,
    ShellRunner, DEPLOY_ACTION,
};
use phasegate_core::deploy::FsSnapshotStore;
use phasegate_core::{
    scan, CancelHandle, CycleBreakPolicy, DefinitionStore, DeploymentValidator, FileAttemptStore,
    FileDefinitionStore, PhaseGraph, PipelineDefinition, RepairEngine, RepairPolicy, RepairStatus,
    StageRunner, StageStatus, ValidationBackend, DEFAULT_STAGE_TIMEOUT_SECS,
};

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-repairing CI/CD pipeline runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a definition and list every defect
    Check {
        /// Pipeline definition (YAML or JSON)
        definition: PathBuf,
    },

    /// Run one repair invocation and save the repaired definition
    Repair {
        /// Pipeline definition (YAML or JSON)
        definition: PathBuf,

        #[command(flatten)]
        repair: RepairArgs,
    },

    /// Print the stages grouped by execution level
    Plan {
        /// Pipeline definition (YAML or JSON)
        definition: PathBuf,
    },

    /// Repair, execute and gate a pipeline
    Run {
        /// Pipeline definition (YAML or JSON)
        definition: PathBuf,

        #[command(flatten)]
        repair: RepairArgs,

        /// Directory for run reports (default: <state-dir>/runs)
        #[arg(long, env = "PHASEGATE_REPORTS_DIR")]
        reports_dir: Option<PathBuf>,

        /// Maximum number of stages running at once
        #[arg(long, env = "PHASEGATE_MAX_CONCURRENCY", default_value_t = 4)]
        max_concurrency: usize,

        /// Timeout for stages that declare none, in seconds
        #[arg(long, env = "PHASEGATE_STAGE_TIMEOUT_SECS", default_value_t = DEFAULT_STAGE_TIMEOUT_SECS)]
        timeout_secs: u64,
    },
}

/// Shell and deploy runners for the repaired `definition`.
fn stage_runner(
    workdir: &Path,
    definition: &PipelineDefinition,
    snapshots: &Path,
) -> Arc<dyn StageRunner> {
    let shell = ShellConfig::default()
        .with_workdir(workdir)
        .with_env(definition.metadata.env.clone());
    let backend = ValidationBackend::in_memory()
        .with_snapshots(Arc::new(FsSnapshotStore::new(snapshots.to_path_buf())));
    Arc::new(
        RoutingRunner::new(Arc::new(ShellRunner::new(shell.clone()))).register(
            DEPLOY_ACTION,
            Arc::new(DeployStageRunner::new(DeploymentValidator::new(backend), shell)),
        ),
    )
}

#[derive(clap::Args, Debug, Clone)]
struct RepairArgs {
    /// Directory for repair attempt records and snapshots
    #[arg(long, env = "PHASEGATE_STATE_DIR", default_value = ".phasegate")]
    state_dir: PathBuf,

    /// Repair attempts allowed before the circuit opens
    #[arg(long, env = "PHASEGATE_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Idle seconds after which the attempt counter resets
    #[arg(long, env = "PHASEGATE_RESET_WINDOW_SECS", default_value_t = 3600)]
    reset_window_secs: u64,

    /// Which edge of a two-stage cycle to drop: `earlier` or `later`
    #[arg(long, env = "PHASEGATE_CYCLE_BREAK", default_value = "earlier", value_parser = parse_cycle_break)]
    cycle_break: CycleBreakPolicy,
}

impl RepairArgs {
    fn policy(&self) -> RepairPolicy {
        RepairPolicy {
            max_attempts: self.max_attempts,
            reset_window_secs: self.reset_window_secs,
            cycle_break: self.cycle_break,
        }
    }

    /// One attempt record per definition file.
    fn attempts_path(&self, definition: &Path) -> PathBuf {
        let stem = definition
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline".to_string());
        self.state_dir
            .join("repair-attempts")
            .join(format!("{stem}.json"))
    }
}

fn parse_cycle_break(raw: &str) -> Result<CycleBreakPolicy, String> {
    match raw {
        "earlier" => Ok(CycleBreakPolicy::DropEarlierDependency),
        "later" => Ok(CycleBreakPolicy::DropLaterDependency),
        other => Err(format!("expected 'earlier' or 'later', got '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    phasegate_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Check { definition } => cmd_check(&definition),
        Commands::Repair { definition, repair } => cmd_repair(&definition, &repair).await,
        Commands::Plan { definition } => cmd_plan(&definition),
        Commands::Run {
            definition,
            repair,
            reports_dir,
            max_concurrency,
            timeout_secs,
        } => {
            cmd_run(
                &definition,
                &repair,
                reports_dir,
                max_concurrency,
                timeout_secs,
            )
            .await
        }
    }
}

/// Scan a definition and list its defects
fn cmd_check(path: &Path) -> Result<()> {
    let definition = FileDefinitionStore::new(path)
        .load()
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let defects = scan(&definition);

    if defects.is_empty() {
        println!("✓ {} is clean ({} stages)", definition.name, definition.stages.len());
        return Ok(());
    }

    println!("Defects in {}:", definition.name);
    for defect in &defects {
        let tag = if defect.is_fixable() { "fixable" } else { "manual" };
        println!("  - [{tag}] {defect}");
    }
    anyhow::bail!("{} defect(s) found", defects.len())
}

/// Run one repair invocation and persist any change
async fn cmd_repair(path: &Path, args: &RepairArgs) -> Result<()> {
    let store = FileDefinitionStore::new(path);
    let definition = store
        .load()
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let attempts = Arc::new(FileAttemptStore::new(args.attempts_path(path)));
    let engine = RepairEngine::new(attempts, args.policy());

    let report = tokio::task::spawn_blocking(move || engine.repair(&definition)).await??;

    for fix in &report.fixed {
        println!("  fixed: {} ({})", fix.defect, fix.action);
    }
    for defect in &report.unresolved {
        println!("  unresolved: {defect}");
    }
    if report.changed {
        store.save(&report.definition)?;
        info!(path = %path.display(), "saved repaired definition");
    }

    match report.status {
        RepairStatus::Clean => {
            println!("✓ Nothing to repair");
            Ok(())
        }
        RepairStatus::Repaired => {
            println!("✓ Repaired (attempt {}/{})", report.attempt, args.max_attempts);
            Ok(())
        }
        RepairStatus::Unresolved => anyhow::bail!(
            "{} defect(s) need manual attention (attempt {}/{})",
            report.unresolved.len(),
            report.attempt,
            args.max_attempts
        ),
        RepairStatus::Blocked { attempts } => anyhow::bail!(
            "Repair circuit open after {attempts} attempts; fix the definition manually or wait {}s",
            args.reset_window_secs
        ),
    }
}

/// Print execution levels
fn cmd_plan(path: &Path) -> Result<()> {
    let definition = FileDefinitionStore::new(path)
        .load()
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let graph = PhaseGraph::build(&definition)?;

    println!("Plan for {} ({} stages):", graph.name(), graph.len());
    for (level, stages) in graph.levels().iter().enumerate() {
        println!("  {}: {}", level, stages.join(", "));
    }
    Ok(())
}

    /// Repair, execute and gate a pipeline
async fn cmd_run(
    path: &Path,
    args: &RepairArgs,
    reports_dir: Option<PathBuf>,
    max_concurrency: usize,
    timeout_secs: u64,
) -> Result<()> {
    let store = Arc::new(FileDefinitionStore::new(path));
    let workdir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let snapshots = args.state_dir.join("snapshots");

    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling run");
                cancel.cancel();
            }
        });
    }

    let reports_dir = reports_dir.unwrap_or_else(|| args.state_dir.join("runs"));
    let config = PipelineConfig {
        repair: args.policy(),
        max_concurrency,
        default_timeout_secs: timeout_secs,
        report_dir: Some(reports_dir.clone()),
        cancel: cancel.signal(),
    };

    let result = match CiPipeline::run_with(
        store,
        Arc::new(FileAttemptStore::new(args.attempts_path(path))),
        |definition: &PipelineDefinition| stage_runner(&workdir, definition, &snapshots),
        config,
    )
    .await
    {
        Ok(r) => r,
        Err(PipelineError::CircuitOpen { attempts, defects }) => {
            for defect in &defects {
                println!("  unresolved: {defect}");
            }
            anyhow::bail!("Repair circuit open after {attempts} attempts")
        }
        Err(PipelineError::UnresolvedDefects { defects }) => {
            for defect in &defects {
                println!("  unresolved: {defect}");
            }
            anyhow::bail!("{} defect(s) need manual attention", defects.len())
        }
        Err(e) => return Err(e.into()),
    };

    for repair in &result.repairs {
        for fix in &repair.fixed {
            println!("  repaired: {} ({})", fix.defect, fix.action);
        }
    }

    println!("Run {} of {}:", result.report.run_id, result.report.pipeline);
    for stage in &result.report.results {
        let mark = match stage.status {
            StageStatus::Passed => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "-",
            StageStatus::Pending | StageStatus::Running => "?",
        };
        let duration = stage
            .duration_ms()
            .map(|ms| format!(" ({ms}ms)"))
            .unwrap_or_default();
        println!("  {mark} {} [{}]{duration}", stage.stage_id, stage.status);
    }
    println!("Report: {}", result.report_path(&reports_dir).display());

    let verdict = &result.verdict;
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if verdict.passed {
        Ok(())
    } else {
        anyhow::bail!("Pipeline {} failed", result.report.pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn repair_args(dir: &TempDir) -> RepairArgs {
        RepairArgs {
            state_dir: dir.path().join("state"),
            max_attempts: 3,
            reset_window_secs: 3600,
            cycle_break: CycleBreakPolicy::DropEarlierDependency,
        }
    }

    const CYCLE: &str = "name: ci\nstages:\n  - id: a\n    run: echo a\n    depends_on: [b]\n  - id: b\n    run: echo b\n    depends_on: [a]\n";

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "phasegate",
            "--verbose",
            "run",
            "ci.yaml",
            "--max-concurrency",
            "2",
            "--cycle-break",
            "later",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                max_concurrency,
                repair,
                ..
            } => {
                assert_eq!(max_concurrency, 2);
                assert_eq!(repair.cycle_break, CycleBreakPolicy::DropLaterDependency);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_rejects_unknown_cycle_break() {
        assert!(Cli::try_parse_from(["phasegate", "repair", "ci.yaml", "--cycle-break", "both"]).is_err());
    }

    #[test]
    fn check_reports_defects() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "ci.yaml", CYCLE);
        assert!(cmd_check(&path).is_err());

        let clean = write(&dir, "clean.yaml", "name: ci\nstages:\n  - id: a\n    run: echo a\n");
        assert!(cmd_check(&clean).is_ok());
    }

    #[test]
    fn plan_rejects_cycles() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "ci.yaml", CYCLE);
        assert!(cmd_plan(&path).is_err());
    }

    #[tokio::test]
    async fn repair_persists_and_then_plans() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "ci.yaml", CYCLE);
        let args = repair_args(&dir);

        cmd_repair(&path, &args).await.unwrap();
        assert!(args.attempts_path(&path).exists());
        assert!(cmd_plan(&path).is_ok());
        assert!(cmd_check(&path).is_ok());
    }

    #[tokio::test]
    async fn run_fails_when_gate_fails() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "ci.yaml",
            "name: ci\nstages:\n  - id: ok\n    run: echo ok\n  - id: bad\n    run: exit 2\n",
        );
        let args = repair_args(&dir);
        let err = cmd_run(&path, &args, None, 2, 30).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert!(dir.path().join("state/runs").is_dir());
    }

    #[tokio::test]
    async fn run_uses_env_of_repaired_definition() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "ci.yaml",
            "name: ci\nmetadata:\n  env:\n    TARGET: release\nstages:\n  - id: a\n    run: test \"$TARGET\" = release\n    depends_on: [b]\n  - id: b\n    run: echo b\n    depends_on: [a]\n",
        );
        let args = repair_args(&dir);
        cmd_run(&path, &args, None, 2, 30).await.unwrap();
        assert!(cmd_check(&path).is_ok());
    }
}
