//! End-to-end pipeline orchestration: repair, plan, execute, gate.

use std::path::PathBuf;
use std::sync::Arc;

use phasegate_core::{
    AttemptStore, CancelSignal, Defect, DefinitionStore, ExecuteOptions, ExecutorError, GraphError,
    PhaseExecutor, PhaseGraph, PipelineDefinition, RepairEngine, RepairError, RepairPolicy,
    RepairReport, RepairStatus, RunReport, StageRunner, StoreError, DEFAULT_STAGE_TIMEOUT_SECS,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::gate::{CiGate, GateVerdict};

/// Why a pipeline could not produce a run report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("repair circuit open after {attempts} attempts; {} defect(s) need manual attention", .defects.len())]
    CircuitOpen { attempts: u32, defects: Vec<Defect> },

    #[error("{} defect(s) cannot be repaired automatically", .defects.len())]
    UnresolvedDefects { defects: Vec<Defect> },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Repair(#[from] RepairError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Knobs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repair: RepairPolicy,
    pub max_concurrency: usize,
    pub default_timeout_secs: u64,
    /// Where run reports are persisted; none skips persistence.
    pub report_dir: Option<PathBuf>,
    pub cancel: CancelSignal,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repair: RepairPolicy::default(),
            max_concurrency: 4,
            default_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            report_dir: None,
            cancel: CancelSignal::never(),
        }
    }
}

/// Result of a complete pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub report: RunReport,

    /// Repair invocations that changed or flagged something, in order.
    pub repairs: Vec<RepairReport>,

    pub verdict: GateVerdict,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.verdict.passed
    }

    /// Path of the persisted report, when a report directory was configured.
    pub fn report_path(&self, report_dir: &std::path::Path) -> PathBuf {
        report_dir
            .join(self.report.run_id.to_string())
            .join("report.json")
    }
}

/// CI pipeline orchestrator.
pub struct CiPipeline;

impl CiPipeline {
    /// Load the definition, repair it until it re-validates clean, then run
    /// it and evaluate the gate.
    ///
    /// Repairs are persisted through `store` before execution. The attempt
    /// store bounds how often this can happen before the circuit opens.
    pub async fn run(
        store: Arc<dyn DefinitionStore>,
        attempts: Arc<dyn AttemptStore>,
        runner: Arc<dyn StageRunner>,
        config: PipelineConfig,
    ) -> Result<PipelineResult, PipelineError> {
        Self::run_with(store, attempts, move |_| runner, config).await
    }

    /// Like [`CiPipeline::run`], but the runner is built from the repaired
    /// definition, e.g. to pick up its `metadata.env`.
    pub async fn run_with<F>(
        store: Arc<dyn DefinitionStore>,
        attempts: Arc<dyn AttemptStore>,
        make_runner: F,
        config: PipelineConfig,
    ) -> Result<PipelineResult, PipelineError>
    where
        F: FnOnce(&PipelineDefinition) -> Arc<dyn StageRunner>,
    {
        let engine = RepairEngine::new(attempts, config.repair.clone());
        let (definition, repairs) = Self::repair_until_clean(store, engine).await?;

        let graph = PhaseGraph::build(&definition)?;
        let runner = make_runner(&definition);
        info!(pipeline = %graph.name(), stages = graph.len(), levels = graph.levels().len(), "starting pipeline");

        let options = ExecuteOptions {
            max_concurrency: config.max_concurrency,
            default_timeout_secs: config.default_timeout_secs,
            cancel: config.cancel,
            report_dir: config.report_dir,
        };
        let report = PhaseExecutor::new(runner).execute(&graph, options).await?;
        let verdict = CiGate::evaluate(&report);

        if verdict.passed {
            info!(run_id = %report.run_id, "{}", verdict.message);
        } else {
            warn!(run_id = %report.run_id, violations = verdict.violations.len(), "{}", verdict.message);
        }

        Ok(PipelineResult {
            report,
            repairs,
            verdict,
        })
    }

    /// Repair invocations run on the blocking pool: the attempt store may
    /// wait on a lock file.
    pub async fn repair_until_clean(
        store: Arc<dyn DefinitionStore>,
        engine: RepairEngine,
    ) -> Result<(PipelineDefinition, Vec<RepairReport>), PipelineError> {
        let mut definition = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.load()).await??
        };
        let mut repairs = Vec::new();

        loop {
            let report = {
                let engine = engine.clone();
                let current = definition.clone();
                tokio::task::spawn_blocking(move || engine.repair(&current)).await??
            };

            match report.status {
                RepairStatus::Clean => return Ok((definition, repairs)),
                RepairStatus::Blocked { attempts } => {
                    return Err(PipelineError::CircuitOpen {
                        attempts,
                        defects: report.unresolved,
                    })
                }
                RepairStatus::Repaired | RepairStatus::Unresolved => {
                    if report.changed {
                        let store = Arc::clone(&store);
                        let repaired = report.definition.clone();
                        tokio::task::spawn_blocking(move || store.save(&repaired)).await??;
                        info!(
                            pipeline = %report.definition.name,
                            fixes = report.fixed.len(),
                            "persisted repaired definition"
                        );
                        definition = report.definition.clone();
                    }
                    let unresolved = report.unresolved.clone();
                    let changed = report.changed;
                    repairs.push(report);
                    if !unresolved.is_empty() {
                        return Err(PipelineError::UnresolvedDefects { defects: unresolved });
                    }
                    if !changed {
                        return Ok((definition, repairs));
                    }
                }
            }
        }
    }
}
