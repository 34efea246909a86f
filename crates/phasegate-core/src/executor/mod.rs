//! Dependency-aware stage execution.
//!
//! The scheduler loop is the single writer of the [`RunReport`]: stage tasks
//! only return their outcome, and every status change is appended to the
//! report timeline by the loop itself.

pub mod cancel;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use crate::domain::{
    FailureReason, RunReport, SkipReason, StageDefinition, StageRunResult, StageStatus,
    StageTransition, DEFAULT_STAGE_TIMEOUT_SECS,
};
use crate::graph::PhaseGraph;
use crate::obs;
use crate::reporting::write_run_report;

pub use cancel::{CancelHandle, CancelSignal};

/// Errors that prevent a run from starting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("cannot execute an empty graph")]
    EmptyGraph,

    #[error("pipeline {pipeline} already has a run in progress")]
    AlreadyRunning { pipeline: String },
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// What a runner reports back for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// 0 means success.
    pub exit_code: i32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl StageOutput {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            summary: summary.into(),
            detail: None,
        }
    }

    pub fn failure(exit_code: i32, summary: impl Into<String>) -> Self {
        Self {
            exit_code,
            summary: summary.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes one stage's action (shell command, HTTP call, library call).
///
/// Implementations should stop promptly once `cancel` fires. Returning an
/// error marks the stage failed; it never aborts the run.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, stage: &StageDefinition, cancel: CancelSignal)
        -> anyhow::Result<StageOutput>;
}

/// Per-run execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Upper bound on concurrently running stages.
    pub max_concurrency: usize,
    /// Budget for stages that declare no timeout.
    pub default_timeout_secs: u64,
    pub cancel: CancelSignal,
    /// When set, the finished report is persisted under this directory.
    pub report_dir: Option<PathBuf>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            cancel: CancelSignal::never(),
            report_dir: None,
        }
    }
}

/// Walks a [`PhaseGraph`] with an injected [`StageRunner`].
#[derive(Clone)]
pub struct PhaseExecutor {
    runner: Arc<dyn StageRunner>,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Holds a pipeline's "run in progress" slot until dropped.
struct RunSlot {
    pipeline: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.pipeline);
    }
}

struct Completion {
    status: StageStatus,
    summary: String,
    failure: Option<FailureReason>,
    detail: Option<Value>,
}

impl PhaseExecutor {
    pub fn new(runner: Arc<dyn StageRunner>) -> Self {
        Self {
            runner,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, pipeline: &str) -> ExecutorResult<RunSlot> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(pipeline.to_string()) {
            return Err(ExecutorError::AlreadyRunning {
                pipeline: pipeline.to_string(),
            });
        }
        Ok(RunSlot {
            pipeline: pipeline.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    /// Run every stage of `graph` and return the aggregated report.
    ///
    /// Individual stage failures, timeouts and cancellation are recorded in
    /// the report; only [`ExecutorError`] pre-conditions return `Err`.
    pub async fn execute(
        &self,
        graph: &PhaseGraph,
        options: ExecuteOptions,
    ) -> ExecutorResult<RunReport> {
        if graph.is_empty() {
            return Err(ExecutorError::EmptyGraph);
        }
        let _slot = self.claim(graph.name())?;

        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string());
        Ok(self.drive(graph, options, run_id).instrument(span).await)
    }

    async fn drive(&self, graph: &PhaseGraph, options: ExecuteOptions, run_id: Uuid) -> RunReport {
        let run_id_str = run_id.to_string();
        obs::emit_run_started(&run_id_str, graph.name(), graph.len());

        let stages = graph.stages();
        let started_at = Utc::now();
        let mut board = Board::new(stages);
        let mut tasks: JoinSet<(usize, Completion)> = JoinSet::new();
        let mut running = 0usize;
        let cap = options.max_concurrency.max(1);
        let mut cancel = options.cancel.clone();
        let mut cancelled = cancel.is_cancelled();

        loop {
            // Settle every pending stage that can be decided right now. Marking
            // a stage skipped may unblock decisions further down, hence the loop.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for i in 0..stages.len() {
                    if board.results[i].status != StageStatus::Pending {
                        continue;
                    }
                    if cancelled {
                        board.skip(i, SkipReason::Cancelled);
                        progressed = true;
                        continue;
                    }
                    match board.readiness(graph, i) {
                        Readiness::Waiting => continue,
                        Readiness::Blocked(reason) => {
                            board.skip(i, reason);
                            progressed = true;
                            continue;
                        }
                        Readiness::Ready => {}
                    }
                    if running >= cap {
                        continue;
                    }

                    board.start(i);
                    let budget = stages[i].timeout_or(options.default_timeout_secs);
                    tasks.spawn(run_stage(
                        i,
                        Arc::clone(&self.runner),
                        stages[i].clone(),
                        cancel.clone(),
                        budget,
                    ));
                    running += 1;
                }
            }

            if running == 0 {
                // A task lost to an abort leaves its stage running. Close it out
                // and go round again so its dependents get decided too.
                if board.close_out_lost() {
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((i, completion))) => {
                            running -= 1;
                            board.finish(i, completion);
                        }
                        Some(Err(e)) => {
                            running -= 1;
                            error!(error = %e, "stage task aborted");
                        }
                        None => running = 0,
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(pipeline = %graph.name(), "cancellation requested; no further stages will start");
                    cancelled = true;
                }
            }
        }

        let report = RunReport {
            run_id,
            pipeline: graph.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            results: board.results,
            timeline: board.timeline,
            cancelled,
        };

        obs::emit_run_finished(
            &run_id_str,
            report.duration_ms(),
            report.count(StageStatus::Passed),
            report.count(StageStatus::Failed),
            report.count(StageStatus::Skipped),
        );

        if let Some(dir) = &options.report_dir {
            if let Err(e) = write_run_report(&report, dir) {
                obs::emit_report_persist_error(&run_id_str, &e);
            }
        }

        report
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Waiting,
    Blocked(SkipReason),
    Ready,
}

/// Scheduler-owned run state, indexed like [`PhaseGraph::stages`].
struct Board<'g> {
    stages: &'g [StageDefinition],
    results: Vec<StageRunResult>,
    timeline: Vec<StageTransition>,
    /// Critical stage whose failure taints this stage. An `always_run` stage
    /// still runs when tainted but passes the taint on to its dependents.
    blocked_by: Vec<Option<usize>>,
}

impl<'g> Board<'g> {
    fn new(stages: &'g [StageDefinition]) -> Self {
        Self {
            stages,
            results: stages
                .iter()
                .map(|s| StageRunResult::pending(s.id.clone()))
                .collect(),
            timeline: Vec::new(),
            blocked_by: vec![None; stages.len()],
        }
    }

    fn readiness(&mut self, graph: &PhaseGraph, i: usize) -> Readiness {
        let upstream = graph.upstream_indices(i);
        if !upstream.iter().all(|&u| self.results[u].status.is_terminal()) {
            return Readiness::Waiting;
        }
        let root = upstream.iter().find_map(|&u| match self.results[u].status {
            StageStatus::Failed if self.stages[u].critical => Some(u),
            StageStatus::Skipped => Some(self.blocked_by[u].unwrap_or(u)),
            _ => self.blocked_by[u],
        });
        self.blocked_by[i] = root;
        match root {
            Some(r) if !self.stages[i].always_run => Readiness::Blocked(SkipReason::BlockedBy {
                stage: self.stages[r].id.clone(),
            }),
            _ => Readiness::Ready,
        }
    }

    fn start(&mut self, i: usize) {
        let now = Utc::now();
        let result = &mut self.results[i];
        result.status = StageStatus::Running;
        result.started_at = Some(now);
        self.timeline.push(StageTransition {
            stage_id: result.stage_id.clone(),
            status: StageStatus::Running,
            at: now,
        });
        obs::emit_stage_started(&result.stage_id);
    }

    fn skip(&mut self, i: usize, reason: SkipReason) {
        let now = Utc::now();
        let result = &mut self.results[i];
        obs::emit_stage_skipped(&result.stage_id, &reason);
        result.status = StageStatus::Skipped;
        result.finished_at = Some(now);
        result.output_summary = match &reason {
            SkipReason::BlockedBy { stage } => format!("skipped: blocked by {stage}"),
            SkipReason::Cancelled => "skipped: cancelled".to_string(),
        };
        result.skip_reason = Some(reason);
        self.timeline.push(StageTransition {
            stage_id: result.stage_id.clone(),
            status: StageStatus::Skipped,
            at: now,
        });
    }

    fn finish(&mut self, i: usize, completion: Completion) {
        let now = Utc::now();
        let result = &mut self.results[i];
        result.status = completion.status;
        result.finished_at = Some(now);
        result.output_summary = completion.summary;
        result.failure = completion.failure;
        result.detail = completion.detail;
        self.timeline.push(StageTransition {
            stage_id: result.stage_id.clone(),
            status: completion.status,
            at: now,
        });
        obs::emit_stage_finished(
            &result.stage_id,
            completion.status,
            result.duration_ms().unwrap_or(0),
        );
    }

    /// Fail every stage still marked running. Returns whether any was found.
    fn close_out_lost(&mut self) -> bool {
        let lost: Vec<usize> = (0..self.results.len())
            .filter(|&i| self.results[i].status == StageStatus::Running)
            .collect();
        for &i in &lost {
            self.finish(
                i,
                Completion {
                    status: StageStatus::Failed,
                    summary: "stage task aborted".to_string(),
                    failure: Some(FailureReason::Runner {
                        message: "stage task aborted".to_string(),
                    }),
                    detail: None,
                },
            );
        }
        !lost.is_empty()
    }
}

/// Run one stage inside its own task, bounded by `budget_secs`.
///
/// The runner future lives in a nested task so a panic or a timeout can be
/// mapped back to this stage; aborting that task drops the runner future.
async fn run_stage(
    index: usize,
    runner: Arc<dyn StageRunner>,
    stage: StageDefinition,
    cancel: CancelSignal,
    budget_secs: u64,
) -> (usize, Completion) {
    let signal = cancel.clone();
    let stage_id = stage.id.clone();
    let handle = tokio::spawn(async move { runner.run(&stage, signal).await });
    let abort = handle.abort_handle();

    let completion = match tokio::time::timeout(Duration::from_secs(budget_secs), handle).await {
        Err(_) => {
            abort.abort();
            debug!(stage = %stage_id, budget_secs, "stage timed out");
            Completion {
                status: StageStatus::Failed,
                summary: format!("timed out after {budget_secs}s"),
                failure: Some(FailureReason::Timeout { secs: budget_secs }),
                detail: None,
            }
        }
        Ok(Err(join_err)) => Completion {
            status: StageStatus::Failed,
            summary: format!("runner panicked: {join_err}"),
            failure: Some(FailureReason::Runner {
                message: join_err.to_string(),
            }),
            detail: None,
        },
        Ok(Ok(Err(e))) => Completion {
            status: StageStatus::Failed,
            summary: format!("{e:#}"),
            failure: Some(FailureReason::Runner {
                message: format!("{e:#}"),
            }),
            detail: None,
        },
        Ok(Ok(Ok(output))) if output.passed() => Completion {
            status: StageStatus::Passed,
            summary: output.summary,
            failure: None,
            detail: output.detail,
        },
        Ok(Ok(Ok(output))) => {
            let failure = if cancel.is_cancelled() {
                FailureReason::Cancelled
            } else {
                FailureReason::ExitCode {
                    code: output.exit_code,
                }
            };
            Completion {
                status: StageStatus::Failed,
                summary: output.summary,
                failure: Some(failure),
                detail: output.detail,
            }
        }
    };

    (index, completion)
}
