//! Structured observability hooks for run, repair and deployment lifecycles.
//!
//! Events carry an `event` field so log pipelines can filter on it, e.g.
//! `event=stage.finished`. Everything is emitted at `info!` except circuit
//! breaker exhaustion (`error!`) and persistence/rollback problems (`warn!`).

use tracing::{error, info, warn};

use crate::domain::{SkipReason, StageStatus};

/// RAII guard that enters a pipeline-scoped span around a synchronous
/// repair invocation.
pub struct RepairSpan {
    _span: tracing::span::EnteredSpan,
}

impl RepairSpan {
    pub fn enter(pipeline: &str) -> Self {
        Self {
            _span: tracing::info_span!("phasegate.repair", pipeline = %pipeline).entered(),
        }
    }
}

/// Span tagged with `run_id`, for instrumenting async work.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("phasegate.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, pipeline: &str, stages: usize) {
    info!(event = "run.started", run_id = %run_id, pipeline = %pipeline, stages = stages);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, passed: usize, failed: usize, skipped: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        passed = passed,
        failed = failed,
        skipped = skipped,
    );
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: &str, status: StageStatus, duration_ms: u64) {
    info!(event = "stage.finished", stage = %stage, status = %status, duration_ms = duration_ms);
}

pub fn emit_stage_skipped(stage: &str, reason: &SkipReason) {
    match reason {
        SkipReason::BlockedBy { stage: blocker } => {
            info!(event = "stage.skipped", stage = %stage, blocked_by = %blocker);
        }
        SkipReason::Cancelled => info!(event = "stage.skipped", stage = %stage, cancelled = true),
    }
}

pub fn emit_report_persist_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.report_persist_error", run_id = %run_id, error = %error);
}

pub fn emit_repair_evaluated(pipeline: &str, outcome: &str, fixed: usize, unresolved: usize, attempt: u32) {
    info!(
        event = "repair.evaluated",
        pipeline = %pipeline,
        outcome = %outcome,
        fixed = fixed,
        unresolved = unresolved,
        attempt = attempt,
    );
}

/// Logged at error level: the pipeline cannot proceed without a person.
pub fn emit_circuit_open(pipeline: &str, attempts: u32, defects: usize) {
    error!(
        event = "repair.circuit_open",
        pipeline = %pipeline,
        attempts = attempts,
        defects = defects,
        "repair attempts exhausted; manual intervention required",
    );
}

pub fn emit_deploy_phase(deployment_id: &str, phase: &str) {
    info!(event = "deploy.phase", deployment_id = %deployment_id, phase = %phase);
}

pub fn emit_rollback_failed(deployment_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "deploy.rollback_failed", deployment_id = %deployment_id, error = %error);
}
