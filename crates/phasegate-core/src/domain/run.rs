//! Stage outcomes and the per-run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a stage within one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// `passed`, `failed` and `skipped` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The action finished with a non-zero exit code.
    ExitCode { code: i32 },
    /// The timeout budget elapsed.
    Timeout { secs: u64 },
    /// The runner could not execute the action.
    Runner { message: String },
    /// The action was terminated by a cancellation request.
    Cancelled,
}

/// Why a stage never ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream stage failed critically or was itself skipped.
    BlockedBy { stage: String },
    /// The run was cancelled before the stage started.
    Cancelled,
}

/// Outcome of one stage in one run. Immutable once finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRunResult {
    pub stage_id: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Structured output from the runner (e.g. a deployment summary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl StageRunResult {
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            output_summary: String::new(),
            failure: None,
            skip_reason: None,
            detail: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }

    /// Wall-clock duration, when the stage ran.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// One status change, in the order the executor observed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTransition {
    pub stage_id: String,
    pub status: StageStatus,
    pub at: DateTime<Utc>,
}

/// The full set of stage results for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Results in declaration order.
    pub results: Vec<StageRunResult>,
    pub timeline: Vec<StageTransition>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn result(&self, stage_id: &str) -> Option<&StageRunResult> {
        self.results.iter().find(|r| r.stage_id == stage_id)
    }

    pub fn status_of(&self, stage_id: &str) -> Option<StageStatus> {
        self.result(stage_id).map(|r| r.status)
    }

    /// Statuses a stage moved through, in order.
    pub fn transitions_of(&self, stage_id: &str) -> Vec<StageStatus> {
        self.timeline
            .iter()
            .filter(|t| t.stage_id == stage_id)
            .map(|t| t.status)
            .collect()
    }

    /// True when every stage passed.
    pub fn success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(StageRunResult::passed)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
