//! CI gate evaluation for pass/fail criteria.

use phasegate_core::{FailureReason, RunReport, SkipReason, StageStatus};
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// CI gate evaluation rules.
pub struct CiGate;

impl CiGate {
    /// Evaluate whether every stage of the run passed.
    ///
    /// Each failed or skipped stage is one violation, as is any stage left
    /// without a terminal status and a cancelled run.
    pub fn evaluate(report: &RunReport) -> GateVerdict {
        let mut violations = Vec::new();

        if report.cancelled {
            violations.push("Run was cancelled".to_string());
        }

        for result in &report.results {
            match result.status {
                StageStatus::Passed => {}
                StageStatus::Failed => {
                    let reason = match &result.failure {
                        Some(FailureReason::ExitCode { code }) => {
                            format!("non-zero exit code: {code}")
                        }
                        Some(FailureReason::Timeout { secs }) => format!("timed out after {secs}s"),
                        Some(FailureReason::Runner { message }) => format!("runner error: {message}"),
                        Some(FailureReason::Cancelled) => "cancelled".to_string(),
                        None => "failed".to_string(),
                    };
                    violations.push(format!("Stage '{}' failed: {}", result.stage_id, reason));
                }
                StageStatus::Skipped => {
                    let reason = match &result.skip_reason {
                        Some(SkipReason::BlockedBy { stage }) => format!("blocked by '{stage}'"),
                        Some(SkipReason::Cancelled) => "cancelled".to_string(),
                        None => "skipped".to_string(),
                    };
                    violations.push(format!("Stage '{}' skipped: {}", result.stage_id, reason));
                }
                StageStatus::Pending | StageStatus::Running => {
                    violations.push(format!("Stage '{}' never completed", result.stage_id));
                }
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use phasegate_core::StageRunResult;
    use uuid::Uuid;

    fn report(results: Vec<StageRunResult>) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            pipeline: "ci".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results,
            timeline: Vec::new(),
            cancelled: false,
        }
    }

    fn with_status(id: &str, status: StageStatus) -> StageRunResult {
        let mut r = StageRunResult::pending(id);
        r.status = status;
        r
    }

    #[test]
    fn all_passed_stages_pass() {
        let verdict = CiGate::evaluate(&report(vec![
            with_status("fmt", StageStatus::Passed),
            with_status("check", StageStatus::Passed),
        ]));
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn non_zero_exit_code_is_reported() {
        let mut failed = with_status("test", StageStatus::Failed);
        failed.failure = Some(FailureReason::ExitCode { code: 127 });
        let verdict = CiGate::evaluate(&report(vec![failed]));
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("127"));
    }

    #[test]
    fn skipped_stage_names_its_blocker() {
        let mut skipped = with_status("deploy", StageStatus::Skipped);
        skipped.skip_reason = Some(SkipReason::BlockedBy {
            stage: "test".to_string(),
        });
        let verdict = CiGate::evaluate(&report(vec![skipped]));
        assert_eq!(verdict.violations, vec!["Stage 'deploy' skipped: blocked by 'test'"]);
    }

    #[test]
    fn stage_left_running_never_completed() {
        let verdict = CiGate::evaluate(&report(vec![with_status("fmt", StageStatus::Running)]));
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never completed"));
    }

    #[test]
    fn cancelled_run_fails() {
        let mut r = report(vec![with_status("fmt", StageStatus::Passed)]);
        r.cancelled = true;
        let verdict = CiGate::evaluate(&r);
        assert!(!verdict.passed);
        assert_eq!(verdict.message, "Gate failed with 1 violation(s)");
    }
}
