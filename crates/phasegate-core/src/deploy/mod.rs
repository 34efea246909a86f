//! Deployment validation: pre-checks, the deployment itself, post-checks and
//! rollback, driven as one state machine.
//!
//! ```text
//! Idle -> PreValidating -> PreFailed
//!                       -> Deploying -> DeployFailed
//!                                    -> PostValidating -> Complete
//!                                                      -> RolledBack
//! ```

pub mod anomaly;
pub mod backend;
pub mod checksum;
pub mod schema;
pub mod snapshot;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::obs;

pub use anomaly::StatisticalAnomalyDetector;
pub use backend::{
    AnomalyDetector, AnomalyReport, BackendError, BaselineStats, CheckOutcome, ChecksumProvider,
    SnapshotComparison, SnapshotStore, ValidationBackend, ValidationContext, ValidationResult,
    Validator,
};
pub use checksum::Sha256Checksum;
pub use schema::{FieldType, Schema, SchemaValidator};
pub use snapshot::{FsSnapshotStore, MemorySnapshotStore};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment failed: {0}")]
    Deployment(String),

    #[error("rollback failed: {0}")]
    Rollback(String),
}

/// Which optional checks a deployment performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentOptions {
    pub create_snapshot: bool,
    pub create_golden_baseline: bool,
    pub verify_checksum: bool,
    pub verify_snapshot: bool,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            create_snapshot: false,
            create_golden_baseline: false,
            verify_checksum: true,
            verify_snapshot: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Idle,
    PreValidating,
    PreFailed,
    Deploying,
    DeployFailed,
    PostValidating,
    RolledBack,
    Complete,
}

impl DeploymentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PreFailed | Self::DeployFailed | Self::RolledBack | Self::Complete
        )
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::PreValidating => "pre_validating",
            Self::PreFailed => "pre_failed",
            Self::Deploying => "deploying",
            Self::DeployFailed => "deploy_failed",
            Self::PostValidating => "post_validating",
            Self::RolledBack => "rolled_back",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Performs the deployment, returning the deployed data for post-checks.
#[async_trait]
pub trait DeploymentAction: Send + Sync {
    async fn deploy(&self, data: &Value, ctx: &ValidationContext) -> anyhow::Result<Value>;
}

/// Restores the pre-deployment state.
#[async_trait]
pub trait RollbackAction: Send + Sync {
    async fn rollback(&self, ctx: &ValidationContext) -> anyhow::Result<()>;
}

/// Rollback that does nothing, for deployments with nothing to restore.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRollback;

#[async_trait]
impl RollbackAction for NoopRollback {
    async fn rollback(&self, _ctx: &ValidationContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type CheckFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A named predicate over the pre-deployment data.
#[derive(Clone)]
pub struct CustomCheck {
    pub name: String,
    check: Arc<CheckFn>,
}

impl CustomCheck {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn run(&self, data: &Value) -> Result<(), String> {
        (self.check)(data)
    }
}

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCheck").field("name", &self.name).finish()
    }
}

/// Everything that happened during one `deploy_with_validation` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub deployment_id: Uuid,
    pub success: bool,
    pub phase: DeploymentPhase,
    /// Every phase entered, in order, starting with `Idle`.
    pub phases: Vec<DeploymentPhase>,
    pub pre: ValidationResult,
    pub post: Option<ValidationResult>,
    pub rolled_back: bool,
    pub deploy_error: Option<String>,
    pub rollback_error: Option<String>,
}

#[derive(Debug)]
struct PhaseTrack {
    deployment_id: String,
    phases: Vec<DeploymentPhase>,
}

impl PhaseTrack {
    fn new(deployment_id: Uuid) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            phases: vec![DeploymentPhase::Idle],
        }
    }

    fn enter(&mut self, phase: DeploymentPhase) {
        obs::emit_deploy_phase(&self.deployment_id, &phase.to_string());
        self.phases.push(phase);
    }

    fn current(&self) -> DeploymentPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(DeploymentPhase::Idle)
    }
}

/// Validates data around a deployment and rolls back when post-checks fail.
#[derive(Clone, Default)]
pub struct DeploymentValidator {
    backend: ValidationBackend,
    custom_checks: Vec<CustomCheck>,
}

impl DeploymentValidator {
    pub fn new(backend: ValidationBackend) -> Self {
        Self {
            backend,
            custom_checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: CustomCheck) -> Self {
        self.custom_checks.push(check);
        self
    }

    pub fn backend(&self) -> &ValidationBackend {
        &self.backend
    }

    fn check_required_fields(data: &Value, fields: &[String], result: &mut ValidationResult) {
        if fields.is_empty() {
            return;
        }
        let Some(records) = schema::records(data) else {
            result.record(
                "required_fields",
                CheckOutcome::Failed("data has no records".to_string()),
            );
            return;
        };
        let missing: Vec<String> = records
            .iter()
            .enumerate()
            .flat_map(|(i, record)| {
                fields
                    .iter()
                    .filter(move |f| record.get(f.as_str()).map_or(true, Value::is_null))
                    .map(move |f| format!("record {i} missing '{f}'"))
            })
            .collect();
        if missing.is_empty() {
            result.record("required_fields", CheckOutcome::Passed);
        } else {
            result.record("required_fields", CheckOutcome::Failed(missing.join("; ")));
        }
    }

    /// Validate `data` before deployment, recording the checksum, snapshot and
    /// golden baseline in `ctx` as `options` ask.
    pub fn validate_pre_deployment(
        &self,
        data: &Value,
        ctx: &mut ValidationContext,
        options: &DeploymentOptions,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();
        if data.is_null() {
            result.record("data", CheckOutcome::Failed("no data supplied".to_string()));
            return result;
        }

        result.merge(self.backend.validator.validate(data, &ctx.schema));
        Self::check_required_fields(data, &ctx.required_fields, &mut result);

        ctx.baseline_checksum = Some(self.backend.checksum.checksum(data));
        result.record("checksum", CheckOutcome::Passed);

        if options.create_snapshot {
            let name = format!("pre-{}", ctx.deployment_id);
            match self.backend.snapshots.snapshot(&name, data) {
                Ok(()) => {
                    ctx.snapshot_name = Some(name);
                    result.record("snapshot", CheckOutcome::Passed);
                }
                Err(e) => result.record("snapshot", CheckOutcome::Failed(e.to_string())),
            }
        }

        if options.create_golden_baseline {
            ctx.baseline_stats = Some(self.backend.anomaly.baseline(data));
            result.record("golden_dataset", CheckOutcome::Passed);
        }

        for check in &self.custom_checks {
            let outcome = match check.run(data) {
                Ok(()) => CheckOutcome::Passed,
                Err(msg) => CheckOutcome::Failed(msg),
            };
            result.record(format!("custom:{}", check.name), outcome);
        }

        result
    }

    /// Run the deployment action.
    pub async fn execute_deployment(
        &self,
        action: &dyn DeploymentAction,
        data: &Value,
        ctx: &ValidationContext,
    ) -> Result<Value, DeployError> {
        action
            .deploy(data, ctx)
            .await
            .map_err(|e| DeployError::Deployment(format!("{e:#}")))
    }

    /// Validate the deployed `result`. `should_rollback` is set when any check
    /// failed or the anomaly detector flagged drift from the golden baseline.
    pub fn validate_post_deployment(
        &self,
        result: &Value,
        ctx: &ValidationContext,
        options: &DeploymentOptions,
    ) -> ValidationResult {
        let mut out = ValidationResult::new();

        out.merge(self.backend.validator.validate(result, &ctx.schema));
        Self::check_required_fields(result, &ctx.required_fields, &mut out);

        match (&ctx.baseline_checksum, options.verify_checksum) {
            (Some(expected), true) => {
                let actual = self.backend.checksum.checksum(result);
                if &actual == expected {
                    out.record("checksum", CheckOutcome::Passed);
                } else {
                    out.record(
                        "checksum",
                        CheckOutcome::Failed(format!("expected {expected}, got {actual}")),
                    );
                }
            }
            _ => out.record("checksum", CheckOutcome::Skipped),
        }

        if options.verify_snapshot {
            match &ctx.snapshot_name {
                Some(name) => match self.backend.snapshots.compare(name, result) {
                    Ok(cmp) if cmp.matches => out.record("snapshot", CheckOutcome::Passed),
                    Ok(cmp) => out.record("snapshot", CheckOutcome::Failed(cmp.message)),
                    Err(e) => out.record("snapshot", CheckOutcome::Failed(e.to_string())),
                },
                None => out.record(
                    "snapshot",
                    CheckOutcome::Warning("no pre-deployment snapshot to compare".to_string()),
                ),
            }
        }

        let mut anomalous = false;
        if let Some(stats) = &ctx.baseline_stats {
            let report = self.backend.anomaly.detect(stats, result);
            anomalous = report.anomalous;
            if anomalous {
                out.record("anomaly", CheckOutcome::Warning(report.findings.join("; ")));
            } else {
                out.record("anomaly", CheckOutcome::Passed);
            }
        }

        out.should_rollback = !out.passed || anomalous;
        out
    }

    /// Drive the full pre-validate, deploy, post-validate, rollback sequence.
    pub async fn deploy_with_validation(
        &self,
        data: &Value,
        schema: Schema,
        action: &dyn DeploymentAction,
        rollback: &dyn RollbackAction,
        options: &DeploymentOptions,
    ) -> DeploymentSummary {
        let mut ctx = ValidationContext::new(schema);
        let mut track = PhaseTrack::new(ctx.deployment_id);

        track.enter(DeploymentPhase::PreValidating);
        let pre = self.validate_pre_deployment(data, &mut ctx, options);
        if !pre.passed {
            track.enter(DeploymentPhase::PreFailed);
            return summary(&ctx, track, pre, None, false, None, None);
        }

        track.enter(DeploymentPhase::Deploying);
        let deployed = match self.execute_deployment(action, data, &ctx).await {
            Ok(v) => v,
            Err(e) => {
                track.enter(DeploymentPhase::DeployFailed);
                return summary(&ctx, track, pre, None, false, Some(e.to_string()), None);
            }
        };

        track.enter(DeploymentPhase::PostValidating);
        let post = self.validate_post_deployment(&deployed, &ctx, options);
        if !post.should_rollback {
            track.enter(DeploymentPhase::Complete);
            return summary(&ctx, track, pre, Some(post), false, None, None);
        }

        let rollback_error = match rollback.rollback(&ctx).await {
            Ok(()) => None,
            Err(e) => {
                let err = DeployError::Rollback(format!("{e:#}"));
                obs::emit_rollback_failed(&track.deployment_id, &err);
                Some(err.to_string())
            }
        };
        track.enter(DeploymentPhase::RolledBack);
        summary(&ctx, track, pre, Some(post), true, None, rollback_error)
    }
}

fn summary(
    ctx: &ValidationContext,
    track: PhaseTrack,
    pre: ValidationResult,
    post: Option<ValidationResult>,
    rolled_back: bool,
    deploy_error: Option<String>,
    rollback_error: Option<String>,
) -> DeploymentSummary {
    let phase = track.current();
    DeploymentSummary {
        deployment_id: ctx.deployment_id,
        success: phase == DeploymentPhase::Complete,
        phase,
        phases: track.phases,
        pre,
        post,
        rolled_back,
        deploy_error,
        rollback_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl DeploymentAction for Echo {
        async fn deploy(&self, data: &Value, _ctx: &ValidationContext) -> anyhow::Result<Value> {
            Ok(data.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl DeploymentAction for Broken {
        async fn deploy(&self, _data: &Value, _ctx: &ValidationContext) -> anyhow::Result<Value> {
            anyhow::bail!("target unreachable")
        }
    }

    #[derive(Default)]
    struct CountingRollback(AtomicUsize);

    #[async_trait]
    impl RollbackAction for CountingRollback {
        async fn rollback(&self, _ctx: &ValidationContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn schema() -> Schema {
        Schema::new().require("id", FieldType::Integer)
    }

    #[tokio::test]
    async fn happy_path_completes() {
        let validator = DeploymentValidator::default();
        let rollback = CountingRollback::default();
        let summary = validator
            .deploy_with_validation(
                &json!([{"id": 1}]),
                schema(),
                &Echo,
                &rollback,
                &DeploymentOptions::default(),
            )
            .await;
        assert!(summary.success);
        assert_eq!(
            summary.phases,
            vec![
                DeploymentPhase::Idle,
                DeploymentPhase::PreValidating,
                DeploymentPhase::Deploying,
                DeploymentPhase::PostValidating,
                DeploymentPhase::Complete,
            ]
        );
        assert_eq!(rollback.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deploy_error_halts_without_post_validation() {
        let validator = DeploymentValidator::default();
        let rollback = CountingRollback::default();
        let summary = validator
            .deploy_with_validation(
                &json!({"id": 1}),
                schema(),
                &Broken,
                &rollback,
                &DeploymentOptions::default(),
            )
            .await;
        assert_eq!(summary.phase, DeploymentPhase::DeployFailed);
        assert!(summary.post.is_none());
        assert!(summary
            .deploy_error
            .as_deref()
            .unwrap()
            .contains("target unreachable"));
        assert_eq!(rollback.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_check_failure_fails_pre_validation() {
        let validator = DeploymentValidator::default().with_check(CustomCheck::new(
            "non_empty",
            |data| match data.as_array() {
                Some(items) if items.is_empty() => Err("no rows".to_string()),
                _ => Ok(()),
            },
        ));
        let mut ctx = ValidationContext::new(Schema::new());
        let result =
            validator.validate_pre_deployment(&json!([]), &mut ctx, &DeploymentOptions::default());
        assert!(!result.passed);
        assert!(result.validations["custom:non_empty"].is_failed());
    }

    #[test]
    fn pre_validation_records_snapshot_and_baseline() {
        let validator = DeploymentValidator::default();
        let mut ctx = ValidationContext::new(schema());
        let options = DeploymentOptions {
            create_snapshot: true,
            create_golden_baseline: true,
            ..Default::default()
        };
        let result = validator.validate_pre_deployment(&json!([{"id": 7}]), &mut ctx, &options);
        assert!(result.passed);
        assert!(ctx.baseline_checksum.is_some());
        assert_eq!(ctx.snapshot_name, Some(format!("pre-{}", ctx.deployment_id)));
        assert_eq!(ctx.baseline_stats.as_ref().unwrap().record_count, 1);
    }

    #[test]
    fn anomaly_alone_triggers_rollback() {
        let validator = DeploymentValidator::default();
        let mut ctx = ValidationContext::new(Schema::new());
        let options = DeploymentOptions {
            create_golden_baseline: true,
            verify_checksum: false,
            ..Default::default()
        };
        validator.validate_pre_deployment(&json!([{"v": 10}, {"v": 10}]), &mut ctx, &options);
        let post =
            validator.validate_post_deployment(&json!([{"v": 500}, {"v": 500}]), &ctx, &options);
        assert!(post.passed);
        assert!(post.should_rollback);
    }

    #[test]
    fn required_fields_checked_beyond_schema() {
        let validator = DeploymentValidator::default();
        let mut ctx = ValidationContext::new(Schema::new())
            .with_required_fields(vec!["owner".to_string()]);
        let result = validator.validate_pre_deployment(
            &json!({"id": 1}),
            &mut ctx,
            &DeploymentOptions::default(),
        );
        assert!(!result.passed);
        assert!(result.validations["required_fields"].is_failed());
    }
}
