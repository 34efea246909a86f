use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use phasegate_core::deploy::{FieldType, FsSnapshotStore};
use phasegate_core::{
    DeploymentAction, DeploymentOptions, DeploymentPhase, DeploymentValidator, RollbackAction,
    Schema, ValidationBackend, ValidationContext,
};
use serde_json::{json, Value};
use tempfile::tempdir;

/// Deploys by applying `transform` to the input and counts invocations.
struct Transform {
    calls: AtomicUsize,
    transform: fn(&Value) -> Value,
}

impl Transform {
    fn new(transform: fn(&Value) -> Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            transform,
        }
    }

    fn identity() -> Self {
        Self::new(Value::clone)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentAction for Transform {
    async fn deploy(&self, data: &Value, _ctx: &ValidationContext) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.transform)(data))
    }
}

struct Rollback {
    calls: AtomicUsize,
    fail: bool,
}

impl Rollback {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RollbackAction for Rollback {
    async fn rollback(&self, _ctx: &ValidationContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("restore script exited 1");
        }
        Ok(())
    }
}

fn schema() -> Schema {
    Schema::new()
        .require("id", FieldType::Integer)
        .require("email", FieldType::String)
}

fn dataset() -> Value {
    json!([
        {"id": 1, "email": "a@example.com", "amount": 10.0},
        {"id": 2, "email": "b@example.com", "amount": 12.0},
    ])
}

#[tokio::test]
async fn failed_pre_validation_never_deploys() {
    let action = Transform::identity();
    let rollback = Rollback::ok();
    let summary = DeploymentValidator::default()
        .deploy_with_validation(
            &json!([{"id": 1}]),
            schema(),
            &action,
            &rollback,
            &DeploymentOptions::default(),
        )
        .await;

    assert!(!summary.success);
    assert_eq!(summary.phase, DeploymentPhase::PreFailed);
    assert_eq!(
        summary.phases,
        vec![
            DeploymentPhase::Idle,
            DeploymentPhase::PreValidating,
            DeploymentPhase::PreFailed
        ]
    );
    assert_eq!(action.calls(), 0);
    assert_eq!(rollback.calls(), 0);
    assert!(summary.post.is_none());
}

#[tokio::test]
async fn checksum_mismatch_rolls_back_once() {
    let action = Transform::new(|data| {
        let mut out = data.clone();
        out[0]["email"] = json!("changed@example.com");
        out
    });
    let rollback = Rollback::ok();
    let summary = DeploymentValidator::default()
        .deploy_with_validation(
            &dataset(),
            schema(),
            &action,
            &rollback,
            &DeploymentOptions::default(),
        )
        .await;

    assert_eq!(action.calls(), 1);
    assert_eq!(rollback.calls(), 1);
    assert!(summary.rolled_back);
    assert_eq!(summary.phase, DeploymentPhase::RolledBack);
    let post = summary.post.unwrap();
    assert!(post.should_rollback);
    assert!(post.validations["checksum"].is_failed());
}

#[tokio::test]
async fn rollback_failure_is_reported_not_retried() {
    let action = Transform::new(|_| json!([]));
    let rollback = Rollback::failing();
    let summary = DeploymentValidator::default()
        .deploy_with_validation(
            &dataset(),
            schema(),
            &action,
            &rollback,
            &DeploymentOptions::default(),
        )
        .await;

    assert_eq!(rollback.calls(), 1);
    assert!(summary.rolled_back);
    assert!(summary
        .rollback_error
        .as_deref()
        .unwrap()
        .contains("restore script exited 1"));
    assert!(!summary.success);
}

#[tokio::test]
async fn golden_baseline_drift_triggers_rollback() {
    let action = Transform::new(|data| {
        let mut out = data.clone();
        for row in out.as_array_mut().unwrap() {
            row["amount"] = json!(1000.0);
        }
        out
    });
    let rollback = Rollback::ok();
    let options = DeploymentOptions {
        create_golden_baseline: true,
        verify_checksum: false,
        ..Default::default()
    };
    let summary = DeploymentValidator::default()
        .deploy_with_validation(&dataset(), schema(), &action, &rollback, &options)
        .await;

    let post = summary.post.unwrap();
    assert!(post.passed);
    assert!(post.should_rollback);
    assert_eq!(rollback.calls(), 1);
}

#[tokio::test]
async fn snapshot_verification_against_fs_store() {
    let dir = tempdir().unwrap();
    let backend =
        ValidationBackend::in_memory().with_snapshots(Arc::new(FsSnapshotStore::new(dir.path())));
    let validator = DeploymentValidator::new(backend);
    let options = DeploymentOptions {
        create_snapshot: true,
        verify_snapshot: true,
        ..Default::default()
    };
    let action = Transform::identity();
    let rollback = Rollback::ok();

    let summary = validator
        .deploy_with_validation(&dataset(), schema(), &action, &rollback, &options)
        .await;

    assert!(summary.success, "{:?}", summary.post);
    assert_eq!(summary.phase, DeploymentPhase::Complete);
    let snapshot = dir
        .path()
        .join(format!("pre-{}.json", summary.deployment_id));
    assert!(snapshot.exists());
    assert_eq!(rollback.calls(), 0);
}
