//! Capability interfaces consumed by the deployment validator.
//!
//! Each capability is a narrow trait so the in-memory implementations used in
//! tests and the production backends are interchangeable.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::anomaly::StatisticalAnomalyDetector;
use super::checksum::Sha256Checksum;
use super::schema::{Schema, SchemaValidator};
use super::snapshot::MemorySnapshotStore;

/// Errors raised by backend capabilities.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed(String),
    Warning(String),
    Skipped,
}

impl CheckOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Result of a pre- or post-deployment validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub validations: BTreeMap<String, CheckOutcome>,
    /// Derived in post-validation; always false before deployment.
    pub should_rollback: bool,
}

impl ValidationResult {
    /// Start an empty, passing result.
    pub fn new() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    /// Record a check outcome, mirroring failures and warnings into the lists.
    pub fn record(&mut self, check: impl Into<String>, outcome: CheckOutcome) {
        let check = check.into();
        match &outcome {
            CheckOutcome::Failed(msg) => {
                self.errors.push(format!("{check}: {msg}"));
                self.passed = false;
            }
            CheckOutcome::Warning(msg) => self.warnings.push(format!("{check}: {msg}")),
            CheckOutcome::Passed | CheckOutcome::Skipped => {}
        }
        self.validations.insert(check, outcome);
    }

    /// Fold another result's errors, warnings and checks into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.passed &= other.passed;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.validations.extend(other.validations);
    }
}

/// Summary statistics of a trusted ("golden") dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub record_count: usize,
    /// Mean of every top-level numeric field.
    pub numeric_means: BTreeMap<String, f64>,
}

/// Per-deployment state shared by the pre and post passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationContext {
    /// Unique per deployment attempt.
    pub deployment_id: Uuid,
    pub schema: Schema,
    /// Business-level fields every record must carry, on top of the schema.
    pub required_fields: Vec<String>,
    pub baseline_checksum: Option<String>,
    pub baseline_stats: Option<BaselineStats>,
    pub snapshot_name: Option<String>,
}

impl ValidationContext {
    pub fn new(schema: Schema) -> Self {
        Self {
            deployment_id: Uuid::new_v4(),
            schema,
            required_fields: Vec::new(),
            baseline_checksum: None,
            baseline_stats: None,
            snapshot_name: None,
        }
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }
}

/// Result of comparing data against a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub matches: bool,
    pub message: String,
}

/// Anomaly detection verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomalous: bool,
    pub findings: Vec<String>,
}

/// Structural validation against a schema.
pub trait Validator: Send + Sync {
    fn validate(&self, data: &Value, schema: &Schema) -> ValidationResult;
}

/// Content checksum.
pub trait ChecksumProvider: Send + Sync {
    fn checksum(&self, data: &Value) -> String;
}

/// Named snapshots of deployment data.
pub trait SnapshotStore: Send + Sync {
    fn snapshot(&self, name: &str, data: &Value) -> BackendResult<()>;

    fn compare(&self, name: &str, data: &Value) -> BackendResult<SnapshotComparison>;
}

/// Baseline statistics and drift detection.
pub trait AnomalyDetector: Send + Sync {
    fn baseline(&self, data: &Value) -> BaselineStats;

    fn detect(&self, baseline: &BaselineStats, data: &Value) -> AnomalyReport;
}

/// The full set of capabilities a validator needs.
#[derive(Clone)]
pub struct ValidationBackend {
    pub validator: Arc<dyn Validator>,
    pub checksum: Arc<dyn ChecksumProvider>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub anomaly: Arc<dyn AnomalyDetector>,
}

impl ValidationBackend {
    /// Schema validator, SHA-256 checksums, in-memory snapshots and the
    /// statistical detector with its default tolerance.
    pub fn in_memory() -> Self {
        Self {
            validator: Arc::new(SchemaValidator),
            checksum: Arc::new(Sha256Checksum),
            snapshots: Arc::new(MemorySnapshotStore::new()),
            anomaly: Arc::new(StatisticalAnomalyDetector::default()),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_anomaly_detector(mut self, anomaly: Arc<dyn AnomalyDetector>) -> Self {
        self.anomaly = anomaly;
        self
    }
}

impl Default for ValidationBackend {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_failure_flips_passed() {
        let mut result = ValidationResult::new();
        result.record("schema", CheckOutcome::Passed);
        assert!(result.passed);
        result.record("checksum", CheckOutcome::Failed("mismatch".to_string()));
        assert!(!result.passed);
        assert_eq!(result.errors, vec!["checksum: mismatch".to_string()]);
    }

    #[test]
    fn contexts_get_unique_ids() {
        let a = ValidationContext::new(Schema::default());
        let b = ValidationContext::new(Schema::default());
        assert_ne!(a.deployment_id, b.deployment_id);
    }
}
