//! PhaseGate Core Library
//!
//! Pipeline definitions, self-repair with a circuit breaker, dependency-ordered
//! stage execution, and validated deployments with rollback.

pub mod deploy;
pub mod domain;
pub mod executor;
pub mod fakes;
pub mod graph;
pub mod obs;
pub mod repair;
pub mod reporting;
pub mod store;
pub mod telemetry;

pub use domain::{
    sha256_hex, Clock, FailureReason, FixedClock, PipelineDefinition, PipelineMetadata, RunReport,
    SkipReason, StageDefinition, StageRunResult, StageStatus, StageTransition, SystemClock,
    DEFAULT_STAGE_TIMEOUT_SECS,
};

pub use store::{
    AttemptGuard, AttemptStore, DefinitionFormat, DefinitionStore, FileAttemptStore,
    FileDefinitionStore, MemoryAttemptStore, MemoryDefinitionStore, RepairAttemptRecord,
    StoreError, StoreResult,
};

pub use repair::{
    apply_fixes, scan, AppliedFix, CycleBreakPolicy, Defect, RepairEngine, RepairError,
    RepairPolicy, RepairReport, RepairResult, RepairStatus,
};

pub use graph::{GraphError, GraphResult, PhaseGraph};

pub use executor::{
    CancelHandle, CancelSignal, ExecuteOptions, ExecutorError, ExecutorResult, PhaseExecutor,
    StageOutput, StageRunner,
};

pub use deploy::{
    CustomCheck, DeployError, DeploymentAction, DeploymentOptions, DeploymentPhase,
    DeploymentSummary, DeploymentValidator, NoopRollback, RollbackAction, Schema,
    ValidationBackend, ValidationContext, ValidationResult,
};

pub use reporting::{read_run_report, write_run_report, ArtifactError, ArtifactResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
