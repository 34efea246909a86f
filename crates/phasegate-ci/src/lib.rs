//! PhaseGate CI - pipeline execution on the local machine
//!
//! Provides the collaborators that turn the core engine into a CI runner:
//! - Shell-backed stage runners and action routing
//! - The `deploy` stage, wrapping deployments in pre/post validation
//! - End-to-end orchestration (repair, plan, execute) and gate evaluation

pub mod deploy_stage;
pub mod gate;
pub mod pipeline;
pub mod runner;

// Re-export key types
pub use deploy_stage::{DeployStageRunner, ShellDeploymentAction, ShellRollbackAction, DEPLOY_ACTION};
pub use gate::{CiGate, GateVerdict};
pub use pipeline::{CiPipeline, PipelineConfig, PipelineError, PipelineResult};
pub use runner::{RoutingRunner, ShellConfig, ShellRunner, CANCELLED_EXIT_CODE};
