//! Domain model shared by every phasegate subsystem.

pub mod clock;
pub mod definition;
pub mod digest;
pub mod run;

pub use clock::{Clock, FixedClock, SystemClock};
pub use definition::{
    PipelineDefinition, PipelineMetadata, StageDefinition, DEFAULT_STAGE_TIMEOUT_SECS,
};
pub use digest::sha256_hex;
pub use run::{
    FailureReason, RunReport, SkipReason, StageRunResult, StageStatus, StageTransition,
};
