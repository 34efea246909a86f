//! Run report artifacts with digest verification.
//!
//! Layout: `<dir>/<run_id>/report.json` plus `<dir>/<run_id>/report.digest`
//! holding the hex SHA-256 of the JSON bytes.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::{sha256_hex, RunReport};
use crate::store::StoreError;

/// Errors reading or writing report artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

/// Persist `report` and its digest; returns the path of `report.json`.
pub fn write_run_report(report: &RunReport, dir: &Path) -> ArtifactResult<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    std::fs::create_dir_all(&run_dir)?;

    let artifact_path = run_dir.join("report.json");
    let json = serde_json::to_vec_pretty(report)?;
    let digest = sha256_hex(&json);

    crate::store::write_atomic(&artifact_path, &json)?;
    crate::store::write_atomic(&run_dir.join("report.digest"), digest.as_bytes())?;

    Ok(artifact_path)
}

/// Read `<dir>/<run_id>/report.json`, verifying it against its digest.
pub fn read_run_report(run_id: &str, dir: &Path) -> ArtifactResult<RunReport> {
    let run_dir = dir.join(run_id);
    let json = std::fs::read(run_dir.join("report.json"))?;
    let expected = std::fs::read_to_string(run_dir.join("report.digest"))?;
    let actual = sha256_hex(&json);
    if expected.trim() != actual {
        return Err(ArtifactError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StageRunResult, StageStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn report() -> RunReport {
        let mut lint = StageRunResult::pending("lint");
        lint.status = StageStatus::Passed;
        lint.output_summary = "clean".to_string();
        RunReport {
            run_id: Uuid::new_v4(),
            pipeline: "ci".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results: vec![lint],
            timeline: Vec::new(),
            cancelled: false,
        }
    }

    #[test]
    fn written_report_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let report = report();
        let path = write_run_report(&report, dir.path()).unwrap();
        assert!(path.ends_with("report.json"));

        let back = read_run_report(&report.run_id.to_string(), dir.path()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn tampered_report_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let report = report();
        let path = write_run_report(&report, dir.path()).unwrap();
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("clean", "dirty");
        std::fs::write(&path, tampered).unwrap();

        let err = read_run_report(&report.run_id.to_string(), dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::DigestMismatch { .. }));
    }
}
