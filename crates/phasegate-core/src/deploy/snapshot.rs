//! Snapshot stores: in-memory for tests and a directory of JSON files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use super::backend::{BackendError, BackendResult, SnapshotComparison, SnapshotStore};
use crate::store::write_atomic;

fn compare_values(name: &str, stored: &Value, data: &Value) -> SnapshotComparison {
    if stored == data {
        SnapshotComparison {
            matches: true,
            message: format!("data matches snapshot '{name}'"),
        }
    } else {
        SnapshotComparison {
            matches: false,
            message: format!("data differs from snapshot '{name}'"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Value>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn snapshot(&self, name: &str, data: &Value) -> BackendResult<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), data.clone());
        Ok(())
    }

    fn compare(&self, name: &str, data: &Value) -> BackendResult<SnapshotComparison> {
        let stored = self
            .get(name)
            .ok_or_else(|| BackendError::SnapshotNotFound(name.to_string()))?;
        Ok(compare_values(name, &stored, data))
    }
}

/// Stores each snapshot as `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    dir: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> BackendResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(BackendError::InvalidSnapshotName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn snapshot(&self, name: &str, data: &Value) -> BackendResult<()> {
        let path = self.path_for(name)?;
        let json = serde_json::to_vec_pretty(data)?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    fn compare(&self, name: &str, data: &Value) -> BackendResult<SnapshotComparison> {
        let path = self.path_for(name)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::SnapshotNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let stored: Value = serde_json::from_slice(&bytes)?;
        Ok(compare_values(name, &stored, data))
    }
}
