//! Persistence for pipeline definitions and the repair attempt record.
//!
//! Both stores write atomically (temp file in the target directory, then
//! rename) so a crashed writer never leaves a half-written document behind.

pub mod attempts;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::domain::PipelineDefinition;

pub use attempts::{
    AttemptGuard, AttemptStore, FileAttemptStore, MemoryAttemptStore, RepairAttemptRecord,
};

/// Errors from definition and attempt-record persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate stage id in definition: {0}")]
    DuplicateStage(String),

    #[error("definition not found: {0}")]
    NotFound(PathBuf),

    #[error("could not lock {path} within {waited_ms}ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Loads and saves the structured pipeline definition.
pub trait DefinitionStore: Send + Sync {
    fn load(&self) -> StoreResult<PipelineDefinition>;

    fn save(&self, definition: &PipelineDefinition) -> StoreResult<()>;
}

/// Serialization format of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// YAML for `.yml` / `.yaml`, JSON for anything else.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }

    pub fn parse(&self, text: &str) -> StoreResult<PipelineDefinition> {
        let definition: PipelineDefinition = match self {
            Self::Yaml => serde_yaml::from_str(text)?,
            Self::Json => serde_json::from_str(text)?,
        };
        reject_duplicates(&definition)?;
        Ok(definition)
    }

    pub fn render(&self, definition: &PipelineDefinition) -> StoreResult<String> {
        Ok(match self {
            Self::Yaml => serde_yaml::to_string(definition)?,
            Self::Json => {
                let mut out = serde_json::to_string_pretty(definition)?;
                out.push('\n');
                out
            }
        })
    }
}

fn reject_duplicates(definition: &PipelineDefinition) -> StoreResult<()> {
    match definition.duplicate_ids().into_iter().next() {
        Some(id) => Err(StoreError::DuplicateStage(id)),
        None => Ok(()),
    }
}

/// Write `contents` to `path` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// File-backed definition store; saves in the format it was loaded from.
#[derive(Debug, Clone)]
pub struct FileDefinitionStore {
    path: PathBuf,
    format: DefinitionFormat,
}

impl FileDefinitionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = DefinitionFormat::from_path(&path);
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DefinitionFormat {
        self.format
    }
}

impl DefinitionStore for FileDefinitionStore {
    fn load(&self) -> StoreResult<PipelineDefinition> {
        debug!(path = %self.path.display(), "loading pipeline definition");
        let text = fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(self.path.clone())
            } else {
                StoreError::Io(e)
            }
        })?;
        self.format.parse(&text)
    }

    fn save(&self, definition: &PipelineDefinition) -> StoreResult<()> {
        debug!(path = %self.path.display(), stages = definition.stages.len(), "saving pipeline definition");
        let text = self.format.render(definition)?;
        write_atomic(&self.path, text.as_bytes())
    }
}

/// In-memory definition store for tests and embedding.
#[derive(Debug)]
pub struct MemoryDefinitionStore {
    inner: Mutex<(PipelineDefinition, usize)>,
}

impl MemoryDefinitionStore {
    pub fn new(definition: PipelineDefinition) -> Self {
        Self {
            inner: Mutex::new((definition, 0)),
        }
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1
    }

    pub fn current(&self) -> PipelineDefinition {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0.clone()
    }
}

impl DefinitionStore for MemoryDefinitionStore {
    fn load(&self) -> StoreResult<PipelineDefinition> {
        let definition = self.current();
        reject_duplicates(&definition)?;
        Ok(definition)
    }

    fn save(&self, definition: &PipelineDefinition) -> StoreResult<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 = definition.clone();
        guard.1 += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageDefinition;

    fn sample() -> PipelineDefinition {
        let mut def = PipelineDefinition::new(
            "ci",
            vec![
                StageDefinition::command("lint", "cargo clippy").critical(),
                StageDefinition::command("test", "cargo test").depends_on("lint"),
                StageDefinition::action("deploy", "deploy")
                    .depends_on("test")
                    .with_input("input", "data.json"),
            ],
        );
        def.metadata
            .env
            .insert("RUST_LOG".to_string(), "info".to_string());
        def
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            DefinitionFormat::from_path(Path::new("ci.yml")),
            DefinitionFormat::Yaml
        );
        assert_eq!(
            DefinitionFormat::from_path(Path::new("ci.YAML")),
            DefinitionFormat::Yaml
        );
        assert_eq!(
            DefinitionFormat::from_path(Path::new("ci.json")),
            DefinitionFormat::Json
        );
    }

    #[test]
    fn yaml_file_persists_in_same_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yml");
        let store = FileDefinitionStore::new(&path);

        store.save(&sample()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("depends_on"));
        assert!(!text.trim_start().starts_with('{'));

        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn json_file_persists_in_same_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let store = FileDefinitionStore::new(&path);

        store.save(&sample()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.trim_start().starts_with('{'));
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDefinitionStore::new(dir.path().join("absent.yml"));
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_stage_ids_rejected_on_load() {
        let yaml = "name: ci\nstages:\n  - id: a\n    run: 'true'\n  - id: a\n    run: 'false'\n";
        let err = DefinitionFormat::Yaml.parse(yaml).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStage(ref id) if id == "a"));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryDefinitionStore::new(sample());
        assert_eq!(store.save_count(), 0);
        let mut def = store.load().unwrap();
        def.stages.pop();
        store.save(&def).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.current().stages.len(), 2);
    }
}
