//! Pipeline definitions: the stage list, dependency edges and metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default per-stage timeout when a stage declares none.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

/// One node in the pipeline DAG.
///
/// `run` is the run target (a shell command) and `uses` is the execution
/// target (a named action resolved by the stage runner, e.g. `deploy`). A
/// well-formed stage carries at least one of the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stable identifier, unique within a definition.
    pub id: String,

    /// Human-readable display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Shell command to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Named action to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    /// Inputs handed to the `uses` action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,

    /// Ids of stages that must reach a terminal status first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Failure of a critical stage blocks all of its transitive dependents.
    #[serde(default)]
    pub critical: bool,

    /// Run even when upstream stages failed or were skipped.
    #[serde(default)]
    pub always_run: bool,

    /// Timeout budget in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Free-text single-line fields (commit messages, notes, owners).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl StageDefinition {
    /// Create a stage running a shell command.
    pub fn command(id: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            run: Some(run.into()),
            ..Self::bare(id)
        }
    }

    /// Create a stage executing a named action.
    pub fn action(id: impl Into<String>, uses: impl Into<String>) -> Self {
        Self {
            uses: Some(uses.into()),
            ..Self::bare(id)
        }
    }

    /// Create a stage with neither run nor execution target.
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            run: None,
            uses: None,
            with: BTreeMap::new(),
            depends_on: Vec::new(),
            critical: false,
            always_run: false,
            timeout_secs: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a dependency (ignored if already present).
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Effective timeout budget in seconds.
    pub fn timeout_or(&self, default_secs: u64) -> u64 {
        self.timeout_secs.unwrap_or(default_secs)
    }

    /// Whether the stage names something to execute.
    pub fn has_target(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.run) || present(&self.uses)
    }
}

/// Free-form pipeline metadata (environment bindings and extra keys).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Ordered collection of stages plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identity; at most one run per name executes at a time.
    pub name: String,

    #[serde(default)]
    pub metadata: PipelineMetadata,

    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            metadata: PipelineMetadata::default(),
            stages,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageDefinition> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    /// Declaration index of a stage.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    /// Ids declared more than once, in first-seen order.
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dups = Vec::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) && !dups.contains(&stage.id) {
                dups.push(stage.id.clone());
            }
        }
        dups
    }
}
