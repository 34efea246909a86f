//! Circuit-breaker-bounded self-repair of pipeline definitions.
//!
//! One [`RepairEngine::repair`] invocation runs four steps:
//! 1. count check against the persisted [`RepairAttemptRecord`]
//!    (reset after the window, block once `max_attempts` is reached)
//! 2. exhaustive defect scan
//! 3. deterministic fixes applied to a copy of the definition
//! 4. a report listing every defect that was not auto-fixed
//!
//! The attempt store stays locked for the whole invocation.

pub mod scan;

use std::sync::{Arc, OnceLock};

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Clock, PipelineDefinition, SystemClock};
use crate::obs;
use crate::store::{AttemptStore, RepairAttemptRecord, StoreError};

pub use scan::{scan, Defect, EXPR_CLOSE, EXPR_OPEN};

/// Errors from a repair invocation.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair attempt store: {0}")]
    Store(#[from] StoreError),
}

pub type RepairResult<T> = std::result::Result<T, RepairError>;

/// Which edge of a two-stage cycle to drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleBreakPolicy {
    /// Remove the earlier-declared stage's dependency on the later one, so the
    /// earlier stage stays the prerequisite.
    #[default]
    DropEarlierDependency,
    /// Remove the later-declared stage's dependency on the earlier one.
    DropLaterDependency,
}

/// Bounds on automatic repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPolicy {
    /// Attempts allowed inside one window before the breaker opens.
    pub max_attempts: u32,
    /// Idle time after which the attempt counter resets, in seconds.
    pub reset_window_secs: u64,
    pub cycle_break: CycleBreakPolicy,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reset_window_secs: 3600,
            cycle_break: CycleBreakPolicy::default(),
        }
    }
}

impl RepairPolicy {
    pub fn reset_window(&self) -> Duration {
        Duration::seconds(self.reset_window_secs.min(i64::MAX as u64) as i64)
    }
}

/// Terminal state of one repair invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RepairStatus {
    /// Nothing to repair.
    Clean,
    /// Every defect was fixed.
    Repaired,
    /// Some defects need manual intervention (others may have been fixed).
    Unresolved,
    /// The circuit breaker is open; nothing was attempted.
    Blocked { attempts: u32 },
}

/// A fix that was applied to the definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub defect: Defect,
    pub action: String,
}

/// Outcome of a repair invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub status: RepairStatus,
    /// Whether `definition` differs from the input.
    pub changed: bool,
    /// The repaired copy (or the untouched input).
    pub definition: PipelineDefinition,
    pub fixed: Vec<AppliedFix>,
    pub unresolved: Vec<Defect>,
    /// Attempt counter after this invocation.
    pub attempt: u32,
}

impl RepairReport {
    pub fn is_blocked(&self) -> bool {
        matches!(self.status, RepairStatus::Blocked { .. })
    }
}

/// Detects and fixes structural defects, bounded by a persisted circuit breaker.
#[derive(Clone)]
pub struct RepairEngine {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    policy: RepairPolicy,
}

impl RepairEngine {
    pub fn new(store: Arc<dyn AttemptStore>, policy: RepairPolicy) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.policy
    }

    /// Run one repair invocation against `definition`.
    pub fn repair(&self, definition: &PipelineDefinition) -> RepairResult<RepairReport> {
        let _span = obs::RepairSpan::enter(&definition.name);
        let mut guard = self.store.lock()?;
        let now = self.clock.now();

        // CountCheck
        let mut record = guard
            .load()?
            .unwrap_or_else(|| RepairAttemptRecord::new(0, now));
        if now - record.last_attempt > self.policy.reset_window() {
            debug!(previous = record.count, "repair window elapsed; resetting attempt counter");
            record.count = 0;
        }

        // Scan
        let defects = scan(definition);

        if record.count >= self.policy.max_attempts {
            obs::emit_circuit_open(&definition.name, record.count, defects.len());
            return Ok(RepairReport {
                status: RepairStatus::Blocked {
                    attempts: record.count,
                },
                changed: false,
                definition: definition.clone(),
                fixed: Vec::new(),
                unresolved: defects,
                attempt: record.count,
            });
        }

        if defects.is_empty() {
            guard.store(&RepairAttemptRecord::new(0, now))?;
            obs::emit_repair_evaluated(&definition.name, "clean", 0, 0, 0);
            return Ok(RepairReport {
                status: RepairStatus::Clean,
                changed: false,
                definition: definition.clone(),
                fixed: Vec::new(),
                unresolved: Vec::new(),
                attempt: 0,
            });
        }

        // Apply
        let (repaired, fixed, unresolved) = apply_fixes(definition, defects, self.policy.cycle_break);
        record.count += 1;
        record.last_attempt = now;
        guard.store(&record)?;

        let changed = repaired != *definition;
        let status = if unresolved.is_empty() {
            RepairStatus::Repaired
        } else {
            RepairStatus::Unresolved
        };

        for fix in &fixed {
            info!(pipeline = %definition.name, defect = %fix.defect, action = %fix.action, "applied repair");
        }
        obs::emit_repair_evaluated(
            &definition.name,
            if status == RepairStatus::Repaired {
                "repaired"
            } else {
                "unresolved"
            },
            fixed.len(),
            unresolved.len(),
            record.count,
        );

        Ok(RepairReport {
            status,
            changed,
            definition: repaired,
            fixed,
            unresolved,
            attempt: record.count,
        })
    }
}

/// Apply every deterministic fix to a copy of `definition`.
///
/// Returns the repaired copy, the fixes applied and the defects left over.
pub fn apply_fixes(
    definition: &PipelineDefinition,
    defects: Vec<Defect>,
    policy: CycleBreakPolicy,
) -> (PipelineDefinition, Vec<AppliedFix>, Vec<Defect>) {
    let mut repaired = definition.clone();
    let mut fixed = Vec::new();
    let mut unresolved = Vec::new();

    for defect in defects {
        let action = match &defect {
            Defect::Cycle { earlier, later } => {
                let (owner, edge) = match policy {
                    CycleBreakPolicy::DropEarlierDependency => (earlier, later),
                    CycleBreakPolicy::DropLaterDependency => (later, earlier),
                };
                remove_dependency(&mut repaired, owner, edge)
                    .then(|| format!("removed dependency '{owner}' -> '{edge}'"))
            }
            Defect::SelfDependency { stage } => remove_dependency(&mut repaired, stage, stage)
                .then(|| format!("removed self-dependency of '{stage}'")),
            Defect::MultilineField { stage, field } => flatten_field(&mut repaired, stage, field)
                .then(|| format!("flattened '{field}' of '{stage}' to one line")),
            _ => None,
        };

        match action {
            Some(action) => fixed.push(AppliedFix { defect, action }),
            None => unresolved.push(defect),
        }
    }

    (repaired, fixed, unresolved)
}

fn remove_dependency(definition: &mut PipelineDefinition, stage: &str, dependency: &str) -> bool {
    match definition.stage_mut(stage) {
        Some(s) => {
            let before = s.depends_on.len();
            s.depends_on.retain(|d| d != dependency);
            s.depends_on.len() != before
        }
        None => false,
    }
}

/// Collapse line breaks (and the whitespace around them) into single spaces.
pub fn flatten_lines(value: &str) -> String {
    static BREAKS: OnceLock<Regex> = OnceLock::new();
    let breaks = BREAKS.get_or_init(|| Regex::new(r"[ \t]*[\r\n]+[ \t]*").expect("static regex"));
    breaks.replace_all(value.trim(), " ").into_owned()
}

fn flatten_field(definition: &mut PipelineDefinition, stage: &str, field: &str) -> bool {
    let Some(s) = definition.stage_mut(stage) else {
        return false;
    };
    let slot = if field == "name" {
        s.name.as_mut()
    } else {
        field
            .strip_prefix("annotations.")
            .and_then(|key| s.annotations.get_mut(key))
    };
    match slot {
        Some(value) => {
            *value = flatten_lines(value);
            true
        }
        None => false,
    }
}
