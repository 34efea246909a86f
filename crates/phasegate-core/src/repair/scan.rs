//! Structural defect detection over a pipeline definition.
//!
//! Every detector runs over the whole definition; one defect never hides
//! another.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::PipelineDefinition;

/// Opening marker of an embedded expression.
pub const EXPR_OPEN: &str = "${{";
/// Closing marker of an embedded expression.
pub const EXPR_CLOSE: &str = "}}";

/// A structural defect found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Defect {
    /// `earlier` and `later` depend on each other (ordered by declaration).
    Cycle { earlier: String, later: String },

    /// A cycle longer than two stages; never auto-fixed.
    LongCycle { stages: Vec<String> },

    /// A stage lists itself as a dependency.
    SelfDependency { stage: String },

    /// A single-line free-text field spans several lines.
    MultilineField { stage: String, field: String },

    /// `${{` and `}}` counts differ.
    UnbalancedExpression {
        location: String,
        open: usize,
        close: usize,
    },

    /// A stage has neither a run target nor an execution target.
    MissingTarget { stage: String },

    /// A dependency names a stage that does not exist.
    UnknownDependency { stage: String, dependency: String },
}

impl Defect {
    /// Whether a deterministic fix exists for this defect class.
    pub fn is_fixable(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. } | Self::SelfDependency { .. } | Self::MultilineField { .. }
        )
    }

    /// Short machine-friendly class name.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "cycle",
            Self::LongCycle { .. } => "long_cycle",
            Self::SelfDependency { .. } => "self_dependency",
            Self::MultilineField { .. } => "multiline_field",
            Self::UnbalancedExpression { .. } => "unbalanced_expression",
            Self::MissingTarget { .. } => "missing_target",
            Self::UnknownDependency { .. } => "unknown_dependency",
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { earlier, later } => {
                write!(f, "stages '{earlier}' and '{later}' depend on each other")
            }
            Self::LongCycle { stages } => {
                write!(f, "dependency cycle through {}", stages.join(" -> "))
            }
            Self::SelfDependency { stage } => write!(f, "stage '{stage}' depends on itself"),
            Self::MultilineField { stage, field } => {
                write!(f, "field '{field}' of stage '{stage}' spans multiple lines")
            }
            Self::UnbalancedExpression {
                location,
                open,
                close,
            } => write!(
                f,
                "unbalanced expression delimiters at {location}: {open} '{EXPR_OPEN}' vs {close} '{EXPR_CLOSE}'"
            ),
            Self::MissingTarget { stage } => {
                write!(f, "stage '{stage}' has neither 'run' nor 'uses'")
            }
            Self::UnknownDependency { stage, dependency } => {
                write!(f, "stage '{stage}' depends on unknown stage '{dependency}'")
            }
        }
    }
}

/// Scan `definition` for every defect class.
pub fn scan(definition: &PipelineDefinition) -> Vec<Defect> {
    let mut defects = Vec::new();
    defects.extend(scan_dependencies(definition));
    defects.extend(scan_multiline(definition));
    defects.extend(scan_expressions(definition));
    defects.extend(scan_targets(definition));
    defects
}

fn scan_dependencies(definition: &PipelineDefinition) -> Vec<Defect> {
    let index: HashMap<&str, usize> = definition
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let deps: HashMap<&str, &[String]> = definition
        .stages
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();

    let mut defects = Vec::new();
    let mut seen_pairs: HashSet<(usize, usize)> = HashSet::new();
    let mut seen_long: HashSet<Vec<String>> = HashSet::new();

    for stage in &definition.stages {
        // `depends_on` is a set; a repeated entry is one edge.
        let mut listed: HashSet<&str> = HashSet::new();
        for dep in &stage.depends_on {
            if !listed.insert(dep.as_str()) {
                continue;
            }
            if dep == &stage.id {
                defects.push(Defect::SelfDependency {
                    stage: stage.id.clone(),
                });
                continue;
            }
            let Some(&dep_pos) = index.get(dep.as_str()) else {
                defects.push(Defect::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                });
                continue;
            };

            let stage_pos = index[stage.id.as_str()];
            let back_edge = deps
                .get(dep.as_str())
                .is_some_and(|d| d.iter().any(|x| x == &stage.id));

            if back_edge {
                let key = (stage_pos.min(dep_pos), stage_pos.max(dep_pos));
                if seen_pairs.insert(key) {
                    defects.push(Defect::Cycle {
                        earlier: definition.stages[key.0].id.clone(),
                        later: definition.stages[key.1].id.clone(),
                    });
                }
                continue;
            }

            if let Some(mut path) = find_path(&deps, dep, &stage.id) {
                path.insert(0, stage.id.clone());
                let mut members = path[..path.len() - 1].to_vec();
                members.sort();
                if seen_long.insert(members) {
                    defects.push(Defect::LongCycle { stages: path });
                }
            }
        }
    }

    defects
}

/// Path from `from` to `to` following `depends_on` edges, both ends included.
fn find_path(deps: &HashMap<&str, &[String]>, from: &str, to: &str) -> Option<Vec<String>> {
    fn walk(
        deps: &HashMap<&str, &[String]>,
        current: &str,
        to: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(current.to_string());
        if current == to {
            return true;
        }
        if visited.insert(current.to_string()) {
            for next in deps.get(current).copied().unwrap_or_default() {
                if next != current && walk(deps, next, to, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    let mut visited = HashSet::new();
    let mut path = Vec::new();
    walk(deps, from, to, &mut visited, &mut path).then_some(path)
}

fn has_line_break(value: &str) -> bool {
    value.contains('\n') || value.contains('\r')
}

fn scan_multiline(definition: &PipelineDefinition) -> Vec<Defect> {
    let mut defects = Vec::new();
    for stage in &definition.stages {
        if stage.name.as_deref().is_some_and(has_line_break) {
            defects.push(Defect::MultilineField {
                stage: stage.id.clone(),
                field: "name".to_string(),
            });
        }
        for (key, value) in &stage.annotations {
            if has_line_break(value) {
                defects.push(Defect::MultilineField {
                    stage: stage.id.clone(),
                    field: format!("annotations.{key}"),
                });
            }
        }
    }
    defects
}

fn expression_balance(value: &str) -> (usize, usize) {
    (value.matches(EXPR_OPEN).count(), value.matches(EXPR_CLOSE).count())
}

fn scan_expressions(definition: &PipelineDefinition) -> Vec<Defect> {
    let mut fields: Vec<(String, &str)> = Vec::new();
    for (key, value) in &definition.metadata.env {
        fields.push((format!("metadata.env.{key}"), value));
    }
    for (key, value) in &definition.metadata.extra {
        fields.push((format!("metadata.extra.{key}"), value));
    }
    for stage in &definition.stages {
        let prefix = format!("stages.{}", stage.id);
        if let Some(run) = &stage.run {
            fields.push((format!("{prefix}.run"), run));
        }
        if let Some(uses) = &stage.uses {
            fields.push((format!("{prefix}.uses"), uses));
        }
        for (key, value) in &stage.with {
            fields.push((format!("{prefix}.with.{key}"), value));
        }
        for (key, value) in &stage.annotations {
            fields.push((format!("{prefix}.annotations.{key}"), value));
        }
    }

    fields
        .into_iter()
        .filter_map(|(location, value)| {
            let (open, close) = expression_balance(value);
            (open != close).then_some(Defect::UnbalancedExpression {
                location,
                open,
                close,
            })
        })
        .collect()
}

fn scan_targets(definition: &PipelineDefinition) -> Vec<Defect> {
    definition
        .stages
        .iter()
        .filter(|s| !s.has_target())
        .map(|s| Defect::MissingTarget {
            stage: s.id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageDefinition;

    fn def(stages: Vec<StageDefinition>) -> PipelineDefinition {
        PipelineDefinition::new("t", stages)
    }

    #[test]
    fn clean_definition_has_no_defects() {
        let d = def(vec![
            StageDefinition::command("a", "echo ${{ env.X }}"),
            StageDefinition::command("b", "true").depends_on("a"),
        ]);
        assert!(scan(&d).is_empty());
    }

    #[test]
    fn repeated_dependency_entries_report_once() {
        let mut a = StageDefinition::command("a", "true");
        a.depends_on = vec!["a".into(), "a".into(), "ghost".into(), "ghost".into()];
        assert_eq!(
            scan(&def(vec![a])),
            vec![
                Defect::SelfDependency {
                    stage: "a".to_string()
                },
                Defect::UnknownDependency {
                    stage: "a".to_string(),
                    dependency: "ghost".to_string()
                },
            ]
        );
    }

    #[test]
    fn two_cycle_reported_once_in_declaration_order() {
        let d = def(vec![
            StageDefinition::command("a", "true").depends_on("b"),
            StageDefinition::command("b", "true").depends_on("a"),
        ]);
        assert_eq!(
            scan(&d),
            vec![Defect::Cycle {
                earlier: "a".to_string(),
                later: "b".to_string()
            }]
        );
    }

    #[test]
    fn three_cycle_is_long_cycle() {
        let d = def(vec![
            StageDefinition::command("a", "true").depends_on("c"),
            StageDefinition::command("b", "true").depends_on("a"),
            StageDefinition::command("c", "true").depends_on("b"),
        ]);
        let defects = scan(&d);
        assert_eq!(defects.len(), 1);
        match &defects[0] {
            Defect::LongCycle { stages } => {
                assert_eq!(stages.first(), stages.last());
                assert_eq!(stages.len(), 4);
            }
            other => panic!("unexpected defect {other:?}"),
        }
        assert!(!defects[0].is_fixable());
    }

    #[test]
    fn scan_is_exhaustive() {
        let mut bad = StageDefinition::bare("empty");
        bad.annotations
            .insert("message".to_string(), "line one\nline two".to_string());
        let d = def(vec![
            StageDefinition::command("a", "echo ${{ env.X").depends_on("ghost"),
            bad,
            StageDefinition::command("s", "true").depends_on("s"),
        ]);
        let classes: Vec<&str> = scan(&d).iter().map(Defect::class).collect();
        assert!(classes.contains(&"unknown_dependency"));
        assert!(classes.contains(&"unbalanced_expression"));
        assert!(classes.contains(&"multiline_field"));
        assert!(classes.contains(&"missing_target"));
        assert!(classes.contains(&"self_dependency"));
    }

    #[test]
    fn metadata_expressions_are_checked() {
        let mut d = def(vec![StageDefinition::command("a", "true")]);
        d.metadata
            .env
            .insert("TOKEN".to_string(), "${{ secrets.T }} }}".to_string());
        assert_eq!(
            scan(&d),
            vec![Defect::UnbalancedExpression {
                location: "metadata.env.TOKEN".to_string(),
                open: 1,
                close: 2
            }]
        );
    }

    #[test]
    fn display_names_stages() {
        let d = Defect::Cycle {
            earlier: "build".to_string(),
            later: "test".to_string(),
        };
        let msg = d.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("test"));
    }
}
