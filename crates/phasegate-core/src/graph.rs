//! Stage dependency graph and topological execution planning.
//!
//! An edge `A → B` means "B depends on A": A must reach a terminal status
//! before B may start. Ordering uses Kahn's algorithm; ties between
//! independent stages are broken by declaration order so plans are
//! reproducible.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::domain::{PipelineDefinition, StageDefinition};

/// Structural pre-condition failures. Execution never starts on any of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("pipeline definition has no stages")]
    Empty,

    #[error("duplicate stage id: {0}")]
    DuplicateStage(String),

    #[error("stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle detected involving stages: {stages:?}")]
    CycleDetected { stages: Vec<String> },
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Validated, acyclic view of a pipeline definition for one run.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    name: String,
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    /// `stage → stages it depends on`, by declaration index.
    upstream: Vec<Vec<usize>>,
    /// `stage → stages depending on it`, by declaration index.
    downstream: Vec<Vec<usize>>,
    order: Vec<usize>,
    depth: Vec<usize>,
}

impl PhaseGraph {
    /// Build the DAG, rejecting empty, inconsistent or cyclic definitions.
    pub fn build(definition: &PipelineDefinition) -> GraphResult<Self> {
        if definition.stages.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::with_capacity(definition.stages.len());
        for (i, stage) in definition.stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStage(stage.id.clone()));
            }
        }

        let n = definition.stages.len();
        let mut upstream = vec![Vec::new(); n];
        let mut downstream = vec![Vec::new(); n];
        for (i, stage) in definition.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !upstream[i].contains(&d) {
                    upstream[i].push(d);
                    downstream[d].push(i);
                }
            }
        }

        let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut depth = vec![0usize; n];

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &downstream[i] {
                depth[d] = depth[d].max(depth[i] + 1);
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() != n {
            let sorted: HashSet<usize> = order.iter().copied().collect();
            let stages = cycle_members(&downstream, &sorted, n)
                .into_iter()
                .map(|i| definition.stages[i].id.clone())
                .collect();
            return Err(GraphError::CycleDetected { stages });
        }

        Ok(Self {
            name: definition.name.clone(),
            stages: definition.stages.clone(),
            index,
            upstream,
            downstream,
            order,
            depth,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Declaration index of `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Stage ids in topological order (dependencies first).
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.stages[i].id.as_str()).collect()
    }

    /// Stage ids grouped by dependency depth; stages in one level are
    /// mutually independent.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let max = self.depth.iter().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max + 1];
        for (i, stage) in self.stages.iter().enumerate() {
            levels[self.depth[i]].push(stage.id.as_str());
        }
        levels
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.upstream)
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.downstream)
    }

    /// Every stage reachable downstream of `id`, in declaration order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &d in &self.downstream[i] {
                if seen.insert(d) {
                    queue.push_back(d);
                }
            }
        }
        seen.into_iter().map(|i| self.stages[i].id.as_str()).collect()
    }

    pub(crate) fn upstream_indices(&self, i: usize) -> &[usize] {
        &self.upstream[i]
    }

    fn neighbours<'a>(&'a self, id: &str, adjacency: &'a [Vec<usize>]) -> Vec<&'a str> {
        self.index
            .get(id)
            .map(|&i| {
                let mut ids: Vec<usize> = adjacency[i].clone();
                ids.sort_unstable();
                ids.into_iter().map(|j| self.stages[j].id.as_str()).collect()
            })
            .unwrap_or_default()
    }
}

/// Unsorted stages minus those that merely sit downstream of a cycle.
fn cycle_members(downstream: &[Vec<usize>], sorted: &HashSet<usize>, n: usize) -> Vec<usize> {
    let mut remaining: BTreeSet<usize> = (0..n).filter(|i| !sorted.contains(i)).collect();
    loop {
        let sinks: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| !downstream[i].iter().any(|d| remaining.contains(d)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for i in sinks {
            remaining.remove(&i);
        }
    }
    remaining.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(stages: Vec<StageDefinition>) -> PipelineDefinition {
        PipelineDefinition::new("ci", stages)
    }

    #[test]
    fn empty_definition_rejected() {
        assert_eq!(PhaseGraph::build(&def(vec![])).unwrap_err(), GraphError::Empty);
    }

    #[test]
    fn order_respects_dependencies_and_declaration() {
        let g = PhaseGraph::build(&def(vec![
            StageDefinition::command("report", "true").depends_on("test"),
            StageDefinition::command("lint", "true"),
            StageDefinition::command("fmt", "true"),
            StageDefinition::command("test", "true").depends_on("lint"),
        ]))
        .unwrap();
        assert_eq!(g.order(), vec!["lint", "fmt", "test", "report"]);
        assert_eq!(
            g.levels(),
            vec![vec!["lint", "fmt"], vec!["test"], vec!["report"]]
        );
    }

    #[test]
    fn cycle_names_only_participants() {
        let err = PhaseGraph::build(&def(vec![
            StageDefinition::command("a", "true").depends_on("b"),
            StageDefinition::command("b", "true").depends_on("a"),
            StageDefinition::command("c", "true").depends_on("b"),
            StageDefinition::command("d", "true"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected {
                stages: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = PhaseGraph::build(&def(vec![
            StageDefinition::command("a", "true").depends_on("ghost")
        ]))
        .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let g = PhaseGraph::build(&def(vec![
            StageDefinition::command("a", "true"),
            StageDefinition::command("b", "true").depends_on("a"),
            StageDefinition::command("c", "true").depends_on("b"),
            StageDefinition::command("d", "true"),
        ]))
        .unwrap();
        assert_eq!(g.transitive_dependents("a"), vec!["b", "c"]);
        assert_eq!(g.dependencies_of("c"), vec!["b"]);
        assert_eq!(g.dependents_of("a"), vec!["b"]);
        assert!(g.transitive_dependents("d").is_empty());
    }
}
