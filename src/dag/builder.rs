//! Plan integrity checks and the phase dependency graph.
//!
//! [`DagBuilder`] rejects duplicate ids, dangling `depends_on` entries and
//! cycles before anything is dispatched.

use crate::errors::PlanIntegrityError;
use crate::plan::Phase;
use std::collections::{HashMap, HashSet};

/// Position of a phase in declaration order.
pub type PhaseIndex = usize;

/// Validated, acyclic phase dependencies.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    /// Phase ids in declaration order
    ids: Vec<String>,
    index_map: HashMap<String, PhaseIndex>,
    /// phase -> phases waiting on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// phase -> phases it waits on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: PhaseIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    /// Phases listing `index` in their `depends_on`.
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// The phase's `depends_on`, as indices.
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases that wait on nothing.
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        completed: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Group phases into waves; every phase waits only on earlier waves.
    /// Used for display, the scheduler itself runs one phase at a time.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<PhaseIndex> = HashSet::new();

        loop {
            let ready: Vec<PhaseIndex> = (0..self.len())
                .filter(|i| !completed.contains(i) && self.dependencies_satisfied(*i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(ready.into_iter().map(|i| self.ids[i].clone()).collect());
        }

        waves
    }
}

/// Validates a phase list and builds its [`PhaseGraph`].
pub struct DagBuilder<'a> {
    phases: &'a [Phase],
}

impl<'a> DagBuilder<'a> {
    pub fn new(phases: &'a [Phase]) -> Self {
        Self { phases }
    }

    /// Checks run in order: duplicate phase ids, duplicate subtask ids,
    /// unknown dependencies, cycles. The first problem found is returned.
    pub fn build(self) -> Result<PhaseGraph, PlanIntegrityError> {
        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.insert(phase.id.clone(), i).is_some() {
                return Err(PlanIntegrityError::DuplicatePhase(phase.id.clone()));
            }
        }

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for phase in self.phases {
            for subtask in &phase.subtasks {
                if let Some(first) = owners.insert(subtask.id.as_str(), phase.id.as_str()) {
                    return Err(PlanIntegrityError::DuplicateSubtask {
                        subtask: subtask.id.clone(),
                        first: first.to_string(),
                        second: phase.id.clone(),
                    });
                }
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    PlanIntegrityError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            ids: self.phases.iter().map(|p| p.id.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm. Phases never reaching in-degree 0 are on (or behind) a cycle.
    fn validate_no_cycles(graph: &PhaseGraph) -> Result<(), PlanIntegrityError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue = graph.root_phases();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let phases: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.id(i).map(String::from))
                .collect();

            return Err(PlanIntegrityError::Cycle { phases });
        }

        Ok(())
    }
}
