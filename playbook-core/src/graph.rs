//! Playbook DAG validation and the adjacency structure the orchestrator
//! computes readiness against.
//!
//! Validation happens once, at run initialization; the graph is never
//! mutated afterwards, so no cycle detection is needed mid-run.

use crate::error::{EngineError, EngineResult};
use crate::types::{Playbook, StepId};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Validated, topologically-consistent view of a playbook's step DAG.
#[derive(Clone, Debug)]
pub struct StepGraph {
    /// Step ids in a valid topological order (dependencies first).
    topo_order: Vec<StepId>,
    predecessors: BTreeMap<StepId, Vec<StepId>>,
    successors: BTreeMap<StepId, Vec<StepId>>,
}

impl StepGraph {
    /// Validate a playbook and build its adjacency structure.
    ///
    /// Checks, in order: id uniqueness, resolvable `depends_on_steps`
    /// references, no self-dependency, acyclicity. All failures are fatal
    /// to starting a run and never surface mid-run.
    pub fn build(playbook: &Playbook) -> EngineResult<Self> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &playbook.steps {
            if !seen.insert(&step.id) {
                return Err(EngineError::GraphInvalid(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &playbook.steps {
            for dep in &step.depends_on_steps {
                if dep == &step.id {
                    return Err(EngineError::GraphCyclic {
                        cycle: vec![step.id.clone(), step.id.clone()],
                    });
                }
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::GraphInvalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        // Arena graph: edge dep → step (dependency points at dependent).
        let mut graph: DiGraph<StepId, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for step in &playbook.steps {
            index.insert(&step.id, graph.add_node(step.id.clone()));
        }
        for step in &playbook.steps {
            for dep in &step.depends_on_steps {
                graph.add_edge(index[dep.as_str()], index[step.id.as_str()], ());
            }
        }

        let topo = petgraph::algo::toposort(&graph, None).map_err(|_| EngineError::GraphCyclic {
            cycle: find_cycle(playbook).unwrap_or_default(),
        })?;

        let mut predecessors: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
        let mut successors: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
        for step in &playbook.steps {
            predecessors.insert(step.id.clone(), step.depends_on_steps.clone());
            successors.entry(step.id.clone()).or_default();
        }
        for step in &playbook.steps {
            for dep in &step.depends_on_steps {
                successors
                    .get_mut(dep)
                    .expect("dependency resolved above")
                    .push(step.id.clone());
            }
        }

        Ok(Self {
            topo_order: topo.into_iter().map(|ix| graph[ix].clone()).collect(),
            predecessors,
            successors,
        })
    }

    pub fn topo_order(&self) -> &[StepId] {
        &self.topo_order
    }

    /// Direct predecessors (the step's `depends_on_steps`).
    pub fn predecessors(&self, id: &str) -> &[StepId] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct successors: steps that may become ready when `id` lands.
    pub fn successors(&self, id: &str) -> &[StepId] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Depth-first search with an explicit recursion stack, reporting the
/// offending cycle as a step-id path (first id repeated at the end).
fn find_cycle(playbook: &Playbook) -> Option<Vec<StepId>> {
    let deps: HashMap<&str, &[StepId]> = playbook
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on_steps.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: Vec<&str> = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [StepId]>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<StepId>> {
        if let Some(pos) = on_stack.iter().position(|n| *n == node) {
            let mut cycle: Vec<StepId> = on_stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }
        on_stack.push(node);
        for dep in deps.get(node).copied().unwrap_or(&[]) {
            if let Some(cycle) = dfs(dep, deps, visited, on_stack) {
                return Some(cycle);
            }
        }
        on_stack.pop();
        None
    }

    for step in &playbook.steps {
        if let Some(cycle) = dfs(&step.id, &deps, &mut visited, &mut on_stack) {
            return Some(cycle);
        }
        on_stack.clear();
    }
    None
}
