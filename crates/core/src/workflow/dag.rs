use super::registry::StepRegistry;
use super::step::StepDefinition;
use crate::error::{TransitionError, TransitionResult};
use crate::types::StepId;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Execution plan: the selected steps as a DAG over their `run_after` edges
pub struct StepPlan {
    graph: DiGraph<Arc<StepDefinition>, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl StepPlan {
    /// Build a plan for a selection of registered steps.
    ///
    /// Only `run_after` edges between selected steps are enforced. Steps
    /// without an ordering constraint keep their registration order.
    pub fn build(registry: &StepRegistry, selected: &[StepId]) -> TransitionResult<Self> {
        let mut steps = Vec::new();
        for id in selected {
            let step = registry.get(id)?;
            if !steps.iter().any(|s: &Arc<StepDefinition>| s.id == step.id) {
                steps.push(step);
            }
        }
        // Node indices follow registration order so ties break on them
        steps.sort_by_key(|s| registry.position(&s.id));

        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();
        for step in steps {
            let id = step.id.clone();
            let node = graph.add_node(step);
            step_indices.insert(id, node);
        }

        // Edge from predecessor to successor (dep -> step)
        let mut edges = Vec::new();
        for node in graph.node_indices() {
            for dep in &graph[node].run_after {
                if let Some(&dep_idx) = step_indices.get(dep) {
                    edges.push((dep_idx, node));
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        if let Some(cycle) = find_cycle(&graph) {
            tracing::error!(cycle = ?cycle, "step selection contains a dependency cycle");
            return Err(TransitionError::CyclicDependency { cycle });
        }

        let order = ordered_nodes(&graph);

        Ok(Self {
            graph,
            step_indices,
            order,
        })
    }

    /// Steps in execution order (dependencies first)
    pub fn steps(&self) -> Vec<Arc<StepDefinition>> {
        self.order.iter().map(|&n| self.graph[n].clone()).collect()
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.order.iter().map(|&n| self.graph[n].id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Selected predecessors of a step
    pub fn dependencies(&self, step_id: &StepId) -> TransitionResult<Vec<StepId>> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Selected steps that wait for the given step
    pub fn dependents(&self, step_id: &StepId) -> TransitionResult<Vec<StepId>> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    fn neighbors(&self, step_id: &StepId, direction: Direction) -> TransitionResult<Vec<StepId>> {
        let node = self
            .step_indices
            .get(step_id)
            .ok_or_else(|| TransitionError::UnknownStep(step_id.clone()))?;

        let mut ids: Vec<(NodeIndex, StepId)> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| (n, self.graph[n].id.clone()))
            .collect();
        ids.sort_by_key(|(n, _)| *n);
        ids.dedup_by_key(|(n, _)| *n);

        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

/// Steps of the first strongly connected component that forms a cycle
fn find_cycle(graph: &DiGraph<Arc<StepDefinition>, ()>) -> Option<Vec<StepId>> {
    let mut components = tarjan_scc(graph);
    components.iter_mut().for_each(|c| c.sort());
    components.sort();

    components
        .into_iter()
        .find(|component| {
            component.len() > 1
                || graph.contains_edge(component[0], component[0])
        })
        .map(|component| {
            component
                .into_iter()
                .map(|n| graph[n].id.clone())
                .collect()
        })
}

/// Kahn's algorithm, always releasing the lowest ready node index first
fn ordered_nodes(graph: &DiGraph<Arc<StepDefinition>, ()>) -> Vec<NodeIndex> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BTreeSet<NodeIndex> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&n, _)| n)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    order
}
