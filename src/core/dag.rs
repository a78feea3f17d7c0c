//! Step DAG for the run ledger.
//!
//! Every step the pipeline executes is recorded here with its dependency
//! edges. Data-flow edges connect a step to the steps whose outputs it
//! reads; checkpoint hand-off edges link successive inference steps and
//! must form a single linear chain.

use crate::core::step::{Step, StepId, StepStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Type of dependency between steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The dependent step reads an artifact produced by the dependency.
    #[default]
    DataFlow,
    /// The dependent inference step starts from the checkpoint the
    /// dependency committed (or passed through).
    CheckpointHandoff,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::DataFlow => write!(f, "data"),
            DependencyType::CheckpointHandoff => write!(f, "checkpoint"),
        }
    }
}

/// The step dependency graph of one run.
pub struct StepDAG {
    graph: DiGraph<Step, DependencyType>,
    step_index: HashMap<StepId, NodeIndex>,
}

impl StepDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            step_index: HashMap::new(),
        }
    }

    /// Add a step, returning its id. Adding the same step twice is a no-op.
    pub fn add_step(&mut self, step: Step) -> StepId {
        let id = step.id;
        if self.step_index.contains_key(&id) {
            return id;
        }
        let index = self.graph.add_node(step);
        self.step_index.insert(id, index);
        id
    }

    /// Record that `from` must finish before `to` starts.
    ///
    /// # Errors
    /// Returns an error if either step is unknown or the edge would
    /// create a cycle.
    pub fn add_dependency(
        &mut self,
        from: &StepId,
        to: &StepId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let from_index = *self
            .step_index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in DAG", from)))?;
        let to_index = *self
            .step_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in DAG", to)))?;

        let edge = self.graph.add_edge(from_index, to_index, dep_type);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.step_index.contains_key(id)
    }

    pub fn get_step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        let index = *self.step_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Mark a pending step as running.
    ///
    /// # Errors
    /// Returns an error if the step is unknown or not pending.
    pub fn start(&mut self, id: &StepId) -> Result<()> {
        let step = self
            .get_step_mut(id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in DAG", id)))?;
        if step.status != StepStatus::Pending {
            return Err(Error::InvalidStepTransition {
                from: step.status.to_string(),
                to: StepStatus::Running.to_string(),
            });
        }
        step.start();
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Sorted names of the steps `id` depends on.
    pub fn dependency_names(&self, id: &StepId) -> Vec<String> {
        let Some(&index) = self.step_index.get(id) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n))
            .map(|step| step.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Steps in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Step>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|s| s.name.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at step: {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Follow checkpoint hand-off edges from the chain root.
    ///
    /// # Errors
    /// Returns an error if the hand-off edges branch or have more than one root.
    pub fn checkpoint_chain(&self) -> Result<Vec<&Step>> {
        let handoff = |index: NodeIndex, dir: petgraph::Direction| {
            self.graph
                .edges_directed(index, dir)
                .filter(|e| *e.weight() == DependencyType::CheckpointHandoff)
                .map(move |e| match dir {
                    petgraph::Direction::Outgoing => e.target(),
                    petgraph::Direction::Incoming => e.source(),
                })
                .collect::<Vec<_>>()
        };

        let members: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| {
                !handoff(i, petgraph::Direction::Outgoing).is_empty()
                    || !handoff(i, petgraph::Direction::Incoming).is_empty()
            })
            .collect();
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let roots: Vec<NodeIndex> = members
            .iter()
            .copied()
            .filter(|&i| handoff(i, petgraph::Direction::Incoming).is_empty())
            .collect();
        if roots.len() != 1 {
            return Err(Error::Validation(format!(
                "Checkpoint chain has {} roots",
                roots.len()
            )));
        }

        let mut chain = Vec::with_capacity(members.len());
        let mut current = roots[0];
        loop {
            if let Some(step) = self.graph.node_weight(current) {
                chain.push(step);
            }
            let next = handoff(current, petgraph::Direction::Outgoing);
            match next.as_slice() {
                [] => break,
                [only] => current = *only,
                _ => {
                    return Err(Error::Validation(format!(
                        "Checkpoint chain branches after step {}",
                        chain.last().map(|s| s.name.as_str()).unwrap_or("unknown")
                    )))
                }
            }
        }
        Ok(chain)
    }
}

impl Default for StepDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDAG")
            .field("steps", &self.step_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
