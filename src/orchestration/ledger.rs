//! Shared handle to the run's step DAG.

use crate::core::dag::{DependencyType, StepDAG};
use crate::core::step::{Step, StepId};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cloneable handle used by the assembler, the threader and spawned
/// encoding tasks to record step lifecycles.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    dag: Arc<RwLock<StepDAG>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step with its dependencies and mark it running.
    ///
    /// # Errors
    /// Returns an error without touching the DAG if a dependency is unknown.
    pub async fn open(&self, step: Step, deps: &[(StepId, DependencyType)]) -> Result<StepId> {
        let mut dag = self.dag.write().await;
        if let Some((missing, _)) = deps.iter().find(|(from, _)| !dag.contains(from)) {
            return Err(Error::Validation(format!("Step {} not found in DAG", missing)));
        }
        let id = dag.add_step(step);
        for (from, dep_type) in deps {
            dag.add_dependency(from, &id, *dep_type)?;
        }
        dag.start(&id)?;
        Ok(id)
    }

    // A step's first recorded ending wins.
    pub async fn complete(&self, id: &StepId, attempts: u32) {
        let mut dag = self.dag.write().await;
        if let Some(step) = dag.get_step_mut(id).filter(|s| !s.is_finished()) {
            step.complete(attempts);
        }
    }

    pub async fn skip(&self, id: &StepId, reason: &str, attempts: u32) {
        let mut dag = self.dag.write().await;
        if let Some(step) = dag.get_step_mut(id).filter(|s| !s.is_finished()) {
            step.skip(reason, attempts);
        }
    }

    pub async fn fail(&self, id: &StepId, error: &str, attempts: u32) {
        let mut dag = self.dag.write().await;
        if let Some(step) = dag.get_step_mut(id).filter(|s| !s.is_finished()) {
            step.fail(error, attempts);
        }
    }

    /// All steps in dependency order, each naming what it depended on.
    pub async fn snapshot(&self) -> Result<Vec<Step>> {
        let dag = self.dag.read().await;
        Ok(dag
            .topological_order()?
            .into_iter()
            .map(|step| {
                let mut step = step.clone();
                step.depends_on = dag.dependency_names(&step.id);
                step
            })
            .collect())
    }

    /// Inference steps along the checkpoint hand-off chain.
    pub async fn checkpoint_chain(&self) -> Result<Vec<Step>> {
        let dag = self.dag.read().await;
        Ok(dag.checkpoint_chain()?.into_iter().cloned().collect())
    }
}
