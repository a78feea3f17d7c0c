//! Core domain models for the tree-building pipeline.
//!
//! Artifacts flowing between steps, runnable tool tasks with their
//! resource and failure policies, and the step DAG that records a run.

pub mod artifact;
pub mod dag;
pub mod step;
pub mod task;

pub use artifact::{ArtifactNamer, Batch, Checkpoint, DiffFile, SequenceSet, Tree};
pub use dag::{DependencyType, StepDAG};
pub use step::{Step, StepId, StepStatus};
pub use task::{
    AttemptOutcome, CommandTemplate, Decision, FailureKind, FailurePolicy, ResourcePolicy, Task,
    TaskAttempt, TaskKind,
};
