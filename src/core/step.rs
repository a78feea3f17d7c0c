//! Ledger entries for executed pipeline steps.
//!
//! A [`Step`] records what happened to one unit of pipeline work: when it
//! ran, how many attempts it took and how it ended. Steps are the nodes of
//! the run's [`StepDAG`](super::dag::StepDAG).

use crate::core::task::TaskKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    /// Failed but ignored by policy; downstream work proceeds without it.
    Skipped { reason: String },
    Failed { error: String },
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            StepStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub kind: TaskKind,
    pub batch: Option<usize>,
    pub status: StepStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Names of the steps this one waited on, filled in by ledger snapshots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(name: &str, kind: TaskKind) -> Self {
        Self {
            id: StepId::new(),
            name: name.to_string(),
            kind,
            batch: None,
            status: StepStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_batch(mut self, index: usize) -> Self {
        self.batch = Some(index);
        self
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, attempts: u32) {
        self.status = StepStatus::Completed;
        self.attempts = attempts;
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str, attempts: u32) {
        self.status = StepStatus::Skipped {
            reason: reason.to_string(),
        };
        self.attempts = attempts;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str, attempts: u32) {
        self.status = StepStatus::Failed {
            error: error.to_string(),
        };
        self.attempts = attempts;
        self.completed_at = Some(Utc::now());
    }

    /// Completed, skipped or failed.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Skipped { .. } | StepStatus::Failed { .. }
        )
    }
}
