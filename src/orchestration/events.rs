//! Pipeline lifecycle events.
//!
//! The runner and threader emit these so callers (the CLI, tests) can follow
//! a run without polling the ledger.

use crate::core::task::{FailureKind, TaskKind};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An attempt of a task was launched.
    TaskStarted {
        task: String,
        kind: TaskKind,
        batch: Option<usize>,
        attempt: u32,
        memory_mb: u64,
    },
    /// An attempt failed and the policy allows another one.
    TaskRetrying {
        task: String,
        batch: Option<usize>,
        next_attempt: u32,
        reason: FailureKind,
    },
    TaskCompleted {
        task: String,
        batch: Option<usize>,
        attempts: u32,
    },
    /// The task failed for good but its policy treats that as a no-op.
    TaskIgnored {
        task: String,
        batch: Option<usize>,
        attempts: u32,
        reason: FailureKind,
    },
    /// A batch's inference committed a new checkpoint.
    BatchApplied {
        batch: usize,
        checkpoint: String,
        version: u32,
    },
    /// A batch was passed over; the checkpoint is unchanged.
    BatchSkipped { batch: usize, reason: FailureKind },
    RunComplete { applied: usize, skipped: usize },
}

impl std::fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineEvent::TaskStarted {
                task,
                attempt,
                memory_mb,
                ..
            } => write!(f, "{} started (attempt {}, {} MiB)", task, attempt, memory_mb),
            PipelineEvent::TaskRetrying {
                task,
                next_attempt,
                reason,
                ..
            } => write!(f, "{} {}; retrying as attempt {}", task, reason, next_attempt),
            PipelineEvent::TaskCompleted { task, attempts, .. } => {
                write!(f, "{} completed after {} attempt(s)", task, attempts)
            }
            PipelineEvent::TaskIgnored {
                task,
                attempts,
                reason,
                ..
            } => write!(f, "{} ignored after {} attempt(s): {}", task, attempts, reason),
            PipelineEvent::BatchApplied {
                batch,
                checkpoint,
                version,
            } => write!(f, "batch {} applied -> {} (v{})", batch, checkpoint, version),
            PipelineEvent::BatchSkipped { batch, reason } => {
                write!(f, "batch {} skipped: {}", batch, reason)
            }
            PipelineEvent::RunComplete { applied, skipped } => {
                write!(f, "run complete: {} applied, {} skipped", applied, skipped)
            }
        }
    }
}

/// Optional event channel. Sending never fails the pipeline.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops every event.
    pub fn none() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
