use thiserror::Error;

use crate::core::task::{FailureKind, TaskKind};

/// A task that could not be recovered by its failure policy.
///
/// Carries enough context for an operator to locate the failing step:
/// which task, which batch (if any), how it failed and after how many attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub kind: TaskKind,
    pub batch: Option<usize>,
    pub classification: FailureKind,
    pub attempts: u32,
    pub detail: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task '{}'", self.task)?;
        if let Some(batch) = self.batch {
            write!(f, " (batch {})", batch)?;
        }
        write!(
            f,
            " failed with {} after {} attempt(s): {}",
            self.classification, self.attempts, self.detail
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    #[error("{0}")]
    Task(TaskFailure),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid step transition from {from} to {to}")]
    InvalidStepTransition { from: String, to: String },
}

impl Error {
    /// Failure classification, if this error came out of a task.
    pub fn classification(&self) -> Option<FailureKind> {
        match self {
            Error::Task(failure) => Some(failure.classification),
            Error::DependencyMissing(_) => Some(FailureKind::DependencyMissing),
            _ => None,
        }
    }

    /// Process exit code for a run aborted by this error.
    pub fn exit_code(&self) -> u8 {
        match self.classification() {
            Some(FailureKind::ResourceExhausted) => 3,
            Some(FailureKind::TaskFailed) => 4,
            Some(FailureKind::DependencyMissing) => 5,
            None => match self {
                Error::Validation(_) | Error::TomlParse(_) => 2,
                _ => 1,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
