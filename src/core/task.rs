//! Runnable task model.
//!
//! A [`Task`] is one invocation of an external tool: a command template,
//! declared inputs and outputs, a resource policy and a failure policy.
//! Tasks are values; the [`TaskRunner`](crate::orchestration::TaskRunner)
//! executes them attempt by attempt.

use crate::config::TaskSettings;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Kind of pipeline step.
///
/// External tool kinds (`Partition`, `Encode`, `InitialBuild`, `Infer`,
/// `Reroot`) each carry their own resource and failure settings. `Normalize`
/// and `Notify` run in-process and only appear in the run ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Normalize,
    Partition,
    Encode,
    InitialBuild,
    Infer,
    Reroot,
    Notify,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Normalize => write!(f, "normalize"),
            TaskKind::Partition => write!(f, "partition"),
            TaskKind::Encode => write!(f, "encode"),
            TaskKind::InitialBuild => write!(f, "initial_build"),
            TaskKind::Infer => write!(f, "infer"),
            TaskKind::Reroot => write!(f, "reroot"),
            TaskKind::Notify => write!(f, "notify"),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Killed for memory (SIGKILL or exit code 137..=140).
    ResourceExhausted,
    /// Any other non-zero exit, or missing outputs after a clean exit.
    TaskFailed,
    /// A structural input problem. Never retried.
    DependencyMissing,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ResourceExhausted => write!(f, "resource_exhausted"),
            FailureKind::TaskFailed => write!(f, "task_failed"),
            FailureKind::DependencyMissing => write!(f, "dependency_missing"),
        }
    }
}

/// Memory schedule for a task kind: `base + increment * attempt` MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub base_mb: u64,
    pub increment_mb: u64,
}

impl ResourcePolicy {
    pub fn new(base_mb: u64, increment_mb: u64) -> Self {
        Self {
            base_mb,
            increment_mb,
        }
    }

    /// Memory budget in MiB for the given attempt (attempts start at 1).
    pub fn memory_mb(&self, attempt: u32) -> u64 {
        self.base_mb
            .saturating_add(self.increment_mb.saturating_mul(u64::from(attempt)))
    }
}

/// What the runner does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Terminate,
    Ignore,
}

/// Per-task failure policy.
///
/// `RetryThenIgnore` is the business rule for threading inference: a batch
/// that cannot be applied is skipped so later batches still land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum FailurePolicy {
    /// Retry resource exhaustion up to `max_attempts`, then abort the run.
    RetryThenTerminate { max_attempts: u32 },
    /// Retry resource exhaustion up to `max_attempts`, then treat the task as
    /// a no-op. Other task failures are ignored without retry.
    RetryThenIgnore { max_attempts: u32 },
    /// Any failure aborts the run.
    TerminateImmediately,
}

impl FailurePolicy {
    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailurePolicy::RetryThenTerminate { max_attempts }
            | FailurePolicy::RetryThenIgnore { max_attempts } => (*max_attempts).max(1),
            FailurePolicy::TerminateImmediately => 1,
        }
    }

    /// The same retry budget, but exhaustion aborts the run.
    ///
    /// Used for steps whose output every later step needs.
    pub fn fatal(self) -> Self {
        match self {
            FailurePolicy::RetryThenIgnore { max_attempts } => {
                FailurePolicy::RetryThenTerminate { max_attempts }
            }
            other => other,
        }
    }

    /// Decide what to do after `attempt` failed with `kind`.
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> Decision {
        if kind == FailureKind::DependencyMissing {
            return Decision::Terminate;
        }
        let can_retry = kind == FailureKind::ResourceExhausted && attempt < self.max_attempts();
        match self {
            FailurePolicy::TerminateImmediately => Decision::Terminate,
            FailurePolicy::RetryThenTerminate { .. } => {
                if can_retry {
                    Decision::Retry
                } else {
                    Decision::Terminate
                }
            }
            FailurePolicy::RetryThenIgnore { .. } => {
                if can_retry {
                    Decision::Retry
                } else {
                    Decision::Ignore
                }
            }
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::RetryThenTerminate { max_attempts } => {
                write!(f, "retry_then_terminate({})", max_attempts)
            }
            FailurePolicy::RetryThenIgnore { max_attempts } => {
                write!(f, "retry_then_ignore({})", max_attempts)
            }
            FailurePolicy::TerminateImmediately => write!(f, "terminate_immediately"),
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Program plus argument template with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Render the argument list, substituting every `{name}` from `bindings`.
    ///
    /// # Errors
    /// Returns a validation error for an unbound placeholder.
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> Result<Vec<String>> {
        self.args
            .iter()
            .map(|arg| {
                let mut missing = None;
                let rendered = placeholder_re().replace_all(arg, |caps: &regex::Captures| {
                    match bindings.get(&caps[1]) {
                        Some(value) => value.clone(),
                        None => {
                            missing = Some(caps[1].to_string());
                            String::new()
                        }
                    }
                });
                match missing {
                    Some(name) => Err(Error::Validation(format!(
                        "Unbound placeholder {{{}}} in '{}' argument '{}'",
                        name, self.program, arg
                    ))),
                    None => Ok(rendered.into_owned()),
                }
            })
            .collect()
    }
}

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique, deterministic name (e.g. `infer_batch_0003`).
    pub name: String,
    pub kind: TaskKind,
    /// Position of the batch this task belongs to, if any.
    pub batch: Option<usize>,
    pub command: CommandTemplate,
    pub inputs: BTreeMap<String, PathBuf>,
    pub outputs: BTreeMap<String, PathBuf>,
    /// Non-path bindings such as thread counts or the outgroup.
    pub params: BTreeMap<String, String>,
    pub resources: ResourcePolicy,
    pub failure: FailurePolicy,
    /// Base delay before the second attempt; doubles for each later attempt.
    pub backoff: Duration,
}

impl Task {
    pub fn new(name: &str, kind: TaskKind, command: CommandTemplate, settings: &TaskSettings) -> Self {
        Self {
            name: name.to_string(),
            kind,
            batch: None,
            command,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            params: BTreeMap::new(),
            resources: settings.resources(),
            failure: settings.policy,
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }

    pub fn with_batch(mut self, index: usize) -> Self {
        self.batch = Some(index);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure = policy;
        self
    }

    pub fn input(mut self, key: &str, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(key.to_string(), path.into());
        self
    }

    pub fn output(mut self, key: &str, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(key.to_string(), path.into());
        self
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Check structural invariants: a program is set and no output
    /// overwrites an input.
    pub fn validate(&self) -> Result<()> {
        if self.command.program.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Task '{}' has an empty program",
                self.name
            )));
        }
        for (key, out) in &self.outputs {
            if self.inputs.values().any(|input| input == out) {
                return Err(Error::Validation(format!(
                    "Task '{}' output '{}' would overwrite an input: {}",
                    self.name,
                    key,
                    out.display()
                )));
            }
        }
        Ok(())
    }

    /// All template bindings for an attempt.
    pub fn bindings(&self, attempt: u32) -> BTreeMap<String, String> {
        let mut bindings: BTreeMap<String, String> = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|(k, v)| (k.clone(), v.display().to_string()))
            .collect();
        bindings.extend(self.params.clone());
        bindings.insert("attempt".to_string(), attempt.to_string());
        bindings.insert(
            "memory_mb".to_string(),
            self.resources.memory_mb(attempt).to_string(),
        );
        bindings
    }

    /// Delay to wait before running `attempt`.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt < 2 || self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: FailureKind, detail: String },
}

/// Record of one attempt at running a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub task: String,
    pub attempt: u32,
    pub memory_mb: u64,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
