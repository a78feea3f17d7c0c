//! Task runner: attempts, resource escalation and failure policy.
//!
//! Every attempt re-renders the task's command with the memory budget for
//! that attempt, so a retry after resource exhaustion always asks for more
//! memory than the attempt before it.

use crate::core::task::{AttemptOutcome, Decision, FailureKind, Task, TaskAttempt};
use crate::error::{Error, Result, TaskFailure};
use crate::orchestration::events::{EventSink, PipelineEvent};
use crate::orchestration::executor::{Invocation, ToolExecutor};
use crate::{plog, plog_debug, plog_error, plog_trace, plog_warn};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Final result of running a task under its policy.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed {
        outputs: BTreeMap<String, PathBuf>,
        attempts: Vec<TaskAttempt>,
    },
    /// Failed for good, but the policy says carry on without it.
    Ignored {
        reason: FailureKind,
        detail: String,
        attempts: Vec<TaskAttempt>,
    },
}

impl TaskOutcome {
    pub fn attempts(&self) -> &[TaskAttempt] {
        match self {
            TaskOutcome::Completed { attempts, .. } | TaskOutcome::Ignored { attempts, .. } => {
                attempts
            }
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts().len() as u32
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    executor: Arc<dyn ToolExecutor>,
    events: EventSink,
}

impl TaskRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            executor,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Run a single attempt.
    ///
    /// Missing inputs are reported as `DependencyMissing` without launching
    /// the tool. Outputs left over from an earlier attempt are removed first
    /// so a clean exit can be checked against fresh files.
    pub async fn run_attempt(&self, task: &Task, attempt: u32) -> Result<TaskAttempt> {
        let memory_mb = task.resources.memory_mb(attempt);
        let started_at = Utc::now();
        let finish = |outcome: AttemptOutcome| TaskAttempt {
            task: task.name.clone(),
            attempt,
            memory_mb,
            outcome,
            started_at,
            finished_at: Utc::now(),
        };

        for (key, path) in &task.inputs {
            if !tokio::fs::try_exists(path).await? {
                return Ok(finish(AttemptOutcome::Failed {
                    kind: FailureKind::DependencyMissing,
                    detail: format!("input '{}' not found: {}", key, path.display()),
                }));
            }
        }

        for path in task.outputs.values() {
            if tokio::fs::try_exists(path).await? {
                tokio::fs::remove_file(path).await?;
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let invocation = Invocation {
            task: task.name.clone(),
            kind: task.kind,
            batch: task.batch,
            attempt,
            memory_mb,
            program: task.command.program.clone(),
            args: task.command.render(&task.bindings(attempt))?,
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
            params: task.params.clone(),
        };

        self.events
            .emit(PipelineEvent::TaskStarted {
                task: task.name.clone(),
                kind: task.kind,
                batch: task.batch,
                attempt,
                memory_mb,
            })
            .await;

        let output = self.executor.execute(&invocation).await?;
        if !output.stderr.is_empty() {
            plog_trace!("{} attempt {} stderr: {}", task.name, attempt, output.stderr);
        }
        if let Some(kind) = output.status.classify() {
            let detail = if output.stderr.is_empty() {
                output.status.to_string()
            } else {
                format!("{}: {}", output.status, output.stderr)
            };
            return Ok(finish(AttemptOutcome::Failed { kind, detail }));
        }

        for (key, path) in &task.outputs {
            if !tokio::fs::try_exists(path).await? {
                return Ok(finish(AttemptOutcome::Failed {
                    kind: FailureKind::TaskFailed,
                    detail: format!(
                        "exited cleanly but output '{}' is missing: {}",
                        key,
                        path.display()
                    ),
                }));
            }
        }

        Ok(finish(AttemptOutcome::Succeeded))
    }

    /// Run a task to completion under its failure policy.
    ///
    /// # Errors
    /// Returns [`Error::Task`] when the policy decides to terminate, and
    /// propagates errors that prevented an attempt from being made at all.
    pub async fn run(&self, task: &Task) -> Result<TaskOutcome> {
        task.validate()?;
        let mut attempts: Vec<TaskAttempt> = Vec::new();
        let mut attempt = 1u32;

        loop {
            let delay = task.backoff_before(attempt);
            if !delay.is_zero() {
                plog_debug!("{}: waiting {:?} before attempt {}", task.name, delay, attempt);
                tokio::time::sleep(delay).await;
            }

            let record = self.run_attempt(task, attempt).await?;
            let failed = match &record.outcome {
                AttemptOutcome::Succeeded => None,
                AttemptOutcome::Failed { kind, detail } => Some((*kind, detail.clone())),
            };
            attempts.push(record);

            let Some((kind, detail)) = failed else {
                plog!(
                    "{} completed (attempt {}, {} MiB)",
                    task.name,
                    attempt,
                    task.resources.memory_mb(attempt)
                );
                self.events
                    .emit(PipelineEvent::TaskCompleted {
                        task: task.name.clone(),
                        batch: task.batch,
                        attempts: attempt,
                    })
                    .await;
                return Ok(TaskOutcome::Completed {
                    outputs: task.outputs.clone(),
                    attempts,
                });
            };

            match task.failure.decide(kind, attempt) {
                Decision::Retry => {
                    plog_warn!(
                        "{} attempt {} failed with {}; retrying with {} MiB",
                        task.name,
                        attempt,
                        kind,
                        task.resources.memory_mb(attempt + 1)
                    );
                    self.events
                        .emit(PipelineEvent::TaskRetrying {
                            task: task.name.clone(),
                            batch: task.batch,
                            next_attempt: attempt + 1,
                            reason: kind,
                        })
                        .await;
                    attempt += 1;
                }
                Decision::Ignore => {
                    plog_warn!(
                        "{} ignored after {} attempt(s) ({}): {}",
                        task.name,
                        attempt,
                        kind,
                        detail
                    );
                    self.events
                        .emit(PipelineEvent::TaskIgnored {
                            task: task.name.clone(),
                            batch: task.batch,
                            attempts: attempt,
                            reason: kind,
                        })
                        .await;
                    return Ok(TaskOutcome::Ignored {
                        reason: kind,
                        detail,
                        attempts,
                    });
                }
                Decision::Terminate => {
                    let failure = TaskFailure {
                        task: task.name.clone(),
                        kind: task.kind,
                        batch: task.batch,
                        classification: kind,
                        attempts: attempt,
                        detail,
                    };
                    plog_error!("{}", failure);
                    return Err(Error::Task(failure));
                }
            }
        }
    }
}
