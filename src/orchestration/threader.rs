//! Checkpoint threader.
//!
//! Folds batches into the tree one at a time. Encoding has no dependency on
//! the checkpoint, so every batch is encoded up front on a bounded worker
//! pool. Inference consumes the single current checkpoint and runs strictly
//! in batch order: the state for batch `i + 1` is whatever batch `i` left
//! behind, committed or passed through unchanged.

use crate::config::{Config, TaskSettings};
use crate::core::artifact::{ArtifactNamer, Batch, Checkpoint, DiffFile, Tree};
use crate::core::dag::DependencyType;
use crate::core::step::{Step, StepId};
use crate::core::task::{CommandTemplate, FailureKind, Task, TaskKind};
use crate::error::{Error, Result};
use crate::orchestration::events::PipelineEvent;
use crate::orchestration::ledger::Ledger;
use crate::orchestration::runner::{TaskOutcome, TaskRunner};
use crate::{plog, plog_debug, plog_warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The current checkpoint and the tree it describes.
///
/// Owned by the threader and moved through each transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreaderState {
    pub checkpoint: Checkpoint,
    pub tree: Tree,
}

impl ThreaderState {
    pub fn new(checkpoint: Checkpoint, tree: Tree) -> Self {
        Self { checkpoint, tree }
    }

    /// Successor state after `batch` was applied.
    fn commit(self, batch: &Batch, namer: &ArtifactNamer) -> Self {
        let name = format!("{}.batch_{:04}", namer.label(), batch.index);
        Self {
            checkpoint: self
                .checkpoint
                .successor(&name, namer.batch_checkpoint(batch.index)),
            tree: Tree::new(&name, namer.batch_tree(batch.index)),
        }
    }
}

/// A batch that was not folded into the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBatch {
    pub index: usize,
    pub names: Vec<String>,
    /// Batch FASTA, kept so the sequences can be resubmitted.
    pub sequences: PathBuf,
    /// Step that gave up on the batch.
    pub stage: TaskKind,
    pub reason: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ThreadingResult {
    pub state: ThreaderState,
    /// Indices of batches whose inference committed, in order.
    pub applied: Vec<usize>,
    pub skipped: Vec<SkippedBatch>,
    /// Every checkpoint from the starting one to the final one.
    pub checkpoints: Vec<Checkpoint>,
    /// Last inference step, or the starting step when nothing ran.
    pub last_step: Option<StepId>,
}

/// Ledger anchors for the threaded steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLinks {
    /// Step that produced the batch sequences.
    pub sequences_from: Option<StepId>,
    /// Step that produced the starting checkpoint.
    pub checkpoint_from: Option<StepId>,
}

/// What an encoder hands to the inference of its batch.
#[derive(Debug)]
enum Encoded {
    Diff(DiffFile),
    Ignored { reason: FailureKind, detail: String },
}

type EncodeHandle = JoinHandle<Result<(StepId, Encoded)>>;

pub struct CheckpointThreader {
    runner: TaskRunner,
    namer: ArtifactNamer,
    ledger: Ledger,
    encode_tool: CommandTemplate,
    encode_settings: TaskSettings,
    infer_tool: CommandTemplate,
    infer_settings: TaskSettings,
    threads: usize,
    workers: usize,
}

impl CheckpointThreader {
    pub fn new(runner: TaskRunner, config: &Config, namer: ArtifactNamer, ledger: Ledger) -> Self {
        Self {
            runner,
            namer,
            ledger,
            encode_tool: config.tools.encode.clone(),
            encode_settings: config.tasks.encode.clone(),
            infer_tool: config.tools.infer.clone(),
            infer_settings: config.tasks.infer.clone(),
            threads: config.threads,
            workers: config.workers.max(1),
        }
    }

    fn encode_task(&self, batch: &Batch) -> Task {
        Task::new(
            &format!("encode_batch_{:04}", batch.index),
            TaskKind::Encode,
            self.encode_tool.clone(),
            &self.encode_settings,
        )
        .with_batch(batch.index)
        .input("sequences", &batch.sequences.path)
        .output("diff", self.namer.batch_diff(batch.index))
    }

    fn infer_task(&self, batch: &Batch, state: &ThreaderState, diff: &DiffFile) -> Task {
        Task::new(
            &format!("infer_batch_{:04}", batch.index),
            TaskKind::Infer,
            self.infer_tool.clone(),
            &self.infer_settings,
        )
        .with_batch(batch.index)
        .input("checkpoint", &state.checkpoint.path)
        .input("diff", &diff.path)
        .output("out_checkpoint", self.namer.batch_checkpoint(batch.index))
        .output("out_tree", self.namer.batch_tree(batch.index))
        .param("threads", self.threads)
    }

    /// Start encoding every batch, at most `workers` at a time.
    ///
    /// Handles come back in batch order. The first encoder to fail for good
    /// cancels every other encoder and sends its error on `fatal`.
    fn spawn_encoders(
        &self,
        batches: &[Batch],
        upstream: Option<StepId>,
        cancel: &CancellationToken,
        fatal: mpsc::UnboundedSender<Error>,
    ) -> VecDeque<EncodeHandle> {
        let permits = Arc::new(Semaphore::new(self.workers));
        batches
            .iter()
            .map(|batch| {
                let task = self.encode_task(batch);
                let diff_name = format!("{}.batch_{:04}.diff", self.namer.label(), batch.index);
                let runner = self.runner.clone();
                let ledger = self.ledger.clone();
                let permits = Arc::clone(&permits);
                let cancel = cancel.clone();
                let fatal = fatal.clone();
                tokio::spawn(async move {
                    // Held until the failure, if any, has cancelled the queue.
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        permit = permits.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
                    };
                    let result: Result<(StepId, Encoded)> = async {
                        let mut step = Step::new(&task.name, TaskKind::Encode);
                        if let Some(index) = task.batch {
                            step = step.with_batch(index);
                        }
                        let deps: Vec<_> = upstream
                            .map(|id| (id, DependencyType::DataFlow))
                            .into_iter()
                            .collect();
                        let step_id = ledger.open(step, &deps).await?;
                        let run = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(Error::Cancelled),
                            run = runner.run(&task) => run,
                        };
                        let encoded = match record(&ledger, &step_id, run).await? {
                            TaskOutcome::Completed { mut outputs, .. } => {
                                let path = outputs.remove("diff").ok_or_else(|| {
                                    Error::Validation(format!("{} declares no diff output", task.name))
                                })?;
                                Encoded::Diff(DiffFile::new(&diff_name, path))
                            }
                            TaskOutcome::Ignored { reason, detail, .. } => {
                                Encoded::Ignored { reason, detail }
                            }
                        };
                        Ok((step_id, encoded))
                    }
                    .await;

                    match result {
                        Err(Error::Cancelled) => Err(Error::Cancelled),
                        Err(e) => {
                            plog_warn!("{} failed; cancelling remaining encoders", task.name);
                            cancel.cancel();
                            let _ = fatal.send(e);
                            Err(Error::Cancelled)
                        }
                        ok => ok,
                    }
                })
            })
            .collect()
    }

    /// Thread `batches` through the checkpoint chain starting at `initial`.
    ///
    /// # Errors
    /// Any terminating task failure aborts the run: queued and in-flight
    /// encodings are cancelled and the error is returned. An encoder failure
    /// is acted on as soon as it happens, also cancelling a running
    /// inference. Artifacts already written stay on disk.
    pub async fn run(
        &self,
        batches: Vec<Batch>,
        initial: ThreaderState,
        links: ThreadLinks,
    ) -> Result<ThreadingResult> {
        plog!(
            "Threading {} batch(es) from checkpoint {} (v{})",
            batches.len(),
            initial.checkpoint.name,
            initial.checkpoint.version
        );
        let cancel = CancellationToken::new();
        let (fatal_tx, mut fatal) = mpsc::unbounded_channel();
        let mut pending = self.spawn_encoders(&batches, links.sequences_from, &cancel, fatal_tx);

        let result = self
            .thread(batches, initial, links.checkpoint_from, &mut pending, &mut fatal)
            .await;
        if result.is_err() {
            cancel.cancel();
            for handle in pending.drain(..) {
                handle.abort();
            }
        }
        result
    }

    /// Wait for the next batch's encoder, bailing out on any fatal encoder error.
    async fn next_encoded(
        &self,
        batch: &Batch,
        pending: &mut VecDeque<EncodeHandle>,
        fatal: &mut mpsc::UnboundedReceiver<Error>,
    ) -> Result<(StepId, Encoded)> {
        let mut handle = pending
            .pop_front()
            .ok_or_else(|| Error::TaskJoin(format!("no encoder for batch {}", batch.index)))?;
        tokio::select! {
            biased;
            Some(err) = fatal.recv() => {
                handle.abort();
                Err(err)
            }
            joined = &mut handle => match joined.map_err(|e| Error::TaskJoin(e.to_string()))? {
                Err(Error::Cancelled) => Err(fatal.try_recv().unwrap_or(Error::Cancelled)),
                other => other,
            },
        }
    }

    async fn thread(
        &self,
        batches: Vec<Batch>,
        initial: ThreaderState,
        checkpoint_from: Option<StepId>,
        pending: &mut VecDeque<EncodeHandle>,
        fatal: &mut mpsc::UnboundedReceiver<Error>,
    ) -> Result<ThreadingResult> {
        let events = self.runner.events();
        let mut checkpoints = vec![initial.checkpoint.clone()];
        let mut state = initial;
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        let mut handoff = checkpoint_from;

        for batch in batches {
            let (encode_step, encoded) = self.next_encoded(&batch, pending, fatal).await?;

            let diff = match encoded {
                Encoded::Diff(diff) => diff,
                Encoded::Ignored { reason, detail } => {
                    plog_warn!("Batch {} not encoded ({}); skipping", batch.index, reason);
                    events
                        .emit(PipelineEvent::BatchSkipped {
                            batch: batch.index,
                            reason,
                        })
                        .await;
                    skipped.push(skipped_batch(&batch, TaskKind::Encode, reason, detail));
                    continue;
                }
            };

            let task = self.infer_task(&batch, &state, &diff);
            let mut deps = vec![(encode_step, DependencyType::DataFlow)];
            if let Some(prev) = handoff {
                deps.push((prev, DependencyType::CheckpointHandoff));
            }
            let step_id = self
                .ledger
                .open(Step::new(&task.name, TaskKind::Infer).with_batch(batch.index), &deps)
                .await?;
            handoff = Some(step_id);

            let run = tokio::select! {
                biased;
                Some(err) = fatal.recv() => {
                    self.ledger.fail(&step_id, &Error::Cancelled.to_string(), 0).await;
                    return Err(err);
                }
                run = self.runner.run(&task) => run,
            };
            match record(&self.ledger, &step_id, run).await? {
                TaskOutcome::Completed { .. } => {
                    state = state.commit(&batch, &self.namer);
                    plog_debug!(
                        "Batch {} committed checkpoint {} (v{})",
                        batch.index,
                        state.checkpoint.name,
                        state.checkpoint.version
                    );
                    events
                        .emit(PipelineEvent::BatchApplied {
                            batch: batch.index,
                            checkpoint: state.checkpoint.name.clone(),
                            version: state.checkpoint.version,
                        })
                        .await;
                    checkpoints.push(state.checkpoint.clone());
                    applied.push(batch.index);
                }
                TaskOutcome::Ignored { reason, detail, .. } => {
                    plog_warn!(
                        "Batch {} skipped ({}); checkpoint stays at {}",
                        batch.index,
                        reason,
                        state.checkpoint.name
                    );
                    events
                        .emit(PipelineEvent::BatchSkipped {
                            batch: batch.index,
                            reason,
                        })
                        .await;
                    skipped.push(skipped_batch(&batch, TaskKind::Infer, reason, detail));
                }
            }
        }

        plog!(
            "Threading finished: {} applied, {} skipped, final checkpoint {}",
            applied.len(),
            skipped.len(),
            state.checkpoint.name
        );
        Ok(ThreadingResult {
            state,
            applied,
            skipped,
            checkpoints,
            last_step: handoff,
        })
    }
}

/// Mirror a task result into the ledger and pass it on.
async fn record(
    ledger: &Ledger,
    step: &StepId,
    result: Result<TaskOutcome>,
) -> Result<TaskOutcome> {
    match &result {
        Ok(outcome @ TaskOutcome::Completed { .. }) => {
            ledger.complete(step, outcome.attempt_count()).await
        }
        Ok(outcome @ TaskOutcome::Ignored { reason, .. }) => {
            ledger
                .skip(step, &reason.to_string(), outcome.attempt_count())
                .await
        }
        Err(e) => {
            let attempts = match e {
                Error::Task(failure) => failure.attempts,
                _ => 0,
            };
            ledger.fail(step, &e.to_string(), attempts).await
        }
    }
    result
}

fn skipped_batch(batch: &Batch, stage: TaskKind, reason: FailureKind, detail: String) -> SkippedBatch {
    SkippedBatch {
        index: batch.index,
        names: batch.names.clone(),
        sequences: batch.sequences.path.clone(),
        stage,
        reason,
        detail,
    }
}
