//! Pipeline assembly for the two run modes.
//!
//! Full build:
//!   normalize seed -> partition -> encode matched -> initial build
//!   -> chunk unmatched -> thread -> finalize
//!
//! Incremental update:
//!   partition against existing tree -> chunk unmatched
//!   -> thread from supplied checkpoint -> finalize
//!
//! Both modes share the chunker, the threader and the finalizer.

use crate::config::Config;
use crate::core::artifact::{ArtifactNamer, Checkpoint, SequenceSet, Tree};
use crate::core::dag::DependencyType;
use crate::core::step::{Step, StepId};
use crate::core::task::{FailurePolicy, Task, TaskKind};
use crate::error::{Error, Result, TaskFailure};
use crate::newick;
use crate::orchestration::chunker;
use crate::orchestration::events::{EventSink, PipelineEvent};
use crate::orchestration::executor::ToolExecutor;
use crate::orchestration::finalizer::{Finalizer, Notification, Notifier, WebhookNotifier};
use crate::orchestration::ledger::Ledger;
use crate::orchestration::runner::{TaskOutcome, TaskRunner};
use crate::orchestration::threader::{CheckpointThreader, ThreadLinks, ThreaderState, ThreadingResult};
use crate::report::{RunMode, RunReport};
use crate::{plog, plog_debug};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FullBuildInputs {
    pub sequences: PathBuf,
    pub seed_tree: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UpdateInputs {
    pub sequences: PathBuf,
    /// Tree matching `checkpoint`, used to partition known from new sequences.
    pub tree: PathBuf,
    pub checkpoint: PathBuf,
}

pub struct PipelineAssembler {
    config: Config,
    run_date: String,
    namer: ArtifactNamer,
    runner: TaskRunner,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PipelineAssembler {
    /// Build an assembler for one run.
    ///
    /// # Errors
    /// Invalid configuration, or a notification URL the HTTP client rejects.
    pub fn new(config: Config, executor: Arc<dyn ToolExecutor>) -> Result<Self> {
        config.validate()?;
        let run_date = config.effective_run_date();
        let namer = ArtifactNamer::new(config.effective_workdir(), &run_date);
        let notifier = match &config.notify_url {
            Some(url) => Some(Arc::new(WebhookNotifier::new(url)?) as Arc<dyn Notifier>),
            None => None,
        };
        Ok(Self {
            config,
            run_date,
            namer,
            runner: TaskRunner::new(executor),
            notifier,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.runner = self.runner.with_events(events);
        self
    }

    pub fn namer(&self) -> &ArtifactNamer {
        &self.namer
    }

    pub fn run_date(&self) -> &str {
        &self.run_date
    }

    /// Build a tree from scratch, starting at a seed tree.
    pub async fn full_build(&self, inputs: &FullBuildInputs) -> Result<RunReport> {
        let started_at = Utc::now();
        let ledger = Ledger::new();
        require(&inputs.sequences, "sequences").await?;
        require(&inputs.seed_tree, "seed tree").await?;
        tokio::fs::create_dir_all(self.namer.dir()).await?;
        plog!(
            "Full build {} in {}",
            self.run_date,
            self.namer.dir().display()
        );

        let normalize = self.normalize_seed(&inputs.seed_tree, &ledger).await?;
        let seed = self.namer.normalized_tree();

        let partition = self
            .partition(&inputs.sequences, &seed, &[(normalize, DependencyType::DataFlow)], &ledger)
            .await?;

        let encode_seed = self
            .run_required(
                Task::new(
                    "encode_seed",
                    TaskKind::Encode,
                    self.config.tools.encode.clone(),
                    &self.config.tasks.encode,
                )
                .with_policy(self.config.tasks.encode.policy.fatal())
                .input("sequences", self.namer.matched())
                .output("diff", self.namer.seed_diff()),
                &[(partition, DependencyType::DataFlow)],
                &ledger,
            )
            .await?;

        let initial_build = self
            .run_required(
                Task::new(
                    "initial_build",
                    TaskKind::InitialBuild,
                    self.config.tools.initial_build.clone(),
                    &self.config.tasks.initial_build,
                )
                .with_policy(FailurePolicy::TerminateImmediately)
                .input("tree", &seed)
                .input("diff", self.namer.seed_diff())
                .output("out_checkpoint", self.namer.initial_checkpoint())
                .output("out_tree", self.namer.initial_tree())
                .param("threads", self.config.threads),
                &[
                    (normalize, DependencyType::DataFlow),
                    (encode_seed, DependencyType::DataFlow),
                ],
                &ledger,
            )
            .await?;

        let initial_name = format!("{}.initial", self.namer.label());
        let initial = ThreaderState::new(
            Checkpoint::root(&initial_name, self.namer.initial_checkpoint()),
            Tree::new(&initial_name, self.namer.initial_tree()),
        );
        let links = ThreadLinks {
            sequences_from: Some(partition),
            checkpoint_from: Some(initial_build),
        };
        self.thread_and_finish(RunMode::FullBuild, started_at, initial, links, &ledger)
            .await
    }

    /// Fold new sequences into an existing checkpoint.
    pub async fn incremental_update(&self, inputs: &UpdateInputs) -> Result<RunReport> {
        let started_at = Utc::now();
        let ledger = Ledger::new();
        require(&inputs.sequences, "sequences").await?;
        require(&inputs.tree, "tree").await?;
        require(&inputs.checkpoint, "checkpoint").await?;
        tokio::fs::create_dir_all(self.namer.dir()).await?;
        plog!(
            "Incremental update {} from {} in {}",
            self.run_date,
            inputs.checkpoint.display(),
            self.namer.dir().display()
        );

        let partition = self
            .partition(&inputs.sequences, &inputs.tree, &[], &ledger)
            .await?;

        let name = file_label(&inputs.checkpoint);
        let initial = ThreaderState::new(
            Checkpoint::root(&name, &inputs.checkpoint),
            Tree::new(&file_label(&inputs.tree), &inputs.tree),
        );
        let links = ThreadLinks {
            sequences_from: Some(partition),
            checkpoint_from: None,
        };
        self.thread_and_finish(RunMode::IncrementalUpdate, started_at, initial, links, &ledger)
            .await
    }

    async fn normalize_seed(&self, seed_tree: &Path, ledger: &Ledger) -> Result<StepId> {
        let step = ledger
            .open(Step::new("normalize_seed", TaskKind::Normalize), &[])
            .await?;
        let text = tokio::fs::read_to_string(seed_tree).await?;
        let normalized = newick::normalize(&text);
        let leaves = newick::leaf_names(&normalized);
        if leaves.is_empty() {
            let err = Error::DependencyMissing(format!(
                "seed tree {} has no leaves",
                seed_tree.display()
            ));
            ledger.fail(&step, &err.to_string(), 1).await;
            return Err(err);
        }
        tokio::fs::write(self.namer.normalized_tree(), format!("{}\n", normalized)).await?;
        plog_debug!("Seed tree normalized: {} leaves", leaves.len());
        ledger.complete(&step, 1).await;
        Ok(step)
    }

    async fn partition(
        &self,
        sequences: &Path,
        tree: &Path,
        deps: &[(StepId, DependencyType)],
        ledger: &Ledger,
    ) -> Result<StepId> {
        self.run_required(
            Task::new(
                "partition",
                TaskKind::Partition,
                self.config.tools.partition.clone(),
                &self.config.tasks.partition,
            )
            .with_policy(self.config.tasks.partition.policy.fatal())
            .input("sequences", sequences)
            .input("tree", tree)
            .output("matched", self.namer.matched())
            .output("unmatched", self.namer.unmatched()),
            deps,
            ledger,
        )
        .await
    }

    /// Run a task whose outputs the rest of the run depends on.
    async fn run_required(
        &self,
        task: Task,
        deps: &[(StepId, DependencyType)],
        ledger: &Ledger,
    ) -> Result<StepId> {
        let step = ledger.open(Step::new(&task.name, task.kind), deps).await?;
        match self.runner.run(&task).await {
            Ok(outcome @ TaskOutcome::Completed { .. }) => {
                ledger.complete(&step, outcome.attempt_count()).await;
                Ok(step)
            }
            Ok(TaskOutcome::Ignored {
                reason,
                detail,
                attempts,
            }) => {
                let failure = TaskFailure {
                    task: task.name.clone(),
                    kind: task.kind,
                    batch: task.batch,
                    classification: reason,
                    attempts: attempts.len() as u32,
                    detail,
                };
                ledger
                    .fail(&step, &failure.to_string(), failure.attempts)
                    .await;
                Err(Error::Task(failure))
            }
            Err(e) => {
                let attempts = match &e {
                    Error::Task(failure) => failure.attempts,
                    _ => 0,
                };
                ledger.fail(&step, &e.to_string(), attempts).await;
                Err(e)
            }
        }
    }

    async fn thread_and_finish(
        &self,
        mode: RunMode,
        started_at: DateTime<Utc>,
        initial: ThreaderState,
        links: ThreadLinks,
        ledger: &Ledger,
    ) -> Result<RunReport> {
        let unmatched = SequenceSet::new(
            &format!("{}.unmatched", self.namer.label()),
            self.namer.unmatched(),
        );
        let (batch_size, namer) = (self.config.batch_size, self.namer.clone());
        let batches = tokio::task::spawn_blocking(move || {
            chunker::chunk_sequences(&unmatched, batch_size, &namer)
        })
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))??;
        let batch_count = batches.len();

        let threader = CheckpointThreader::new(
            self.runner.clone(),
            &self.config,
            self.namer.clone(),
            ledger.clone(),
        );
        let threaded = threader.run(batches, initial, links).await?;
        let chain = ledger.checkpoint_chain().await?;
        plog_debug!("Checkpoint hand-off chain: {} step(s)", chain.len());
        let upstream = threaded.last_step.or(links.checkpoint_from);
        self.finish(mode, started_at, threaded, batch_count, upstream, ledger)
            .await
    }

    async fn finish(
        &self,
        mode: RunMode,
        started_at: DateTime<Utc>,
        threaded: ThreadingResult,
        batch_count: usize,
        upstream: Option<StepId>,
        ledger: &Ledger,
    ) -> Result<RunReport> {
        let finalizer = Finalizer::new(
            self.runner.clone(),
            &self.config,
            self.namer.clone(),
            ledger.clone(),
        )
        .with_notifier(self.notifier.clone());

        let (rooted, reroot_step) = finalizer.reroot(&threaded.state.tree, upstream).await?;

        let mut report = RunReport {
            mode,
            run_date: self.run_date.clone(),
            started_at,
            finished_at: Utc::now(),
            final_tree: rooted,
            unrooted_tree: threaded.state.tree,
            final_checkpoint: threaded.state.checkpoint,
            checkpoints: threaded.checkpoints,
            batch_count,
            applied: threaded.applied,
            skipped: threaded.skipped,
            notification: String::new(),
            steps: Vec::new(),
        };

        let notification = Notification {
            subject: format!("phylofold {} {} complete", mode, self.run_date),
            body: report.summary(),
        };
        report.notification = finalizer
            .notify(&notification, Some(reroot_step))
            .await
            .to_string();
        report.steps = ledger.snapshot().await?;
        report.finished_at = Utc::now();
        report.write(&self.namer.report()).await?;

        self.runner
            .events()
            .emit(PipelineEvent::RunComplete {
                applied: report.applied.len(),
                skipped: report.skipped.len(),
            })
            .await;
        plog!(
            "Run {} complete: {} applied, skipped {:?}",
            self.run_date,
            report.applied.len(),
            report.skipped_indices()
        );
        Ok(report)
    }
}

async fn require(path: &Path, what: &str) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        Ok(())
    } else {
        Err(Error::DependencyMissing(format!(
            "{} not found: {}",
            what,
            path.display()
        )))
    }
}

/// Artifact name for an externally supplied file: its stem.
fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
