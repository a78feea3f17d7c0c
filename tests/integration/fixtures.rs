//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An in-process simulation of the five external tools
//! - Temporary run directories with seed trees, sequences and checkpoints
//! - Configs with zero backoff

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use phylofold::config::Config;
use phylofold::core::task::TaskKind;
use phylofold::fasta::{self, Record};
use phylofold::newick;
use phylofold::orchestration::{
    DeliveryStatus, EventSink, ExitOutcome, Invocation, Notification, Notifier, PipelineEvent,
    ToolExecutor, ToolOutput,
};
use phylofold::Result;

/// The default outgroup, present in every seed tree built here.
pub const REFERENCE: &str = "MN908947.3";

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub task: String,
    pub kind: TaskKind,
    pub batch: Option<usize>,
    pub attempt: u32,
    pub memory_mb: u64,
}

/// In-process stand-in for the partition, encode, inference and reroot tools.
///
/// Checkpoints are plain text, one placed sample per line. Trees are flat
/// Newick over the same samples. Diffs list the encoded sample names.
#[derive(Default)]
pub struct SimulatedTools {
    /// (kind, batch) -> attempts that get SIGKILLed.
    kills: Mutex<HashMap<(TaskKind, Option<usize>), Vec<u32>>>,
    /// (kind, batch) -> exit code for every attempt.
    failures: Mutex<HashMap<(TaskKind, Option<usize>), i32>>,
    calls: Mutex<Vec<Call>>,
    infer_running: AtomicUsize,
    infer_peak: AtomicUsize,
}

impl SimulatedTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Kill `kind` for `batch` with SIGKILL on the listed attempts.
    pub fn kill(self: &Arc<Self>, kind: TaskKind, batch: Option<usize>, attempts: &[u32]) -> Arc<Self> {
        self.kills
            .lock()
            .unwrap()
            .insert((kind, batch), attempts.to_vec());
        Arc::clone(self)
    }

    /// Make `kind` for `batch` exit with `code` on every attempt.
    pub fn fail(self: &Arc<Self>, kind: TaskKind, batch: Option<usize>, code: i32) -> Arc<Self> {
        self.failures.lock().unwrap().insert((kind, batch), code);
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: TaskKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    /// Largest number of inference tasks seen running at once.
    pub fn infer_peak(&self) -> usize {
        self.infer_peak.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, invocation: &Invocation) -> Option<ExitOutcome> {
        let key = (invocation.kind, invocation.batch);
        if let Some(code) = self.failures.lock().unwrap().get(&key) {
            return Some(ExitOutcome::Code(*code));
        }
        let kills = self.kills.lock().unwrap();
        match kills.get(&key) {
            Some(attempts) if attempts.contains(&invocation.attempt) => Some(ExitOutcome::Signal(9)),
            _ => None,
        }
    }

    fn simulate(&self, invocation: &Invocation) -> Result<()> {
        let input = |key: &str| invocation.inputs[key].clone();
        let output = |key: &str| invocation.outputs[key].clone();
        match invocation.kind {
            TaskKind::Partition => {
                let known: BTreeSet<String> =
                    newick::read_leaf_names(&input("tree"))?.into_iter().collect();
                let (matched, unmatched): (Vec<Record>, Vec<Record>) = fasta::read(&input("sequences"))?
                    .into_iter()
                    .partition(|r| known.contains(&r.name));
                fasta::write(&output("matched"), &matched)?;
                fasta::write(&output("unmatched"), &unmatched)?;
            }
            TaskKind::Encode => {
                let names: Vec<String> = fasta::read(&input("sequences"))?
                    .into_iter()
                    .map(|r| r.name)
                    .collect();
                write_lines(&output("diff"), &names)?;
            }
            TaskKind::InitialBuild => {
                let leaves = newick::read_leaf_names(&input("tree"))?;
                write_lines(&output("out_checkpoint"), &leaves)?;
                std::fs::write(output("out_tree"), flat_tree(&leaves))?;
            }
            TaskKind::Infer => {
                let mut leaves = read_lines(&input("checkpoint"))?;
                leaves.extend(read_lines(&input("diff"))?);
                write_lines(&output("out_checkpoint"), &leaves)?;
                std::fs::write(output("out_tree"), flat_tree(&leaves))?;
            }
            TaskKind::Reroot => {
                let outgroup = &invocation.params["outgroup"];
                let others: Vec<String> = newick::read_leaf_names(&input("tree"))?
                    .into_iter()
                    .filter(|l| l != outgroup)
                    .collect();
                std::fs::write(
                    output("out_tree"),
                    format!("({},({}));\n", outgroup, others.join(",")),
                )?;
            }
            TaskKind::Normalize | TaskKind::Notify => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ToolExecutor for SimulatedTools {
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(Call {
            task: invocation.task.clone(),
            kind: invocation.kind,
            batch: invocation.batch,
            attempt: invocation.attempt,
            memory_mb: invocation.memory_mb,
        });

        if invocation.kind == TaskKind::Infer {
            let running = self.infer_running.fetch_add(1, Ordering::SeqCst) + 1;
            self.infer_peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.infer_running.fetch_sub(1, Ordering::SeqCst);
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        if let Some(status) = self.scripted_failure(invocation) {
            return Ok(ToolOutput::failed(status, "simulated failure"));
        }
        self.simulate(invocation)?;
        Ok(ToolOutput::success())
    }
}

/// Notifier that keeps every message it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<DeliveryStatus> {
        self.messages.lock().unwrap().push(notification.clone());
        Ok(DeliveryStatus::Delivered)
    }
}

/// A temporary directory holding a run's inputs and outputs.
pub struct TestRun {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRun {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    /// Config writing artifacts under this directory, with no backoff.
    pub fn config(&self, batch_size: usize) -> Config {
        let mut config = Config {
            batch_size,
            run_date: Some("2024-05-01".to_string()),
            workdir: Some(self.path.join("work").display().to_string()),
            workers: 3,
            threads: 2,
            ..Default::default()
        };
        for settings in [
            &mut config.tasks.partition,
            &mut config.tasks.encode,
            &mut config.tasks.initial_build,
            &mut config.tasks.infer,
            &mut config.tasks.reroot,
        ] {
            settings.backoff_ms = 0;
        }
        config
    }

    /// Seed tree with the reference plus `n - 1` samples `seed01..`.
    pub fn seed_tree(&self, n: usize) -> PathBuf {
        let leaves = seed_names(n);
        let (left, right) = leaves.split_at(n / 2);
        let text = format!(
            "(({})[&support=1.0], {}):0.0;\n",
            left.iter().map(|l| format!("{}:0.1", l)).collect::<Vec<_>>().join(","),
            right.join(" , ")
        );
        self.write("seed.nwk", &text)
    }

    /// FASTA with every seed sample plus `new` unplaced samples `new01..`.
    pub fn sequences(&self, seeds: usize, new: usize) -> PathBuf {
        let mut names = seed_names(seeds);
        names.extend(new_names(new));
        let text: String = names
            .iter()
            .map(|n| format!(">{} collected\nACGTACGT\nACGT\n", n))
            .collect();
        self.write("sequences.fa", &text)
    }

    /// An existing tree and checkpoint over the first `n` seed samples.
    pub fn existing(&self, n: usize) -> (PathBuf, PathBuf) {
        let leaves = seed_names(n);
        let tree = self.write("previous.nwk", &flat_tree(&leaves));
        let checkpoint = self.write("previous.pb", &(leaves.join("\n") + "\n"));
        (tree, checkpoint)
    }

    fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, text).expect("Failed to write fixture");
        path
    }
}

pub fn seed_names(n: usize) -> Vec<String> {
    std::iter::once(REFERENCE.to_string())
        .chain((1..n).map(|i| format!("seed{:02}", i)))
        .take(n)
        .collect()
}

pub fn new_names(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("new{:02}", i)).collect()
}

pub fn flat_tree(leaves: &[String]) -> String {
    format!("({});\n", leaves.join(","))
}

pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = lines.join("\n");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

/// Event sink plus a task that collects everything sent to it.
pub fn collect_events() -> (EventSink, tokio::task::JoinHandle<Vec<PipelineEvent>>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (EventSink::new(tx), handle)
}
