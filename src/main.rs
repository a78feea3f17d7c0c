use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use phylofold::config::Config;
use phylofold::orchestration::{
    EventSink, FullBuildInputs, PipelineAssembler, PipelineEvent, ProcessExecutor, UpdateInputs,
};
use phylofold::{plog, plog_debug, plog_error, plog_warn, Result, RunReport};

/// Phylofold - incremental phylogenetic tree builder
#[derive(Parser, Debug)]
#[command(name = "phylofold")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PHYLOFOLD_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Config file (default: ~/.phylofold/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (writes to <workdir>/phylofold.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build a tree from scratch, starting from a seed tree
    Build {
        /// All sequences (FASTA)
        #[arg(long)]
        sequences: PathBuf,

        /// Seed tree (Newick)
        #[arg(long)]
        seed_tree: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Fold new sequences into an existing checkpoint
    Update {
        /// Sequences to add (FASTA); already-placed ones are filtered out
        #[arg(long)]
        sequences: PathBuf,

        /// Tree matching the checkpoint (Newick)
        #[arg(long)]
        tree: PathBuf,

        /// Checkpoint to extend
        #[arg(long)]
        checkpoint: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line values that take precedence over the config file.
#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct Overrides {
    /// Maximum sequences per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Label stamped on artifact names (default: today)
    #[arg(long)]
    pub run_date: Option<String>,

    /// Leaf to root the final tree on
    #[arg(long)]
    pub outgroup: Option<String>,

    /// Webhook to post the completion message to
    #[arg(long)]
    pub notify_url: Option<String>,

    /// Base directory for run artifacts
    #[arg(long)]
    pub workdir: Option<String>,

    /// Concurrent encoding workers
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.run_date {
            config.run_date = Some(v);
        }
        if let Some(v) = self.outgroup {
            config.outgroup = v;
        }
        if let Some(v) = self.notify_url {
            config.notify_url = Some(v);
        }
        if let Some(v) = self.workdir {
            config.workdir = Some(v);
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
    }
}

enum Job {
    Build(FullBuildInputs),
    Update(UpdateInputs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            plog_error!("Run failed: {}", e);
            eprintln!("phylofold: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<RunReport> {
    let mut config = Config::load(cli.config.as_deref())?;
    let (job, overrides) = match cli.command {
        Command::Build {
            sequences,
            seed_tree,
            overrides,
        } => (
            Job::Build(FullBuildInputs {
                sequences,
                seed_tree,
            }),
            overrides,
        ),
        Command::Update {
            sequences,
            tree,
            checkpoint,
            overrides,
        } => (
            Job::Update(UpdateInputs {
                sequences,
                tree,
                checkpoint,
            }),
            overrides,
        ),
    };
    overrides.apply(&mut config);
    config.run_date = Some(config.effective_run_date());
    config.validate()?;

    let workdir = config.effective_workdir();
    std::fs::create_dir_all(&workdir)?;
    phylofold::log::init(&workdir, cli.debug);
    plog!(
        "phylofold {} starting in {}",
        env!("CARGO_PKG_VERSION"),
        workdir.display()
    );

    let executor = ProcessExecutor::new().with_memory_enforcement(config.enforce_memory);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (tx, mut rx) = mpsc::channel::<PipelineEvent>(256);
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match &event {
                    PipelineEvent::BatchSkipped { .. } | PipelineEvent::TaskRetrying { .. } => {
                        plog_warn!("{}", event)
                    }
                    PipelineEvent::TaskStarted { .. } => plog_debug!("{}", event),
                    _ => plog!("{}", event),
                }
            }
        });

        let assembler = PipelineAssembler::new(config, Arc::new(executor))?
            .with_events(EventSink::new(tx));
        let result = match &job {
            Job::Build(inputs) => assembler.full_build(inputs).await,
            Job::Update(inputs) => assembler.incremental_update(inputs).await,
        };
        drop(assembler);
        let _ = drain.await;
        result
    })
}

fn print_report(report: &RunReport) {
    println!();
    println!("{}", report.summary());
    if !report.skipped.is_empty() {
        println!();
        println!("Skipped batches can be resubmitted from:");
        for skipped in &report.skipped {
            println!("  {}  {}", skipped.index, skipped.sequences.display());
        }
    }
}
