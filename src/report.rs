//! Run report written at the end of every completed run.

use crate::core::artifact::{Checkpoint, Tree};
use crate::core::step::Step;
use crate::orchestration::threader::SkippedBatch;
use crate::{plog_debug, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tokio::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    FullBuild,
    IncrementalUpdate,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::FullBuild => write!(f, "full build"),
            RunMode::IncrementalUpdate => write!(f, "incremental update"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub run_date: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rooted tree, the run's main product.
    pub final_tree: Tree,
    /// Tree described by the final checkpoint, before rerooting.
    pub unrooted_tree: Tree,
    pub final_checkpoint: Checkpoint,
    /// Checkpoint chain from the starting checkpoint to the final one.
    pub checkpoints: Vec<Checkpoint>,
    pub batch_count: usize,
    pub applied: Vec<usize>,
    pub skipped: Vec<SkippedBatch>,
    pub notification: String,
    /// Ledger steps in dependency order.
    pub steps: Vec<Step>,
}

impl RunReport {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, json).await?;
        plog_debug!("Run report written to {}", path.display());
        Ok(())
    }

    pub fn skipped_indices(&self) -> Vec<usize> {
        self.skipped.iter().map(|s| s.index).collect()
    }

    /// Human-readable summary, also used as the notification body.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {}: {} batch(es), {} applied, {} skipped",
            self.mode,
            self.run_date,
            self.batch_count,
            self.applied.len(),
            self.skipped.len()
        );
        let _ = writeln!(
            out,
            "final checkpoint: {} (v{})",
            self.final_checkpoint.path.display(),
            self.final_checkpoint.version
        );
        let _ = write!(out, "rooted tree: {}", self.final_tree.path.display());
        for skipped in &self.skipped {
            let _ = write!(
                out,
                "\nskipped batch {} ({} at {}): {}",
                skipped.index,
                skipped.reason,
                skipped.stage,
                skipped.names.join(", ")
            );
        }
        out
    }
}
