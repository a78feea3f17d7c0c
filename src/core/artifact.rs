//! Pipeline artifacts.
//!
//! Every artifact is an immutable, named file. Names are derived from the
//! run label and the producing step, so re-running a step with the same
//! inputs targets the same path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Collection of named sequences backed by a FASTA file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSet {
    pub name: String,
    pub path: PathBuf,
}

impl SequenceSet {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }
}

/// A phylogenetic tree in Newick text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub name: String,
    pub path: PathBuf,
}

impl Tree {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }
}

/// Per-position diff encoding of a batch, consumed by inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub name: String,
    pub path: PathBuf,
}

impl DiffFile {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }
}

/// Binary snapshot of the mutation-annotated tree.
///
/// Checkpoints form a linear chain: `version` counts the inference
/// transitions that produced it and `parent` names its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub path: PathBuf,
    pub version: u32,
    pub parent: Option<String>,
}

impl Checkpoint {
    /// A chain root: supplied externally or produced by the initial build.
    pub fn root(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            version: 0,
            parent: None,
        }
    }

    /// The checkpoint one transition after this one.
    pub fn successor(&self, name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            version: self.version + 1,
            parent: Some(self.name.clone()),
        }
    }
}

/// Bounded slice of a sequence set, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 1-based position in the chunk ordering.
    pub index: usize,
    pub sequences: SequenceSet,
    /// Sequence names in file order.
    pub names: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Deterministic artifact paths for one run.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    dir: PathBuf,
    label: String,
}

impl ArtifactNamer {
    pub fn new(dir: impl Into<PathBuf>, label: &str) -> Self {
        Self {
            dir: dir.into(),
            label: label.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn file(&self, stem: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.{}", self.label, stem, ext))
    }

    pub fn normalized_tree(&self) -> PathBuf {
        self.file("seed.normalized", "nwk")
    }

    pub fn matched(&self) -> PathBuf {
        self.file("matched", "fa")
    }

    pub fn unmatched(&self) -> PathBuf {
        self.file("unmatched", "fa")
    }

    pub fn seed_diff(&self) -> PathBuf {
        self.file("matched", "vcf")
    }

    pub fn initial_checkpoint(&self) -> PathBuf {
        self.file("initial", "pb")
    }

    pub fn initial_tree(&self) -> PathBuf {
        self.file("initial", "nwk")
    }

    pub fn batch_sequences(&self, index: usize) -> PathBuf {
        self.file(&format!("batch_{:04}", index), "fa")
    }

    pub fn batch_diff(&self, index: usize) -> PathBuf {
        self.file(&format!("batch_{:04}", index), "vcf")
    }

    pub fn batch_checkpoint(&self, index: usize) -> PathBuf {
        self.file(&format!("batch_{:04}", index), "pb")
    }

    pub fn batch_tree(&self, index: usize) -> PathBuf {
        self.file(&format!("batch_{:04}", index), "nwk")
    }

    pub fn rooted_tree(&self) -> PathBuf {
        self.file("rooted", "nwk")
    }

    pub fn report(&self) -> PathBuf {
        self.dir.join("run_report.json")
    }
}
