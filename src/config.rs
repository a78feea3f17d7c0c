use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::{CommandTemplate, FailurePolicy, ResourcePolicy};
use crate::{plog_debug, Error, Result};

/// Reference sample used to root the final tree unless configured otherwise.
pub const DEFAULT_OUTGROUP: &str = "MN908947.3";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_THREADS: usize = 8;

/// Resource and failure settings for one task kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSettings {
    pub memory_base_mb: u64,
    pub memory_increment_mb: u64,
    #[serde(flatten)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl TaskSettings {
    pub fn resources(&self) -> ResourcePolicy {
        ResourcePolicy::new(self.memory_base_mb, self.memory_increment_mb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTable {
    #[serde(default = "default_partition_settings")]
    pub partition: TaskSettings,
    #[serde(default = "default_encode_settings")]
    pub encode: TaskSettings,
    #[serde(default = "default_initial_build_settings")]
    pub initial_build: TaskSettings,
    #[serde(default = "default_infer_settings")]
    pub infer: TaskSettings,
    #[serde(default = "default_reroot_settings")]
    pub reroot: TaskSettings,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self {
            partition: default_partition_settings(),
            encode: default_encode_settings(),
            initial_build: default_initial_build_settings(),
            infer: default_infer_settings(),
            reroot: default_reroot_settings(),
        }
    }
}

fn default_partition_settings() -> TaskSettings {
    TaskSettings {
        memory_base_mb: 2_048,
        memory_increment_mb: 2_048,
        policy: FailurePolicy::RetryThenTerminate { max_attempts: 3 },
        backoff_ms: 5_000,
    }
}

fn default_encode_settings() -> TaskSettings {
    TaskSettings {
        memory_base_mb: 2_048,
        memory_increment_mb: 4_096,
        policy: FailurePolicy::RetryThenTerminate { max_attempts: 3 },
        backoff_ms: 5_000,
    }
}

fn default_initial_build_settings() -> TaskSettings {
    TaskSettings {
        memory_base_mb: 32_768,
        memory_increment_mb: 16_384,
        policy: FailurePolicy::TerminateImmediately,
        backoff_ms: 0,
    }
}

fn default_infer_settings() -> TaskSettings {
    TaskSettings {
        memory_base_mb: 16_384,
        memory_increment_mb: 32_768,
        policy: FailurePolicy::RetryThenIgnore { max_attempts: 2 },
        backoff_ms: 10_000,
    }
}

fn default_reroot_settings() -> TaskSettings {
    TaskSettings {
        memory_base_mb: 4_096,
        memory_increment_mb: 4_096,
        policy: FailurePolicy::RetryThenTerminate { max_attempts: 2 },
        backoff_ms: 5_000,
    }
}

/// Command templates for the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolTable {
    #[serde(default = "default_partition_tool")]
    pub partition: CommandTemplate,
    #[serde(default = "default_encode_tool")]
    pub encode: CommandTemplate,
    #[serde(default = "default_initial_build_tool")]
    pub initial_build: CommandTemplate,
    #[serde(default = "default_infer_tool")]
    pub infer: CommandTemplate,
    #[serde(default = "default_reroot_tool")]
    pub reroot: CommandTemplate,
}

impl Default for ToolTable {
    fn default() -> Self {
        Self {
            partition: default_partition_tool(),
            encode: default_encode_tool(),
            initial_build: default_initial_build_tool(),
            infer: default_infer_tool(),
            reroot: default_reroot_tool(),
        }
    }
}

fn default_partition_tool() -> CommandTemplate {
    CommandTemplate::new(
        "partition-sequences",
        &[
            "--sequences", "{sequences}", "--tree", "{tree}",
            "--matched", "{matched}", "--unmatched", "{unmatched}",
        ],
    )
}

fn default_encode_tool() -> CommandTemplate {
    CommandTemplate::new("encode-diff", &["--input", "{sequences}", "--output", "{diff}"])
}

fn default_initial_build_tool() -> CommandTemplate {
    CommandTemplate::new(
        "infer-tree",
        &[
            "--tree", "{tree}", "--diff", "{diff}", "--threads", "{threads}",
            "--save-checkpoint", "{out_checkpoint}", "--write-tree", "{out_tree}",
        ],
    )
}

fn default_infer_tool() -> CommandTemplate {
    CommandTemplate::new(
        "infer-tree",
        &[
            "--checkpoint", "{checkpoint}", "--diff", "{diff}", "--threads", "{threads}",
            "--save-checkpoint", "{out_checkpoint}", "--write-tree", "{out_tree}",
        ],
    )
}

fn default_reroot_tool() -> CommandTemplate {
    CommandTemplate::new(
        "reroot-tree",
        &["--tree", "{tree}", "--outgroup", "{outgroup}", "--output", "{out_tree}"],
    )
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_outgroup() -> String {
    DEFAULT_OUTGROUP.to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Label stamped on every artifact name. Defaults to today's date.
    pub run_date: Option<String>,
    #[serde(default = "default_outgroup")]
    pub outgroup: String,
    pub notify_url: Option<String>,
    /// Concurrent encoding workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// CPU threads handed to each inference task.
    #[serde(default = "default_threads")]
    pub threads: usize,
    pub workdir: Option<String>,
    /// Cap each tool's address space at its memory budget via `prlimit`.
    #[serde(default)]
    pub enforce_memory: bool,
    #[serde(default)]
    pub tools: ToolTable,
    #[serde(default)]
    pub tasks: TaskTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            run_date: None,
            outgroup: default_outgroup(),
            notify_url: None,
            workers: DEFAULT_WORKERS,
            threads: DEFAULT_THREADS,
            workdir: None,
            enforce_memory: false,
            tools: ToolTable::default(),
            tasks: TaskTable::default(),
        }
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".phylofold"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// Load from `path`, or from `~/.phylofold/config.toml` when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };
        plog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            if explicit {
                return Err(Error::Validation(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            plog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        plog_debug!(
            "Config loaded: batch_size={}, workers={}, outgroup={}",
            config.batch_size,
            config.workers,
            config.outgroup
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Validation("workers must be positive".to_string()));
        }
        if self.outgroup.trim().is_empty() {
            return Err(Error::Validation("outgroup must not be empty".to_string()));
        }
        if let Some(label) = &self.run_date {
            if label.is_empty() || label.contains(['/', '\\']) {
                return Err(Error::Validation(format!(
                    "run_date '{}' is not a valid artifact label",
                    label
                )));
            }
        }
        Ok(())
    }

    /// Run-date label, defaulting to today's date.
    pub fn effective_run_date(&self) -> String {
        self.run_date
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string())
    }

    /// Work directory for this run's artifacts.
    pub fn effective_workdir(&self) -> PathBuf {
        let base = match &self.workdir {
            Some(dir) => expand_tilde(dir),
            None => PathBuf::from("phylofold-work"),
        };
        base.join(self.effective_run_date())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
