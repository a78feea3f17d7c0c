//! Tool execution capability.
//!
//! The orchestration core never spawns processes directly. It hands an
//! [`Invocation`] to a [`ToolExecutor`] and gets back how the tool exited.
//! [`ProcessExecutor`] is the production implementation; tests substitute
//! in-process simulations.

use crate::core::task::{FailureKind, TaskKind};
use crate::error::Result;
use crate::{plog_debug, plog_trace};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Signal number the kernel OOM killer uses.
const SIGKILL: i32 = 9;

/// Exit codes 128+9 through 128+12, as shells and batch schedulers report
/// jobs killed for exceeding their memory allocation.
const RESOURCE_EXIT_CODES: std::ops::RangeInclusive<i32> = 137..=140;

/// Keep at most this many bytes of stderr in failure details.
const STDERR_TAIL_BYTES: usize = 2_048;

/// A fully rendered attempt of a task.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: String,
    pub kind: TaskKind,
    pub batch: Option<usize>,
    pub attempt: u32,
    pub memory_mb: u64,
    pub program: String,
    pub args: Vec<String>,
    pub inputs: BTreeMap<String, PathBuf>,
    pub outputs: BTreeMap<String, PathBuf>,
    pub params: BTreeMap<String, String>,
}

/// How a tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Code(i32),
    Signal(i32),
}

impl ExitOutcome {
    /// Classify a non-successful exit. `None` for success.
    pub fn classify(&self) -> Option<FailureKind> {
        match self {
            ExitOutcome::Success => None,
            ExitOutcome::Signal(SIGKILL) => Some(FailureKind::ResourceExhausted),
            ExitOutcome::Code(code) if RESOURCE_EXIT_CODES.contains(code) => {
                Some(FailureKind::ResourceExhausted)
            }
            ExitOutcome::Signal(_) | ExitOutcome::Code(_) => Some(FailureKind::TaskFailed),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "exit 0"),
            ExitOutcome::Code(code) => write!(f, "exit {}", code),
            ExitOutcome::Signal(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Success;
        }
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ExitOutcome::Signal(sig);
            }
        }
        ExitOutcome::Code(-1)
    }
}

/// Result of running one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: ExitOutcome,
    /// Tail of the tool's stderr.
    pub stderr: String,
}

impl ToolOutput {
    pub fn success() -> Self {
        Self {
            status: ExitOutcome::Success,
            stderr: String::new(),
        }
    }

    pub fn failed(status: ExitOutcome, stderr: &str) -> Self {
        Self {
            status,
            stderr: stderr.to_string(),
        }
    }
}

/// Capability to run an external tool.
///
/// Implementations must not interpret the outcome; classification and
/// policy belong to the runner. An `Err` means the invocation could not be
/// attempted at all.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    /// `prlimit` binary used to cap address space, when enforcement is on.
    prlimit: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap each child's address space at its memory budget.
    ///
    /// Silently falls back to advisory limits (environment only) when
    /// `prlimit` is not on `PATH`.
    pub fn with_memory_enforcement(mut self, enabled: bool) -> Self {
        self.prlimit = if enabled {
            which::which("prlimit").ok()
        } else {
            None
        };
        if enabled && self.prlimit.is_none() {
            plog_debug!("prlimit not found; memory budgets are advisory only");
        }
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = match &self.prlimit {
            Some(prlimit) => {
                let bytes = invocation.memory_mb.saturating_mul(1024 * 1024);
                let mut cmd = Command::new(prlimit);
                cmd.arg(format!("--as={}", bytes))
                    .arg("--")
                    .arg(&invocation.program);
                cmd
            }
            None => Command::new(&invocation.program),
        };
        cmd.args(&invocation.args)
            .env("PHYLOFOLD_MEMORY_MB", invocation.memory_mb.to_string())
            .env("PHYLOFOLD_ATTEMPT", invocation.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ToolExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput> {
        plog_debug!(
            "exec {} attempt={} memory={}MiB: {} {}",
            invocation.task,
            invocation.attempt,
            invocation.memory_mb,
            invocation.program,
            invocation.args.join(" ")
        );

        let output = match self.command(invocation).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolOutput::failed(
                    ExitOutcome::Code(127),
                    &format!("{}: program not found", invocation.program),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES);
        if !stderr.is_empty() {
            plog_trace!("{} stderr: {}", invocation.task, stderr);
        }
        Ok(ToolOutput {
            status: output.status.into(),
            stderr,
        })
    }
}

fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
