//! Finalizer: reroot the final tree on the outgroup, then notify.

use crate::config::{Config, TaskSettings};
use crate::core::artifact::{ArtifactNamer, Tree};
use crate::core::dag::DependencyType;
use crate::core::step::{Step, StepId};
use crate::core::task::{CommandTemplate, Task, TaskKind};
use crate::error::{Error, Result, TaskFailure};
use crate::newick;
use crate::orchestration::ledger::Ledger;
use crate::orchestration::runner::{TaskOutcome, TaskRunner};
use crate::{plog, plog_error, plog_warn};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion message for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn text(&self) -> String {
        if self.body.is_empty() {
            self.subject.clone()
        } else {
            format!("{}\n{}", self.subject, self.body)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The endpoint answered with a non-success status.
    Rejected { status: u16 },
    /// The message could not be sent at all.
    Failed { error: String },
    /// No channel configured.
    Skipped,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Rejected { status } => write!(f, "rejected with HTTP {}", status),
            DeliveryStatus::Failed { error } => write!(f, "failed: {}", error),
            DeliveryStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<DeliveryStatus>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to a chat-style incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<DeliveryStatus> {
        let text = notification.text();
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { text: &text })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(DeliveryStatus::Delivered)
        } else {
            Ok(DeliveryStatus::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

pub struct Finalizer {
    runner: TaskRunner,
    namer: ArtifactNamer,
    ledger: Ledger,
    tool: CommandTemplate,
    settings: TaskSettings,
    outgroup: String,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Finalizer {
    pub fn new(runner: TaskRunner, config: &Config, namer: ArtifactNamer, ledger: Ledger) -> Self {
        Self {
            runner,
            namer,
            ledger,
            tool: config.tools.reroot.clone(),
            settings: config.tasks.reroot.clone(),
            outgroup: config.outgroup.clone(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Reroot `tree` on the configured outgroup.
    ///
    /// # Errors
    /// `DependencyMissing` when the tree file is absent or the outgroup is
    /// not one of its leaves; no rooted tree is written in that case.
    pub async fn reroot(&self, tree: &Tree, upstream: Option<StepId>) -> Result<(Tree, StepId)> {
        let deps: Vec<_> = upstream
            .map(|id| (id, DependencyType::DataFlow))
            .into_iter()
            .collect();
        let step = self
            .ledger
            .open(Step::new("reroot", TaskKind::Reroot), &deps)
            .await?;

        if let Err(e) = self.check_outgroup(tree).await {
            plog_error!("{}", e);
            self.ledger.fail(&step, &e.to_string(), 0).await;
            return Err(e);
        }

        let output = self.namer.rooted_tree();
        let task = Task::new("reroot", TaskKind::Reroot, self.tool.clone(), &self.settings)
            .with_policy(self.settings.policy.fatal())
            .input("tree", &tree.path)
            .output("out_tree", &output)
            .param("outgroup", &self.outgroup);

        let outcome = match self.runner.run(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let attempts = match &e {
                    Error::Task(failure) => failure.attempts,
                    _ => 0,
                };
                self.ledger.fail(&step, &e.to_string(), attempts).await;
                return Err(e);
            }
        };
        let attempts = outcome.attempt_count();
        match outcome {
            TaskOutcome::Completed { .. } => {
                self.ledger.complete(&step, attempts).await;
                plog!("Rerooted {} on {} -> {}", tree.name, self.outgroup, output.display());
                Ok((Tree::new(&format!("{}.rooted", self.namer.label()), output), step))
            }
            TaskOutcome::Ignored { reason, detail, .. } => {
                let failure = TaskFailure {
                    task: task.name.clone(),
                    kind: TaskKind::Reroot,
                    batch: None,
                    classification: reason,
                    attempts,
                    detail,
                };
                self.ledger
                    .fail(&step, &failure.to_string(), failure.attempts)
                    .await;
                Err(Error::Task(failure))
            }
        }
    }

    async fn check_outgroup(&self, tree: &Tree) -> Result<()> {
        if !tokio::fs::try_exists(&tree.path).await? {
            return Err(Error::DependencyMissing(format!(
                "tree to reroot not found: {}",
                tree.path.display()
            )));
        }
        let path = tree.path.clone();
        let leaves = tokio::task::spawn_blocking(move || newick::read_leaf_names(&path))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))??;
        if !leaves.iter().any(|leaf| leaf == &self.outgroup) {
            return Err(Error::DependencyMissing(format!(
                "outgroup '{}' is not a leaf of {} ({} leaves)",
                self.outgroup,
                tree.name,
                leaves.len()
            )));
        }
        Ok(())
    }

    /// Send the completion notification. Never fails the run.
    pub async fn notify(&self, notification: &Notification, upstream: Option<StepId>) -> DeliveryStatus {
        let Some(notifier) = &self.notifier else {
            return DeliveryStatus::Skipped;
        };
        let deps: Vec<_> = upstream
            .map(|id| (id, DependencyType::DataFlow))
            .into_iter()
            .collect();
        let step = self
            .ledger
            .open(Step::new("notify", TaskKind::Notify), &deps)
            .await
            .ok();

        let status = match notifier.notify(notification).await {
            Ok(status) => status,
            Err(e) => DeliveryStatus::Failed {
                error: e.to_string(),
            },
        };
        if let Some(step) = step {
            match &status {
                DeliveryStatus::Delivered | DeliveryStatus::Skipped => {
                    self.ledger.complete(&step, 1).await
                }
                other => self.ledger.skip(&step, &other.to_string(), 1).await,
            }
        }
        match &status {
            DeliveryStatus::Delivered => plog!("Notification delivered"),
            DeliveryStatus::Skipped => {}
            other => plog_warn!("Notification not delivered: {}", other),
        }
        status
    }
}
