//! Orchestration layer for the tree-building pipeline.
//!
//! Tool invocation sits behind [`ToolExecutor`]; the [`TaskRunner`] turns
//! a task into attempts under its failure policy; the
//! [`CheckpointThreader`] folds batches into the checkpoint chain; the
//! [`PipelineAssembler`] wires both run modes together and hands the result
//! to the [`Finalizer`].

pub mod chunker;
mod events;
mod executor;
mod finalizer;
mod ledger;
mod pipeline;
mod runner;
pub mod threader;

pub use chunker::{chunk, chunk_sequences, Chunk};
pub use events::{EventSink, PipelineEvent};
pub use executor::{ExitOutcome, Invocation, ProcessExecutor, ToolExecutor, ToolOutput};
pub use finalizer::{DeliveryStatus, Finalizer, Notification, Notifier, WebhookNotifier};
pub use ledger::Ledger;
pub use pipeline::{FullBuildInputs, PipelineAssembler, UpdateInputs};
pub use runner::{TaskOutcome, TaskRunner};
pub use threader::{CheckpointThreader, SkippedBatch, ThreadLinks, ThreaderState, ThreadingResult};
