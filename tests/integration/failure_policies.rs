//! Failure classification and policy integration tests.
//!
//! These tests verify how resource exhaustion, tool failures and missing
//! dependencies propagate from a single attempt up to the run result.

use tokio_test::{assert_err, assert_ok};

use phylofold::core::task::{FailureKind, FailurePolicy, TaskKind};
use phylofold::newick;
use phylofold::orchestration::{FullBuildInputs, PipelineAssembler, UpdateInputs};
use phylofold::Error;

use crate::fixtures::{new_names, read_lines, SimulatedTools, TestRun};

fn full_build(run: &TestRun, seeds: usize, new: usize) -> FullBuildInputs {
    FullBuildInputs {
        sequences: run.sequences(seeds, new),
        seed_tree: run.seed_tree(seeds),
    }
}

fn update(run: &TestRun, known: usize, new: usize) -> UpdateInputs {
    let (tree, checkpoint) = run.existing(known);
    UpdateInputs {
        sequences: run.sequences(known, new),
        tree,
        checkpoint,
    }
}

/// Test: Outgroup absent from the final tree
/// Given a config naming an outgroup that is not a leaf
/// When the run reaches the finalizer
/// Then it fails with DependencyMissing and no rooted tree is written
#[tokio::test]
async fn test_absent_outgroup_is_dependency_missing() {
    let run = TestRun::new();
    let tools = SimulatedTools::new();
    let mut config = run.config(2);
    config.outgroup = "hCoV-19/absent/2020".to_string();
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.full_build(&full_build(&run, 10, 3)).await);

    assert!(matches!(err, Error::DependencyMissing(_)));
    assert_eq!(err.exit_code(), 5);
    assert!(!assembler.namer().rooted_tree().exists());
    assert!(!assembler.namer().report().exists());
    assert!(tools.calls_of(TaskKind::Reroot).is_empty());
    // Threading output is retained.
    assert!(assembler.namer().batch_checkpoint(2).exists());
}

/// Test: Inference killed on both allowed attempts
/// Given RetryThenIgnore with max_attempts 2 for inference
/// When batch 1's inference is SIGKILLed on attempts 1 and 2
/// Then the batch is skipped, the checkpoint is unchanged and the run completes
#[tokio::test]
async fn test_exhausted_inference_skips_batch() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().kill(TaskKind::Infer, Some(1), &[1, 2]);
    let mut config = run.config(10);
    config.tasks.infer.policy = FailurePolicy::RetryThenIgnore { max_attempts: 2 };
    let inputs = update(&run, 10, 3);
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let report = assert_ok!(assembler.incremental_update(&inputs).await);

    assert!(report.applied.is_empty());
    assert_eq!(report.skipped.len(), 1);
    let skipped = &report.skipped[0];
    assert_eq!(skipped.index, 1);
    assert_eq!(skipped.names, new_names(3));
    assert_eq!(skipped.reason, FailureKind::ResourceExhausted);
    assert_eq!(skipped.sequences, assembler.namer().batch_sequences(1));

    assert_eq!(report.final_checkpoint.path, inputs.checkpoint);
    assert_eq!(report.final_checkpoint.version, 0);

    let attempts = tools.calls_of(TaskKind::Infer);
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1].memory_mb > attempts[0].memory_mb);

    let leaves = newick::read_leaf_names(&report.final_tree.path).unwrap();
    assert_eq!(leaves.len(), 10);
}

/// Test: A skipped batch in the middle of the chain
/// Given three batches where batch 2's inference is exhausted
/// When the full build runs
/// Then batch 3 is applied on top of batch 1's checkpoint
#[tokio::test]
async fn test_skipped_batch_passes_checkpoint_through() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().kill(TaskKind::Infer, Some(2), &[1, 2]);
    let assembler = PipelineAssembler::new(run.config(2), tools.clone()).unwrap();

    let report = assert_ok!(assembler.full_build(&full_build(&run, 10, 5)).await);

    assert_eq!(report.applied, vec![1, 3]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, 2);
    assert_eq!(report.skipped[0].names, vec!["new03", "new04"]);

    let label = assembler.namer().label().to_string();
    assert_eq!(
        report.final_checkpoint.parent,
        Some(format!("{}.batch_0001", label))
    );
    assert_eq!(report.final_checkpoint.version, 2);
    assert_eq!(read_lines(&report.final_checkpoint.path).unwrap().len(), 13);
    assert!(report.summary().contains("skipped batch 2"));
}

/// Test: A non-memory inference failure is ignored without retry
#[tokio::test]
async fn test_inference_task_failure_ignored_immediately() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().fail(TaskKind::Infer, Some(1), 1);
    let assembler = PipelineAssembler::new(run.config(10), tools.clone()).unwrap();

    let report = assert_ok!(assembler.incremental_update(&update(&run, 10, 2)).await);

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, FailureKind::TaskFailed);
    assert_eq!(tools.calls_of(TaskKind::Infer).len(), 1);
}

/// Test: Resource exhaustion retried with a larger budget
#[tokio::test]
async fn test_partition_retry_escalates_memory() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().kill(TaskKind::Partition, None, &[1]);
    let config = run.config(10);
    let settings = config.tasks.partition.clone();
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    assert_ok!(assembler.incremental_update(&update(&run, 10, 2)).await);

    let calls = tools.calls_of(TaskKind::Partition);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].memory_mb, settings.resources().memory_mb(1));
    assert_eq!(calls[1].memory_mb, settings.resources().memory_mb(2));
    assert!(calls[1].memory_mb > calls[0].memory_mb);
}

/// Test: Exhausted retries under RetryThenTerminate abort the run
#[tokio::test]
async fn test_partition_exhausted_aborts() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().kill(TaskKind::Partition, None, &[1, 2, 3]);
    let mut config = run.config(10);
    config.tasks.partition.policy = FailurePolicy::RetryThenTerminate { max_attempts: 3 };
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.incremental_update(&update(&run, 10, 2)).await);

    match &err {
        Error::Task(failure) => {
            assert_eq!(failure.kind, TaskKind::Partition);
            assert_eq!(failure.classification, FailureKind::ResourceExhausted);
            assert_eq!(failure.attempts, 3);
            assert_eq!(failure.batch, None);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(tools.calls_of(TaskKind::Encode).is_empty());
}

/// Test: The initial build never retries
#[tokio::test]
async fn test_initial_build_terminates_immediately() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().kill(TaskKind::InitialBuild, None, &[1]);
    let mut config = run.config(2);
    config.tasks.initial_build.policy = FailurePolicy::RetryThenIgnore { max_attempts: 5 };
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.full_build(&full_build(&run, 10, 4)).await);

    assert_eq!(err.classification(), Some(FailureKind::ResourceExhausted));
    assert_eq!(tools.calls_of(TaskKind::InitialBuild).len(), 1);
    assert!(tools.calls_of(TaskKind::Infer).is_empty());
}

/// Test: Encoder failure aborts the run as soon as it happens
/// Given four single-sample batches where the last encoder exits with a non-memory error
/// When the full build threads the batches
/// Then the run fails naming batch 4 before any later inference starts
#[tokio::test]
async fn test_encoder_failure_aborts_run() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().fail(TaskKind::Encode, Some(4), 1);
    let mut config = run.config(1);
    config.workers = 4;
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.full_build(&full_build(&run, 10, 4)).await);

    match &err {
        Error::Task(failure) => {
            assert_eq!(failure.kind, TaskKind::Encode);
            assert_eq!(failure.batch, Some(4));
            assert_eq!(failure.classification, FailureKind::TaskFailed);
            assert!(err.to_string().contains("batch 4"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), 4);

    // At most batch 1's inference was in flight, and it was cancelled.
    let infer_batches: Vec<_> = tools
        .calls_of(TaskKind::Infer)
        .iter()
        .map(|c| c.batch)
        .collect();
    assert!(infer_batches.iter().all(|b| *b == Some(1)));
    assert!(infer_batches.len() <= 1);
    assert!(!assembler.namer().batch_checkpoint(1).exists());
    assert!(!assembler.namer().report().exists());
}

/// Test: Encoders still waiting for a worker never start after a failure
#[tokio::test]
async fn test_encoder_failure_cancels_queued_encoders() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().fail(TaskKind::Encode, Some(2), 1);
    let mut config = run.config(1);
    config.workers = 1;
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.full_build(&full_build(&run, 10, 5)).await);

    assert_eq!(err.classification(), Some(FailureKind::TaskFailed));
    let encoded: Vec<_> = tools
        .calls_of(TaskKind::Encode)
        .iter()
        .map(|c| c.batch)
        .collect();
    // Seed encoding, then batches 1 and 2 on the single worker.
    assert_eq!(encoded, vec![None, Some(1), Some(2)]);
    assert!(tools
        .calls_of(TaskKind::Infer)
        .iter()
        .all(|c| c.batch == Some(1)));
}

/// Test: Seed encoding is fatal even when encoding is configured to ignore
#[tokio::test]
async fn test_seed_encoding_failure_is_fatal() {
    let run = TestRun::new();
    let tools = SimulatedTools::new().fail(TaskKind::Encode, None, 2);
    let mut config = run.config(2);
    config.tasks.encode.policy = FailurePolicy::RetryThenIgnore { max_attempts: 2 };
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let err = assert_err!(assembler.full_build(&full_build(&run, 10, 2)).await);

    assert_eq!(err.classification(), Some(FailureKind::TaskFailed));
    assert!(tools.calls_of(TaskKind::InitialBuild).is_empty());
}

/// Test: Missing checkpoint fails before any tool runs
#[tokio::test]
async fn test_missing_checkpoint_is_dependency_missing() {
    let run = TestRun::new();
    let tools = SimulatedTools::new();
    let mut inputs = update(&run, 10, 2);
    inputs.checkpoint = run.path.join("does-not-exist.pb");
    let assembler = PipelineAssembler::new(run.config(10), tools.clone()).unwrap();

    let err = assert_err!(assembler.incremental_update(&inputs).await);

    assert!(matches!(err, Error::DependencyMissing(_)));
    assert!(tools.calls().is_empty());
}
