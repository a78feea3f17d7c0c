//! Checkpoint threading correctness.
//!
//! Encoding fans out across workers; inference must still run one batch at
//! a time, in batch order, and the result must not depend on the pool size.

use phylofold::core::task::TaskKind;
use phylofold::orchestration::{FullBuildInputs, PipelineAssembler};

use crate::fixtures::{read_lines, SimulatedTools, TestRun};

fn inputs(run: &TestRun, new: usize) -> FullBuildInputs {
    FullBuildInputs {
        sequences: run.sequences(10, new),
        seed_tree: run.seed_tree(10),
    }
}

/// Test: At most one inference in flight
/// Given 8 single-sample batches and 4 encoding workers
/// When the full build runs
/// Then inference calls never overlap and follow batch order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inference_is_strictly_sequential() {
    let run = TestRun::new();
    let tools = SimulatedTools::new();
    let mut config = run.config(1);
    config.workers = 4;
    let assembler = PipelineAssembler::new(config, tools.clone()).unwrap();

    let report = assembler.full_build(&inputs(&run, 8)).await.unwrap();

    assert_eq!(report.applied, (1..=8).collect::<Vec<_>>());
    assert_eq!(tools.infer_peak(), 1);
    let order: Vec<_> = tools
        .calls_of(TaskKind::Infer)
        .iter()
        .filter_map(|c| c.batch)
        .collect();
    assert_eq!(order, (1..=8).collect::<Vec<_>>());
    assert_eq!(tools.calls_of(TaskKind::Encode).len(), 9);
}

/// Test: Worker count does not change the final checkpoint
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_count_does_not_change_result() {
    let mut finals = Vec::new();
    for workers in [1, 4] {
        let run = TestRun::new();
        let mut config = run.config(2);
        config.workers = workers;
        let assembler = PipelineAssembler::new(config, SimulatedTools::new()).unwrap();

        let report = assembler.full_build(&inputs(&run, 7)).await.unwrap();
        finals.push((
            report.final_checkpoint.version,
            read_lines(&report.final_checkpoint.path).unwrap(),
        ));
    }
    assert_eq!(finals[0], finals[1]);
    assert_eq!(finals[0].0, 4);
}

/// Test: Every applied batch adds exactly one link to the checkpoint chain
#[tokio::test]
async fn test_checkpoint_chain_is_linear() {
    let run = TestRun::new();
    let assembler = PipelineAssembler::new(run.config(2), SimulatedTools::new()).unwrap();

    let report = assembler.full_build(&inputs(&run, 6)).await.unwrap();

    assert_eq!(report.checkpoints.len(), report.applied.len() + 1);
    for pair in report.checkpoints.windows(2) {
        assert_eq!(pair[1].version, pair[0].version + 1);
        assert_eq!(pair[1].parent.as_deref(), Some(pair[0].name.as_str()));
    }
    assert!(report.checkpoints[0].parent.is_none());
}

/// Test: The ledger orders the initial build before every inference
#[tokio::test]
async fn test_ledger_orders_steps() {
    let run = TestRun::new();
    let assembler = PipelineAssembler::new(run.config(3), SimulatedTools::new()).unwrap();

    let report = assembler.full_build(&inputs(&run, 6)).await.unwrap();

    let position = |name: &str| {
        report
            .steps
            .iter()
            .position(|s| s.name == name)
            .unwrap_or_else(|| panic!("missing step {}", name))
    };
    assert!(position("normalize_seed") < position("partition"));
    assert!(position("partition") < position("encode_seed"));
    assert!(position("initial_build") < position("infer_batch_0001"));
    assert!(position("infer_batch_0001") < position("infer_batch_0002"));
    assert!(position("encode_batch_0002") < position("infer_batch_0002"));
    assert!(position("infer_batch_0002") < position("reroot"));
}
