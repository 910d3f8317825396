//! End-to-end engine tests: the full train / checkpoint / report loop on the
//! synthetic constant-string tasks, plus checkpoint-resume exactness.

use std::collections::BTreeMap;

use candle_core::Device;
use progfill_core::{ModelDims, SynthConfig};
use progfill_eval::{CharTable, ConstStringDsl};
use progfill_train::baseline::PooledSeqModel;
use progfill_train::checkpoint::CheckpointStore;
use progfill_train::collective::HostTopology;
use progfill_train::dashboard::MemoryDashboard;
use progfill_train::data::{BatchSource, SyntheticTaskSource, TaskBatch};
use progfill_train::optim::{LearningRateFn, ScheduleSpec};
use progfill_train::parallel::ReplicaSet;
use progfill_train::run::{Orchestrator, RunSettings};

fn dsl() -> ConstStringDsl {
    ConstStringDsl::new(CharTable::ascii_printable(), 1, 2)
}

fn dims() -> ModelDims {
    ModelDims {
        emb_dim: 8,
        hidden_dim: 16,
        num_heads: 2,
        num_layers: 1,
        io_vocab_size: CharTable::ascii_printable().len() + 1,
        program_vocab_size: dsl().vocab_size(),
        num_strings_per_task: 2,
        max_characters: 10,
        max_program_length: 8,
        max_expressions: 2,
        bos_token: 1,
        eos_token: 2,
    }
}

fn settings(num_train_steps: usize) -> RunSettings {
    RunSettings {
        num_train_steps,
        num_eval_steps: 2,
        log_freq: 2,
        checkpoint_freq: 2,
        beam_sizes: vec![2],
        num_text_samples: 3,
        length_penalty_alpha: 0.6,
    }
}

fn lr_fn() -> LearningRateFn {
    LearningRateFn::new(ScheduleSpec {
        base_learning_rate: 1e-2,
        warmup_steps: 4,
        ..ScheduleSpec::default()
    })
    .unwrap()
}

fn batches(seed: u64, batch_size: usize, count: usize) -> Vec<TaskBatch> {
    let mut source = SyntheticTaskSource::new(dsl(), dims(), batch_size, seed).finite(count);
    let mut out = Vec::new();
    while let Some(b) = source.next_batch().unwrap() {
        out.push(b);
    }
    out
}

fn orchestrator(
    num_devices: usize,
    num_train_steps: usize,
    store: Option<CheckpointStore>,
) -> Orchestrator<PooledSeqModel, ConstStringDsl, MemoryDashboard> {
    let config = SynthConfig::train(dims(), 0.1);
    let topology = HostTopology::single_host(num_devices).unwrap();
    let replicas = ReplicaSet::new(&config, topology, 0, PooledSeqModel::build).unwrap();
    Orchestrator::new(
        replicas,
        lr_fn(),
        dsl(),
        CharTable::ascii_printable(),
        MemoryDashboard::new(),
        store,
        settings(num_train_steps),
        7,
    )
}

fn lead_params(orc: &Orchestrator<PooledSeqModel, ConstStringDsl, MemoryDashboard>) -> Vec<(String, Vec<f32>)> {
    let data = orc.replicas().lead_varmap().data().lock().unwrap();
    let mut params: Vec<(String, Vec<f32>)> = data
        .iter()
        .map(|(name, var)| {
            let flat = var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            (name.clone(), flat)
        })
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

#[test]
fn test_full_loop_reports_on_cadence() {
    let mut orc = orchestrator(2, 4, None);
    let mut train = SyntheticTaskSource::new(dsl(), dims(), 8, 0);
    let eval = batches(1, 8, 2);
    let predict = batches(2, 3, 2);

    orc.train(&mut train, &eval, &predict).unwrap();
    assert_eq!(orc.replicas().step(), 4);

    let dash = orc.dashboard();
    let train_loss = dash.scalar_values("train/loss");
    assert_eq!(
        train_loss.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
        vec![2, 4],
        "reports fire every log_freq steps, never at step 1"
    );
    for (_, v) in &train_loss {
        assert!(v.is_finite() && *v >= 0.0);
    }

    let train_ppl = dash.scalar_values("train/perplexity");
    assert_eq!(train_ppl.len(), 2);
    for (_, v) in &train_ppl {
        assert!(*v >= 1.0 - 1e-9 && *v <= 1.0e4);
    }
    assert_eq!(dash.scalar_values("train/steps_per_second").len(), 2);

    let eval_loss = dash.scalar_values("eval/loss");
    assert_eq!(eval_loss.len(), 2);
    for (_, v) in dash.scalar_values("eval/perplexity") {
        assert!(v >= 1.0 - 1e-9 && v <= 1.0e4);
    }

    let scores = dash.scalar_values("predict/score-2");
    assert_eq!(scores.len(), 2);
    for (_, v) in &scores {
        assert!((0.0..=1.0).contains(v));
    }

    let texts = dash.texts();
    let samples: Vec<_> = texts
        .iter()
        .filter(|(tag, _, _)| tag == "predict/samples-2")
        .collect();
    assert_eq!(samples.len(), 2);
    assert!(samples[0].1.contains("ios: "));
    assert!(samples[0].1.contains("target: "));
    assert!(samples[0].1.contains("predicted:"));
}

#[test]
fn test_non_primary_host_keeps_the_dashboard_quiet() {
    let mut hosts = BTreeMap::new();
    hosts.insert(0, vec![0]);
    hosts.insert(1, vec![1]);
    let topology = HostTopology::with_hosts(1, hosts, vec![Device::Cpu]).unwrap();
    let config = SynthConfig::train(dims(), 0.1);
    let replicas = ReplicaSet::new(&config, topology, 0, PooledSeqModel::build).unwrap();
    let mut orc = Orchestrator::new(
        replicas,
        lr_fn(),
        dsl(),
        CharTable::ascii_printable(),
        MemoryDashboard::new(),
        None,
        settings(2),
        7,
    );
    let mut train = SyntheticTaskSource::new(dsl(), dims(), 4, 11);
    let eval = batches(12, 4, 1);
    let predict = batches(13, 2, 1);

    orc.train(&mut train, &eval, &predict).unwrap();
    assert_eq!(orc.replicas().step(), 2);
    assert!(orc.dashboard().scalars().is_empty());
    assert!(orc.dashboard().texts().is_empty());
}

#[test]
fn test_checkpoint_resume_restores_step_and_params() {
    let tmp = tempfile::tempdir().unwrap();
    let run_id = "lr=0.01,seed=0";

    let mut first = orchestrator(1, 4, Some(CheckpointStore::new(tmp.path(), run_id)));
    let mut train = SyntheticTaskSource::new(dsl(), dims(), 4, 0);
    let eval = batches(1, 4, 1);
    let predict = batches(2, 2, 1);
    first.train(&mut train, &eval, &predict).unwrap();
    let trained = lead_params(&first);

    // A fresh process with the same store picks up at the saved step with
    // the saved parameters, bit for bit.
    let mut second = orchestrator(1, 6, Some(CheckpointStore::new(tmp.path(), run_id)));
    second.restore_if_present().unwrap();
    assert_eq!(second.replicas().step(), 4);
    assert_eq!(lead_params(&second), trained);

    // And training continues to the new horizon.
    let mut train = SyntheticTaskSource::new(dsl(), dims(), 4, 9);
    second.train(&mut train, &eval, &predict).unwrap();
    assert_eq!(second.replicas().step(), 6);
    assert_ne!(lead_params(&second), trained);
}

#[test]
fn test_restore_without_checkpoints_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let mut orc = orchestrator(1, 2, Some(CheckpointStore::new(tmp.path(), "lr=0.01,seed=0")));
    orc.restore_if_present().unwrap();
    assert_eq!(orc.replicas().step(), 0);
}

#[test]
fn test_training_metrics_stay_sane_over_a_longer_run() {
    let mut orc = orchestrator(1, 10, None);
    let mut train = SyntheticTaskSource::new(dsl(), dims(), 8, 3);
    let eval = batches(4, 8, 2);
    let predict = batches(5, 2, 1);

    orc.train(&mut train, &eval, &predict).unwrap();
    for (_, v) in orc.dashboard().scalar_values("train/loss") {
        assert!(v.is_finite() && v >= 0.0);
    }
    for (_, v) in orc.dashboard().scalar_values("train/accuracy") {
        assert!((0.0..=1.0).contains(&v));
    }
    let lrs = orc.dashboard().scalar_values("train/learning_rate");
    assert!(lrs.iter().all(|(_, v)| *v > 0.0));
}
