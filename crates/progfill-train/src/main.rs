//! CLI entry point for progfill-train.

use anyhow::Context;
use clap::Parser;

use progfill_core::{ModelDims, RunOptions, SynthConfig};
use progfill_eval::{CharTable, ConstStringDsl};
use progfill_train::baseline::PooledSeqModel;
use progfill_train::checkpoint::{hparam_run_id, CheckpointStore};
use progfill_train::collective::HostTopology;
use progfill_train::dashboard::JsonlDashboard;
use progfill_train::data::{BatchSource, SyntheticTaskSource, TaskBatch};
use progfill_train::logging;
use progfill_train::optim::{LearningRateFn, ScheduleSpec};
use progfill_train::parallel::{AdamHyper, ReplicaSet};
use progfill_train::run::{Orchestrator, RunSettings};

#[derive(Parser)]
#[command(
    name = "progfill-train",
    about = "Train a program synthesizer from I/O string examples"
)]
struct Cli {
    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(long, default_value = "1e-3")]
    lr: f64,

    #[arg(long, default_value = "1e-1")]
    weight_decay: f64,

    #[arg(long, default_value = "128")]
    embedding_dim: usize,

    #[arg(long, default_value = "512")]
    hidden_dim: usize,

    #[arg(long, default_value = "4")]
    num_heads: usize,

    #[arg(long, default_value = "3")]
    num_layers: usize,

    /// Location of the task dataset, e.g. `synthetic://16`.
    #[arg(long)]
    dataset_filepattern: Option<String>,

    #[arg(long, default_value = "16")]
    per_device_batch_size: usize,

    #[arg(long, default_value = "4")]
    num_strings_per_task: usize,

    #[arg(long, default_value = "10")]
    max_expressions: usize,

    #[arg(long, default_value = "50")]
    max_program_length: usize,

    #[arg(long, default_value = "100")]
    max_characters: usize,

    #[arg(long, default_value = "./runs")]
    save_dir: String,

    #[arg(long, default_value = "1500000")]
    num_train_steps: usize,

    #[arg(long, default_value = "10")]
    num_eval_steps: usize,

    #[arg(long, default_value = "1000")]
    log_freq: usize,

    #[arg(long, default_value = "1000")]
    checkpoint_freq: usize,

    /// Resume from the newest checkpoint in save-dir when one exists.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    restore_checkpoints: bool,

    #[arg(long, default_value = "1")]
    num_devices: usize,

    /// Pretty console logs instead of JSON.
    #[arg(long)]
    console: bool,
}

impl Cli {
    fn into_options(self) -> RunOptions {
        RunOptions {
            seed: self.seed,
            lr: self.lr,
            weight_decay: self.weight_decay,
            embedding_dim: self.embedding_dim,
            hidden_dim: self.hidden_dim,
            num_heads: self.num_heads,
            num_layers: self.num_layers,
            dataset_filepattern: self.dataset_filepattern,
            per_device_batch_size: self.per_device_batch_size,
            num_strings_per_task: self.num_strings_per_task,
            max_expressions: self.max_expressions,
            max_program_length: self.max_program_length,
            max_characters: self.max_characters,
            save_dir: self.save_dir,
            num_train_steps: self.num_train_steps,
            num_eval_steps: self.num_eval_steps,
            log_freq: self.log_freq,
            checkpoint_freq: self.checkpoint_freq,
            restore_checkpoints: self.restore_checkpoints,
            num_devices: self.num_devices,
        }
    }
}

/// Number of held-out batches behind a `synthetic://N` filepattern.
fn resolve_dataset_spec(pattern: &str) -> Result<usize, String> {
    match pattern.strip_prefix("synthetic://") {
        Some(n) => n
            .parse::<usize>()
            .map_err(|_| format!("Invalid held-out batch count in '{}'", pattern)),
        None => Err(format!(
            "Unknown dataset '{}'. External task pipelines are not wired in; \
             use synthetic://<held_out_batches>.",
            pattern
        )),
    }
}

fn collect_batches<S: BatchSource>(mut source: S) -> progfill_core::Result<Vec<TaskBatch>> {
    let mut batches = Vec::new();
    while let Some(batch) = source.next_batch()? {
        batches.push(batch);
    }
    Ok(batches)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.console {
        logging::init_console_logging();
    } else {
        logging::init_logging();
    }

    let opts = cli.into_options();
    if let Err(err) = opts.validate() {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
    let held_out = match resolve_dataset_spec(opts.dataset_filepattern.as_deref().unwrap_or("")) {
        Ok(n) => n,
        Err(message) => {
            tracing::error!("{}", message);
            std::process::exit(1);
        }
    };

    let table = CharTable::ascii_printable();
    let dsl = ConstStringDsl::new(table.clone(), 1, 2);
    let dims = ModelDims {
        emb_dim: opts.embedding_dim,
        hidden_dim: opts.hidden_dim,
        num_heads: opts.num_heads,
        num_layers: opts.num_layers,
        io_vocab_size: table.len() + 1,
        program_vocab_size: dsl.vocab_size(),
        num_strings_per_task: opts.num_strings_per_task,
        max_characters: opts.max_characters,
        max_program_length: opts.max_program_length,
        max_expressions: opts.max_expressions,
        bos_token: 1,
        eos_token: 2,
    };
    let config = SynthConfig::train(dims.clone(), 0.1);

    let topology = HostTopology::single_host(opts.num_devices)?;
    let replicas = ReplicaSet::with_optim(
        &config,
        topology,
        opts.seed,
        AdamHyper {
            weight_decay: opts.weight_decay,
            ..AdamHyper::default()
        },
        PooledSeqModel::build,
    )?;

    let lr_fn = LearningRateFn::new(ScheduleSpec {
        base_learning_rate: opts.lr,
        ..ScheduleSpec::default()
    })?;

    let run_id = hparam_run_id(&opts.hparam_pairs());
    let store = CheckpointStore::new(&opts.save_dir, &run_id);
    let dashboard = JsonlDashboard::create(
        std::path::Path::new(&opts.save_dir).join(&run_id),
    )
    .context("creating run dashboard")?;

    let batch_size = opts.batch_size();
    let mut train_source = SyntheticTaskSource::new(dsl.clone(), dims.clone(), batch_size, opts.seed);
    let eval_batches = collect_batches(
        SyntheticTaskSource::new(dsl.clone(), dims.clone(), batch_size, opts.seed + 1)
            .finite(opts.num_eval_steps),
    )?;
    // A tenth of the training batch keeps the beam widths affordable.
    let predict_batch = (batch_size / 10).max(1);
    let predict_batches = collect_batches(
        SyntheticTaskSource::new(dsl.clone(), dims, predict_batch, opts.seed + 2)
            .finite(held_out),
    )?;

    let mut orchestrator = Orchestrator::new(
        replicas,
        lr_fn,
        dsl,
        table,
        dashboard,
        Some(store),
        RunSettings::from_options(&opts),
        opts.seed,
    );
    if opts.restore_checkpoints {
        orchestrator.restore_if_present()?;
    }

    orchestrator.train(&mut train_source, &eval_batches, &predict_batches)?;
    tracing::info!(steps = opts.num_train_steps, "Training run complete");
    Ok(())
}
