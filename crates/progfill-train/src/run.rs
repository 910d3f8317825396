//! The main orchestration loop.
//!
//! Repeats train / checkpoint / report in that order. A reporting window
//! accumulates per-step metric sums and flushes them every `log_freq` steps
//! as normalized scalars, followed by an evaluation pass and one beam-decode
//! scoring pass per configured beam width. Checkpoints capture the
//! unreplicated lead-replica state so a restored run continues the step
//! counter and schedule exactly.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use progfill_core::{Result, RunOptions, SynthError};
use progfill_eval::{decode_io, eval_predicted, CharTable, ProgramExecutor};

use crate::beam::BeamSearchParams;
use crate::checkpoint::CheckpointStore;
use crate::collective::per_host_sum;
use crate::dashboard::DashboardSink;
use crate::data::{BatchSource, TaskBatch};
use crate::logging;
use crate::metrics::{safe_div, summarize, Metrics};
use crate::model::ProgramModel;
use crate::optim::LearningRateFn;
use crate::parallel::ReplicaSet;
use crate::rng::RngStream;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub num_train_steps: usize,
    pub num_eval_steps: usize,
    pub log_freq: usize,
    pub checkpoint_freq: usize,
    /// Beam widths scored during each reporting window.
    pub beam_sizes: Vec<usize>,
    /// Random text samples included with each scoring pass.
    pub num_text_samples: usize,
    pub length_penalty_alpha: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            num_eval_steps: 10,
            log_freq: 100,
            checkpoint_freq: 100,
            beam_sizes: vec![10, 100],
            num_text_samples: 8,
            length_penalty_alpha: 0.6,
        }
    }
}

impl RunSettings {
    pub fn from_options(opts: &RunOptions) -> Self {
        Self {
            num_train_steps: opts.num_train_steps,
            num_eval_steps: opts.num_eval_steps,
            log_freq: opts.log_freq,
            checkpoint_freq: opts.checkpoint_freq,
            ..Self::default()
        }
    }
}

/// Mutable loop state threaded explicitly between windows: metric sums
/// accumulated since the last flush and the throughput timer.
struct RunState {
    pending: Vec<Metrics>,
    tick: Instant,
}

pub struct Orchestrator<M, X, D> {
    replicas: ReplicaSet<M>,
    lr_fn: LearningRateFn,
    executor: X,
    io_table: CharTable,
    dashboard: D,
    store: Option<CheckpointStore>,
    settings: RunSettings,
    sample_rng: RngStream,
}

impl<M, X, D> Orchestrator<M, X, D>
where
    M: ProgramModel,
    X: ProgramExecutor,
    D: DashboardSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replicas: ReplicaSet<M>,
        lr_fn: LearningRateFn,
        executor: X,
        io_table: CharTable,
        dashboard: D,
        store: Option<CheckpointStore>,
        settings: RunSettings,
        sample_seed: u64,
    ) -> Self {
        Self {
            replicas,
            lr_fn,
            executor,
            io_table,
            dashboard,
            store,
            settings,
            sample_rng: RngStream::seeded(sample_seed),
        }
    }

    pub fn replicas(&self) -> &ReplicaSet<M> {
        &self.replicas
    }

    pub fn dashboard(&self) -> &D {
        &self.dashboard
    }

    /// Resume from the newest checkpoint when one exists.
    pub fn restore_if_present(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(step) = store.latest_step()? else {
            return Ok(());
        };
        let (optim_state, meta) = store.load(step, self.replicas.lead_varmap_mut())?;
        self.replicas.restore(&optim_state, meta.step)?;
        logging::log_checkpoint_restore(meta.step, &store.dir().display().to_string());
        Ok(())
    }

    /// Run the loop until `num_train_steps`.
    ///
    /// `eval_batches` and `predict_batches` are fixed sets revisited at every
    /// reporting window so scores stay comparable across the run.
    pub fn train<S: BatchSource>(
        &mut self,
        train_source: &mut S,
        eval_batches: &[TaskBatch],
        predict_batches: &[TaskBatch],
    ) -> Result<()> {
        let mut state = RunState {
            pending: Vec::new(),
            tick: Instant::now(),
        };

        while self.replicas.step() < self.settings.num_train_steps {
            let batch = train_source
                .next_batch()?
                .ok_or_else(|| SynthError::Data("training stream ended early".into()))?;
            let shards = batch.shard(&self.replicas.devices())?;
            state.pending.push(self.replicas.train_step(&shards, &self.lr_fn)?);

            let step = self.replicas.step();
            let finished = step == self.settings.num_train_steps;

            if step % self.settings.checkpoint_freq == 0 || finished {
                self.save_checkpoint(step)?;
            }
            if step % self.settings.log_freq == 0 || finished {
                self.report(step, &mut state, eval_batches, predict_batches)?;
            }
        }
        self.dashboard.flush()?;
        Ok(())
    }

    fn save_checkpoint(&mut self, step: usize) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if !self.replicas.topology().is_primary() {
            return Ok(());
        }
        let optim_state = self.replicas.lead_optim_state()?;
        let dir = store.save(
            step,
            self.replicas.lead_varmap(),
            &optim_state,
            self.replicas.config(),
        )?;
        logging::log_checkpoint_save(step, &dir.display().to_string());
        Ok(())
    }

    fn report(
        &mut self,
        step: usize,
        state: &mut RunState,
        eval_batches: &[TaskBatch],
        predict_batches: &[TaskBatch],
    ) -> Result<()> {
        let elapsed = state.tick.elapsed().as_secs_f64();
        let steps_per_second = if elapsed > 0.0 {
            state.pending.len() as f64 / elapsed
        } else {
            0.0
        };
        state.tick = Instant::now();

        let summary = summarize(&state.pending);
        state.pending.clear();
        logging::log_train_summary(step, &summary, steps_per_second);
        if self.replicas.topology().is_primary() {
            self.dashboard
                .scalar("train/steps_per_second", steps_per_second, step)?;
            self.dashboard.scalar("train/loss", summary.loss, step)?;
            self.dashboard.scalar("train/accuracy", summary.accuracy, step)?;
            self.dashboard
                .scalar("train/perplexity", summary.perplexity, step)?;
            self.dashboard
                .scalar("train/learning_rate", summary.learning_rate, step)?;
        }

        self.evaluate(step, eval_batches)?;
        for beam_size in self.settings.beam_sizes.clone() {
            self.predict(step, beam_size, predict_batches)?;
        }
        self.dashboard.flush()
    }

    fn evaluate(&mut self, step: usize, eval_batches: &[TaskBatch]) -> Result<()> {
        let devices = self.replicas.devices();
        let mut collected = Vec::new();
        for batch in eval_batches.iter().take(self.settings.num_eval_steps) {
            let shards = batch.shard(&devices)?;
            collected.push(self.replicas.eval_step(&shards)?);
        }
        let summary = summarize(&collected);
        logging::log_evaluation(step, &summary);
        if self.replicas.topology().is_primary() {
            self.dashboard.scalar("eval/loss", summary.loss, step)?;
            self.dashboard.scalar("eval/accuracy", summary.accuracy, step)?;
            self.dashboard.scalar("eval/perplexity", summary.perplexity, step)?;
        }
        Ok(())
    }

    fn predict(&mut self, step: usize, beam_size: usize, batches: &[TaskBatch]) -> Result<()> {
        let dims = self.replicas.config().dims.clone();
        let devices = self.replicas.devices();
        let params = BeamSearchParams {
            beam_size,
            alpha: self.settings.length_penalty_alpha,
            bos: dims.bos_token,
            eos: dims.eos_token,
            max_decode_len: dims.max_program_length,
        };

        let bar = ProgressBar::new(batches.len() as u64);
        if let Ok(style) =
            ProgressStyle::with_template("decoding [{bar:30}] {pos}/{len} batches")
        {
            bar.set_style(style);
        }

        let mut solved = 0usize;
        let mut total = 0usize;
        let mut samples: Vec<String> = Vec::new();

        for batch in batches {
            // Replicas need an even split; padded copies are scored too and
            // only the totals have to stay honest about it.
            let (padded, _real) = batch.pad_to_multiple(devices.len())?;
            let shards = padded.shard(&devices)?;
            let beams = self.replicas.predict_step(&shards, &params)?;

            let input_rows = padded.inputs.to_vec3::<u32>()?;
            let output_rows = padded.outputs.to_vec3::<u32>()?;
            let program_rows = padded.programs.to_vec2::<u32>()?;
            for (task, pool) in beams.iter().enumerate() {
                let (inputs, outputs, display) =
                    decode_io(&self.io_table, &input_rows[task], &output_rows[task]);
                let scored = eval_predicted(&self.executor, pool, &inputs, &outputs);
                if scored.solved {
                    solved += 1;
                }
                total += 1;
                let target = self
                    .executor
                    .decode(&program_rows[task])
                    .map(|p| self.executor.program_text(&p))
                    .unwrap_or_default();
                samples.push(format!(
                    "ios: {display}\n\ntarget: {target}\n\npredicted: {predicted}",
                    predicted = scored.program_text,
                ));
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let topology = self.replicas.topology();
        let n = topology.num_local_devices();
        let score = safe_div(
            per_host_sum(topology, &vec![solved as f64; n]),
            per_host_sum(topology, &vec![total as f64; n]),
        );
        logging::log_predict_score(step, beam_size, score);
        if !self.replicas.topology().is_primary() {
            return Ok(());
        }
        self.dashboard
            .scalar(&format!("predict/score-{beam_size}"), score, step)?;

        let mut chosen = Vec::new();
        for _ in 0..self.settings.num_text_samples.min(samples.len()) {
            let idx = self.sample_rng.gen_range(samples.len());
            chosen.push(samples.swap_remove(idx));
        }
        self.dashboard.text(
            &format!("predict/samples-{beam_size}"),
            &chosen.join("\n------\n"),
            step,
        )?;
        Ok(())
    }
}
