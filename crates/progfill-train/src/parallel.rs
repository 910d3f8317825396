//! Replicated model state and the three step functions.
//!
//! Each device owns a full copy of the parameters, the optimizer moments and
//! an RNG stream; training fans the sharded batch out across replicas with
//! rayon, averages gradients through the collective layer and applies the
//! identical update everywhere, so replicas never drift. Replica 0 is the
//! lead copy used for checkpoints and broadcasts.

use candle_core::{Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rayon::prelude::*;

use progfill_core::{Result, SynthConfig, SynthError};

use crate::beam::{beam_search, flat_batch_beam_expand, BeamSearchParams};
use crate::collective::{reduce_mean_grads, reduce_sum_metrics, HostTopology};
use crate::data::TaskBatch;
use crate::metrics::{compute_metrics, compute_weighted_cross_entropy, padding_mask, Metrics};
use crate::model::ProgramModel;
use crate::optim::{AdamW, AdamWState, LearningRateFn};
use crate::rng::RngStream;

/// Adam moments configuration.
#[derive(Debug, Clone)]
pub struct AdamHyper {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamHyper {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
            weight_decay: 0.0,
        }
    }
}

struct Replica<M> {
    device: Device,
    varmap: VarMap,
    /// Name-sorted; every replica shares this order.
    param_names: Vec<String>,
    model: M,
    optim: AdamW,
    rng: RngStream,
}

impl<M> Replica<M> {
    fn params(&self) -> Vec<candle_core::Var> {
        let data = self.varmap.data().lock().unwrap();
        self.param_names
            .iter()
            .map(|n| data[n].clone())
            .collect()
    }
}

pub struct ReplicaSet<M> {
    replicas: Vec<Replica<M>>,
    topology: HostTopology,
    config: SynthConfig,
    step: usize,
}

impl<M: ProgramModel> ReplicaSet<M> {
    pub fn new<F>(
        config: &SynthConfig,
        topology: HostTopology,
        seed: u64,
        model_fn: F,
    ) -> Result<Self>
    where
        F: Fn(&SynthConfig, VarBuilder) -> Result<M>,
    {
        Self::with_optim(config, topology, seed, AdamHyper::default(), model_fn)
    }

    pub fn with_optim<F>(
        config: &SynthConfig,
        topology: HostTopology,
        seed: u64,
        hyper: AdamHyper,
        model_fn: F,
    ) -> Result<Self>
    where
        F: Fn(&SynthConfig, VarBuilder) -> Result<M>,
    {
        let mut base_rng = RngStream::fold_in(seed, topology.host_id() as u64);
        let mut replicas = Vec::with_capacity(topology.num_local_devices());

        for device in topology.local_devices() {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, device);
            let model = model_fn(config, vb)?;

            let mut param_names: Vec<String> = {
                let data = varmap.data().lock().unwrap();
                data.keys().cloned().collect()
            };
            param_names.sort();

            let vars = {
                let data = varmap.data().lock().unwrap();
                param_names.iter().map(|n| data[n].clone()).collect()
            };
            let optim = AdamW::new(vars, hyper.beta1, hyper.beta2, hyper.eps, hyper.weight_decay)?;

            replicas.push(Replica {
                device: device.clone(),
                varmap,
                param_names,
                model,
                optim,
                rng: base_rng.split(),
            });
        }

        let mut set = Self {
            replicas,
            topology,
            config: config.clone(),
            step: 0,
        };
        // Replicas initialized independently; make replica 0 the truth.
        set.broadcast_params()?;
        Ok(set)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn topology(&self) -> &HostTopology {
        &self.topology
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn devices(&self) -> Vec<Device> {
        self.replicas.iter().map(|r| r.device.clone()).collect()
    }

    pub fn lead_varmap(&self) -> &VarMap {
        &self.replicas[0].varmap
    }

    pub fn lead_varmap_mut(&mut self) -> &mut VarMap {
        &mut self.replicas[0].varmap
    }

    pub fn lead_optim_state(&self) -> Result<AdamWState> {
        self.replicas[0].optim.export_state()
    }

    /// Copy replica 0's parameters onto every other replica.
    pub fn broadcast_params(&mut self) -> Result<()> {
        let lead: Vec<Tensor> = self.replicas[0]
            .params()
            .iter()
            .map(|v| v.as_tensor().clone())
            .collect();
        for replica in self.replicas.iter_mut().skip(1) {
            for (var, tensor) in replica.params().iter().zip(&lead) {
                var.set(&tensor.to_device(&replica.device)?)?;
            }
        }
        Ok(())
    }

    /// Rehydrate optimizer moments and the step counter after a restore.
    /// Assumes the lead varmap was already loaded from the checkpoint.
    pub fn restore(&mut self, optim_state: &AdamWState, step: usize) -> Result<()> {
        self.broadcast_params()?;
        for replica in &mut self.replicas {
            replica.optim.import_state(optim_state)?;
        }
        self.step = step;
        Ok(())
    }

    fn check_shards(&self, shards: &[TaskBatch]) -> Result<()> {
        if shards.len() != self.replicas.len() {
            return Err(SynthError::Data(format!(
                "got {} shards for {} replicas",
                shards.len(),
                self.replicas.len()
            )));
        }
        Ok(())
    }

    /// One synchronized optimization step over per-device shards.
    ///
    /// The learning rate is read at the pre-increment step so a restored run
    /// continues the schedule exactly where it left off.
    pub fn train_step(&mut self, shards: &[TaskBatch], lr_fn: &LearningRateFn) -> Result<Metrics> {
        self.check_shards(shards)?;
        let lr = lr_fn.rate(self.step);
        let mode = self.config.mode;

        let results: Vec<(Vec<Option<Tensor>>, Metrics)> = self
            .replicas
            .par_iter_mut()
            .zip(shards.par_iter())
            .map(|(replica, shard)| -> Result<(Vec<Option<Tensor>>, Metrics)> {
                let dropout_seed = replica.rng.next_seed();
                let weights = padding_mask(&shard.programs)?;
                let logits = replica.model.full_forward(
                    &shard.inputs,
                    &shard.outputs,
                    &shard.programs,
                    &mode,
                    Some(dropout_seed),
                )?;

                let (loss_sum, denominator) =
                    compute_weighted_cross_entropy(&logits, &shard.programs, Some(&weights))?;
                let denom = (denominator.to_scalar::<f32>()? as f64).max(1.0);
                let mean_loss = (loss_sum / denom)?;

                let grad_store = mean_loss.backward()?;
                let params = replica.params();
                let grads: Vec<Option<Tensor>> = params
                    .iter()
                    .map(|v| grad_store.get(v.as_tensor()).cloned())
                    .collect();

                let metrics =
                    compute_metrics(&logits.detach(), &shard.programs, &weights)?;
                Ok((grads, metrics))
            })
            .collect::<Result<Vec<_>>>()?;

        let (per_replica_grads, per_replica_metrics): (Vec<_>, Vec<_>) =
            results.into_iter().unzip();

        let devices = self.devices();
        let reduced = reduce_mean_grads(&per_replica_grads, &devices)?;
        for (replica, grads) in self.replicas.iter_mut().zip(&reduced) {
            replica.optim.step(grads, lr)?;
        }
        self.step += 1;

        let mut total = reduce_sum_metrics(&per_replica_metrics);
        total.learning_rate = Some(lr);
        Ok(total)
    }

    /// Deterministic forward over per-device shards; no parameter update.
    pub fn eval_step(&self, shards: &[TaskBatch]) -> Result<Metrics> {
        self.check_shards(shards)?;
        let mode = self.config.eval().mode;

        let per_replica: Vec<Metrics> = self
            .replicas
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| -> Result<Metrics> {
                let weights = padding_mask(&shard.programs)?;
                let logits = replica.model.full_forward(
                    &shard.inputs,
                    &shard.outputs,
                    &shard.programs,
                    &mode,
                    None,
                )?;
                compute_metrics(&logits, &shard.programs, &weights)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(reduce_sum_metrics(&per_replica))
    }

    /// Beam-decode per-device shards. Returns, per task in shard order,
    /// `beam_size` candidate token sequences with the best candidate last.
    pub fn predict_step(
        &self,
        shards: &[TaskBatch],
        params: &BeamSearchParams,
    ) -> Result<Vec<Vec<Vec<u32>>>> {
        self.check_shards(shards)?;

        let per_replica: Vec<Vec<Vec<Vec<u32>>>> = self
            .replicas
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| -> Result<Vec<Vec<Vec<u32>>>> {
                let batch = shard.batch_size()?;
                let (encoded, mask) = replica.model.encode(&shard.inputs, &shard.outputs)?;
                let encoded = flat_batch_beam_expand(&encoded, params.beam_size)?;
                let mask = flat_batch_beam_expand(&mask, params.beam_size)?;

                let mut cache = replica
                    .model
                    .init_cache(params.max_decode_len, &replica.device);
                let beams = beam_search(batch, params, &replica.device, |tokens, parents| {
                    if let Some(parents) = parents {
                        cache.reorder(parents)?;
                    }
                    replica.model.decode_step(tokens, &encoded, &mask, &mut cache)
                })?;

                Ok(beams
                    .into_iter()
                    .map(|pool| pool.into_iter().map(|h| h.tokens).collect())
                    .collect())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(per_replica.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::PooledSeqModel;
    use crate::data::{BatchSource, SyntheticTaskSource};
    use crate::optim::ScheduleSpec;
    use progfill_core::ModelDims;
    use progfill_eval::{CharTable, ConstStringDsl};

    fn dims() -> ModelDims {
        let dsl = dsl();
        ModelDims {
            emb_dim: 8,
            hidden_dim: 16,
            num_heads: 2,
            num_layers: 1,
            io_vocab_size: CharTable::ascii_printable().len() + 1,
            program_vocab_size: dsl.vocab_size(),
            num_strings_per_task: 2,
            max_characters: 10,
            max_program_length: 8,
            max_expressions: 2,
            bos_token: 1,
            eos_token: 2,
        }
    }

    fn dsl() -> ConstStringDsl {
        ConstStringDsl::new(CharTable::ascii_printable(), 1, 2)
    }

    fn replica_set(num_devices: usize) -> ReplicaSet<PooledSeqModel> {
        let config = SynthConfig::train(dims(), 0.1);
        let topology = HostTopology::single_host(num_devices).unwrap();
        ReplicaSet::new(&config, topology, 0, PooledSeqModel::build).unwrap()
    }

    fn lr_fn() -> LearningRateFn {
        LearningRateFn::new(ScheduleSpec {
            base_learning_rate: 1e-2,
            warmup_steps: 2,
            ..ScheduleSpec::default()
        })
        .unwrap()
    }

    #[test]
    fn test_replicas_agree_after_init_and_train() {
        let mut set = replica_set(2);
        let mut source = SyntheticTaskSource::new(dsl(), dims(), 4, 0);
        let lr = lr_fn();

        for _ in 0..3 {
            let batch = source.next_batch().unwrap().unwrap();
            let shards = batch.shard(&set.devices()).unwrap();
            let metrics = set.train_step(&shards, &lr).unwrap();
            assert!(metrics.denominator > 0.0);
            assert!(metrics.loss.is_finite());
        }
        assert_eq!(set.step(), 3);

        // Identical updates everywhere: compare a parameter across replicas.
        let lead = set.replicas[0].params();
        let other = set.replicas[1].params();
        for (a, b) in lead.iter().zip(&other) {
            let diff = (a.as_tensor() - b.as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-6, "replicas drifted by {diff}");
        }
    }

    #[test]
    fn test_eval_step_is_deterministic_and_readonly() {
        let set = replica_set(1);
        let mut source = SyntheticTaskSource::new(dsl(), dims(), 2, 1);
        let batch = source.next_batch().unwrap().unwrap();
        let shards = batch.shard(&set.devices()).unwrap();

        let a = set.eval_step(&shards).unwrap();
        let b = set.eval_step(&shards).unwrap();
        assert_eq!(a.loss, b.loss);
        assert_eq!(a.accuracy, b.accuracy);
        assert!(a.learning_rate.is_none());
    }

    #[test]
    fn test_predict_step_yields_beam_size_candidates() {
        let set = replica_set(1);
        let mut source = SyntheticTaskSource::new(dsl(), dims(), 2, 2);
        let batch = source.next_batch().unwrap().unwrap();
        let shards = batch.shard(&set.devices()).unwrap();

        let params = BeamSearchParams {
            beam_size: 3,
            alpha: 0.6,
            bos: 1,
            eos: 2,
            max_decode_len: 8,
        };
        let beams = set.predict_step(&shards, &params).unwrap();
        assert_eq!(beams.len(), 2);
        for pool in &beams {
            assert_eq!(pool.len(), 3);
        }
    }

    #[test]
    fn test_shard_count_mismatch_is_an_error() {
        let mut set = replica_set(2);
        let mut source = SyntheticTaskSource::new(dsl(), dims(), 2, 3);
        let batch = source.next_batch().unwrap().unwrap();
        let shards = batch.shard(&[Device::Cpu]).unwrap();
        assert!(set.train_step(&shards, &lr_fn()).is_err());
    }
}
