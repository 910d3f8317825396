//! Pooled-embedding seq-to-seq baseline.
//!
//! The encoder mean-pools embedded I/O characters under the output padding
//! mask into one memory vector. The decoder conditions each position on the
//! running mean of the program prefix plus that memory, which makes the
//! incremental decode path exact: caching the embedded tokens and averaging
//! them reproduces the teacher-forced prefix mean.

use candle_core::{Device, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};
use progfill_core::{Result, StepMode, SynthConfig, SynthError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{DecodeCache, ProgramModel};

pub struct PooledSeqModel {
    config: SynthConfig,
    io_embed: Embedding,
    program_embed: Embedding,
    encode_proj: Linear,
    hidden: Linear,
    output: Linear,
}

impl PooledSeqModel {
    pub fn build(config: &SynthConfig, vb: VarBuilder) -> Result<Self> {
        config.dims.validate()?;
        let d = &config.dims;
        Ok(Self {
            config: config.clone(),
            io_embed: embedding(d.io_vocab_size, d.emb_dim, vb.pp("io_embed"))?,
            program_embed: embedding(d.program_vocab_size, d.emb_dim, vb.pp("program_embed"))?,
            encode_proj: linear(d.emb_dim, d.emb_dim, vb.pp("encode_proj"))?,
            hidden: linear(d.emb_dim, d.hidden_dim, vb.pp("hidden"))?,
            output: linear(d.hidden_dim, d.program_vocab_size, vb.pp("output"))?,
        })
    }

    /// Running mean over the shifted program prefix, `[b, l, e]`.
    fn prefix_mean(&self, emb: &Tensor) -> Result<Tensor> {
        let (_b, l, _e) = emb.dims3()?;
        let cumulative = emb.cumsum(1)?;
        let counts =
            Tensor::arange(1f32, l as f32 + 1.0, emb.device())?.reshape((1, l, 1))?;
        Ok(cumulative.broadcast_div(&counts)?)
    }

    /// Inverted-scale dropout mask built host-side from a single-use seed.
    fn dropout_mask(&self, shape: (usize, usize, usize), seed: u64, device: &Device) -> Result<Tensor> {
        let p = self.config.dropout as f64;
        let keep = 1.0 - p;
        let scale = (1.0 / keep) as f32;
        let mut rng = StdRng::seed_from_u64(seed);
        let n = shape.0 * shape.1 * shape.2;
        let mask: Vec<f32> = (0..n)
            .map(|_| if rng.gen::<f64>() < keep { scale } else { 0.0 })
            .collect();
        Ok(Tensor::from_vec(mask, shape, device)?)
    }
}

impl ProgramModel for PooledSeqModel {
    fn full_forward(
        &self,
        inputs: &Tensor,
        outputs: &Tensor,
        programs: &Tensor,
        mode: &StepMode,
        dropout_seed: Option<u64>,
    ) -> Result<Tensor> {
        let (encoded, _mask) = self.encode(inputs, outputs)?;
        let (b, l) = programs.dims2()?;

        // Shift right and prepend BOS so position t predicts token t.
        let bos = Tensor::full(self.config.dims.bos_token, (b, 1), programs.device())?;
        let shifted = Tensor::cat(&[&bos, &programs.narrow(1, 0, l - 1)?], 1)?;

        let emb = self.program_embed.forward(&shifted)?;
        let context = self.prefix_mean(&emb)?.broadcast_add(&encoded)?;
        let mut h = self.hidden.forward(&context)?.relu()?;

        if !mode.deterministic && self.config.dropout > 0.0 {
            let seed = dropout_seed.ok_or_else(|| {
                SynthError::Config("stochastic forward requires a dropout seed".into())
            })?;
            let mask = self.dropout_mask(h.dims3()?, seed, h.device())?;
            h = h.mul(&mask)?;
        }

        Ok(self.output.forward(&h)?)
    }

    fn encode(&self, inputs: &Tensor, outputs: &Tensor) -> Result<(Tensor, Tensor)> {
        let d = &self.config.dims;
        let (b, _n, _c) = inputs.dims3()?;
        let flat_len = d.num_strings_per_task * d.max_characters;

        let inputs = inputs.reshape((b, flat_len))?;
        let outputs = outputs.reshape((b, flat_len))?;

        // Real characters are flagged off the outputs; inputs may be shorter.
        let mask = outputs
            .gt(&outputs.zeros_like()?)?
            .to_dtype(candle_core::DType::F32)?;

        let combined = (self.io_embed.forward(&inputs)? + self.io_embed.forward(&outputs)?)?;
        let weighted = combined.broadcast_mul(&mask.unsqueeze(2)?)?;
        let denom = mask.sum_keepdim(1)?.maximum(1.0)?;
        let pooled = weighted.sum(1)?.broadcast_div(&denom)?;

        let encoded = self.encode_proj.forward(&pooled)?.relu()?.unsqueeze(1)?;
        Ok((encoded, mask))
    }

    fn decode_step(
        &self,
        tokens: &Tensor,
        encoded: &Tensor,
        _encoded_mask: &Tensor,
        cache: &mut DecodeCache,
    ) -> Result<Tensor> {
        let emb = self.program_embed.forward(tokens)?;
        cache.push(0, emb)?;

        let entries = cache.entries(0);
        let mut sum = entries[0].clone();
        for e in &entries[1..] {
            sum = (sum + e)?;
        }
        let mean = (sum / entries.len() as f64)?;

        let context = (mean + encoded.squeeze(1)?)?;
        let h = self.hidden.forward(&context)?.relu()?;
        Ok(self.output.forward(&h)?)
    }

    fn num_layers(&self) -> usize {
        1
    }
}
