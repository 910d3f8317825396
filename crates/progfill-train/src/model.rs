//! Model seam between the step functions and a concrete architecture.
//!
//! The trainer only needs three views of a model: a full teacher-forced
//! forward for loss, a one-shot encode of the I/O examples, and an
//! incremental decode step fed from a per-layer token cache. Anything that
//! provides those can be trained, evaluated and beam-decoded.

use candle_core::{Device, Tensor};
use progfill_core::{Result, StepMode, SynthError};

pub trait ProgramModel: Send + Sync {
    /// Teacher-forced logits `[batch, program_len, program_vocab]`.
    ///
    /// `dropout_seed` must be `Some` exactly when `mode` is stochastic; the
    /// seed is single-use and comes from the replica's RNG stream.
    fn full_forward(
        &self,
        inputs: &Tensor,
        outputs: &Tensor,
        programs: &Tensor,
        mode: &StepMode,
        dropout_seed: Option<u64>,
    ) -> Result<Tensor>;

    /// Encode the I/O examples once before decoding.
    ///
    /// Returns `(encoded, encoded_mask)` where `encoded` is
    /// `[batch, mem_len, emb]` and the mask flags real output characters
    /// as `[batch, num_strings * max_characters]`.
    fn encode(&self, inputs: &Tensor, outputs: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Logits `[flat_batch, program_vocab]` for the next token given the
    /// tokens already pushed into `cache` plus `tokens` (`[flat_batch]`, U32).
    fn decode_step(
        &self,
        tokens: &Tensor,
        encoded: &Tensor,
        encoded_mask: &Tensor,
        cache: &mut DecodeCache,
    ) -> Result<Tensor>;

    fn num_layers(&self) -> usize;

    /// Fresh decode cache for one prediction round.
    fn init_cache(&self, max_decode_len: usize, device: &Device) -> DecodeCache {
        DecodeCache::new(self.num_layers(), max_decode_len, device)
    }
}

/// Fixed-capacity per-layer token cache for incremental decoding.
///
/// `reorder` follows beam search: when live hypotheses are re-parented, the
/// cached history must follow them.
#[derive(Debug)]
pub struct DecodeCache {
    device: Device,
    max_decode_len: usize,
    layers: Vec<LayerCache>,
}

#[derive(Debug)]
struct LayerCache {
    entries: Vec<Tensor>,
}

impl DecodeCache {
    pub fn new(num_layers: usize, max_decode_len: usize, device: &Device) -> Self {
        Self {
            device: device.clone(),
            max_decode_len,
            layers: (0..num_layers)
                .map(|_| LayerCache {
                    entries: Vec::with_capacity(max_decode_len),
                })
                .collect(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of tokens already cached. Identical across layers.
    pub fn position(&self) -> usize {
        self.layers.first().map_or(0, |l| l.entries.len())
    }

    pub fn max_decode_len(&self) -> usize {
        self.max_decode_len
    }

    /// Append one step's activations for `layer`. Capacity is fixed at
    /// construction; overflow means the decode loop lost track of length.
    pub fn push(&mut self, layer: usize, entry: Tensor) -> Result<()> {
        let cap = self.max_decode_len;
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| SynthError::Config(format!("cache has no layer {layer}")))?;
        if slot.entries.len() >= cap {
            return Err(SynthError::Config(format!(
                "decode cache overflow at capacity {cap}"
            )));
        }
        slot.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self, layer: usize) -> &[Tensor] {
        &self.layers[layer].entries
    }

    /// Re-parent every cached entry along the flat batch dimension.
    pub fn reorder(&mut self, flat_indices: &Tensor) -> Result<()> {
        for layer in &mut self.layers {
            for entry in &mut layer.entries {
                *entry = entry.index_select(flat_indices, 0)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_position_and_overflow() {
        let dev = Device::Cpu;
        let mut cache = DecodeCache::new(1, 2, &dev);
        assert_eq!(cache.position(), 0);
        let e = Tensor::zeros((3, 4), candle_core::DType::F32, &dev).unwrap();
        cache.push(0, e.clone()).unwrap();
        cache.push(0, e.clone()).unwrap();
        assert_eq!(cache.position(), 2);
        assert!(cache.push(0, e).is_err());
    }

    #[test]
    fn test_cache_reorder_follows_parents() {
        let dev = Device::Cpu;
        let mut cache = DecodeCache::new(1, 4, &dev);
        let e = Tensor::new(&[[1.0f32], [2.0], [3.0]], &dev).unwrap();
        cache.push(0, e).unwrap();
        let idx = Tensor::new(&[2u32, 0, 0], &dev).unwrap();
        cache.reorder(&idx).unwrap();
        let got = cache.entries(0)[0].to_vec2::<f32>().unwrap();
        assert_eq!(got, vec![vec![3.0], vec![1.0], vec![1.0]]);
    }
}
