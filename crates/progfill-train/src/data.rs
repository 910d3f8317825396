//! Task batches, device sharding and the synthetic task source.
//!
//! A batch holds U32 tensors on the host: `inputs` and `outputs` shaped
//! `[batch, num_strings, max_characters]` and `programs` shaped
//! `[batch, max_program_length]`, all padded with id 0.

use candle_core::{Device, Tensor};
use progfill_core::{ModelDims, Result, SynthError};
use progfill_eval::ConstStringDsl;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub inputs: Tensor,
    pub outputs: Tensor,
    pub programs: Tensor,
}

impl TaskBatch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.inputs.dim(0)?)
    }

    /// Split evenly across devices, moving each shard to its device.
    pub fn shard(&self, devices: &[Device]) -> Result<Vec<TaskBatch>> {
        let b = self.batch_size()?;
        let n = devices.len();
        if n == 0 || b % n != 0 {
            return Err(SynthError::Data(format!(
                "batch of {b} does not shard across {n} devices"
            )));
        }
        let per = b / n;
        let mut shards = Vec::with_capacity(n);
        for (i, device) in devices.iter().enumerate() {
            shards.push(TaskBatch {
                inputs: self.inputs.narrow(0, i * per, per)?.to_device(device)?,
                outputs: self.outputs.narrow(0, i * per, per)?.to_device(device)?,
                programs: self.programs.narrow(0, i * per, per)?.to_device(device)?,
            });
        }
        Ok(shards)
    }

    /// Grow to exactly `target` tasks by repeating the final task. The real
    /// prefix is preserved unchanged.
    pub fn pad_examples(&self, target: usize) -> Result<TaskBatch> {
        let b = self.batch_size()?;
        if b == 0 && target > 0 {
            return Err(SynthError::Data(
                "cannot pad an empty batch; there is no task to repeat".into(),
            ));
        }
        if target < b {
            return Err(SynthError::Data(format!(
                "cannot pad batch of {b} down to {target}"
            )));
        }
        if target == b {
            return Ok(self.clone());
        }
        let pad = target - b;
        Ok(TaskBatch {
            inputs: pad_rows(&self.inputs, pad)?,
            outputs: pad_rows(&self.outputs, pad)?,
            programs: pad_rows(&self.programs, pad)?,
        })
    }

    /// Pad to a multiple of `n` by repeating the final task.
    ///
    /// Returns the padded batch and the real (unpadded) size; callers score
    /// the padded copies too and only the denominator has to stay honest.
    pub fn pad_to_multiple(&self, n: usize) -> Result<(TaskBatch, usize)> {
        let b = self.batch_size()?;
        let target = b.div_ceil(n) * n;
        Ok((self.pad_examples(target)?, b))
    }
}

/// Gather per-device shards back into one host-resident batch, preserving
/// shard order.
pub fn to_host(shards: &[TaskBatch]) -> Result<TaskBatch> {
    if shards.is_empty() {
        return Err(SynthError::Data("cannot gather zero shards".into()));
    }
    let dev = Device::Cpu;
    let gather = |pick: fn(&TaskBatch) -> &Tensor| -> Result<Tensor> {
        let moved = shards
            .iter()
            .map(|s| Ok(pick(s).to_device(&dev)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&moved, 0)?)
    };
    Ok(TaskBatch {
        inputs: gather(|s| &s.inputs)?,
        outputs: gather(|s| &s.outputs)?,
        programs: gather(|s| &s.programs)?,
    })
}

fn pad_rows(t: &Tensor, pad: usize) -> Result<Tensor> {
    let b = t.dim(0)?;
    let last = t.narrow(0, b - 1, 1)?;
    let mut reps = vec![1usize; t.rank()];
    reps[0] = pad;
    Ok(Tensor::cat(&[t, &last.repeat(reps)?], 0)?)
}

/// Concatenate batches and re-split at `batch_size`; the final batch may be
/// smaller.
pub fn rebatch(batches: &[TaskBatch], batch_size: usize) -> Result<Vec<TaskBatch>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let inputs = Tensor::cat(&batches.iter().map(|b| &b.inputs).collect::<Vec<_>>(), 0)?;
    let outputs = Tensor::cat(&batches.iter().map(|b| &b.outputs).collect::<Vec<_>>(), 0)?;
    let programs = Tensor::cat(&batches.iter().map(|b| &b.programs).collect::<Vec<_>>(), 0)?;
    let total = inputs.dim(0)?;
    let mut out = Vec::new();
    let mut start = 0;
    while start < total {
        let len = batch_size.min(total - start);
        out.push(TaskBatch {
            inputs: inputs.narrow(0, start, len)?,
            outputs: outputs.narrow(0, start, len)?,
            programs: programs.narrow(0, start, len)?,
        });
        start += len;
    }
    Ok(out)
}

/// Stream of task batches. Training sources are infinite; evaluation sources
/// run out.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Option<TaskBatch>>;

    /// Stop after `n` batches.
    fn take(self, n: usize) -> Take<Self>
    where
        Self: Sized,
    {
        Take { inner: self, left: n }
    }

    /// Discard the first `n` batches.
    fn skip(self, n: usize) -> Skip<Self>
    where
        Self: Sized,
    {
        Skip { inner: self, to_skip: n }
    }
}

pub struct Take<S> {
    inner: S,
    left: usize,
}

impl<S: BatchSource> BatchSource for Take<S> {
    fn next_batch(&mut self) -> Result<Option<TaskBatch>> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        self.inner.next_batch()
    }
}

pub struct Skip<S> {
    inner: S,
    to_skip: usize,
}

impl<S: BatchSource> BatchSource for Skip<S> {
    fn next_batch(&mut self) -> Result<Option<TaskBatch>> {
        while self.to_skip > 0 {
            self.to_skip -= 1;
            if self.inner.next_batch()?.is_none() {
                return Ok(None);
            }
        }
        self.inner.next_batch()
    }
}

/// Cycle a fixed set of batches forever. Backs the training loop when the
/// held-out style fixed sets should also feed training (small experiments).
pub struct CycleBatches {
    batches: Vec<TaskBatch>,
    next: usize,
}

impl CycleBatches {
    pub fn new(batches: Vec<TaskBatch>) -> Self {
        Self { batches, next: 0 }
    }
}

impl BatchSource for CycleBatches {
    fn next_batch(&mut self) -> Result<Option<TaskBatch>> {
        if self.batches.is_empty() {
            return Ok(None);
        }
        let batch = self.batches[self.next].clone();
        self.next = (self.next + 1) % self.batches.len();
        Ok(Some(batch))
    }
}

/// Constant-string tasks: the hidden program prints one literal string on
/// every input. Exercises the whole engine without an external pipeline.
pub struct SyntheticTaskSource {
    dsl: ConstStringDsl,
    dims: ModelDims,
    batch_size: usize,
    rng: StdRng,
    remaining: Option<usize>,
}

impl SyntheticTaskSource {
    pub fn new(dsl: ConstStringDsl, dims: ModelDims, batch_size: usize, seed: u64) -> Self {
        Self {
            dsl,
            dims,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
            remaining: None,
        }
    }

    /// Cap the stream at `num_batches` for evaluation passes.
    pub fn finite(mut self, num_batches: usize) -> Self {
        self.remaining = Some(num_batches);
        self
    }

    fn random_char_ids(&mut self, len: usize) -> Vec<u32> {
        let table_len = self.dsl.table().len() as u32;
        (0..len).map(|_| self.rng.gen_range(1..=table_len)).collect()
    }

    fn generate(&mut self) -> Result<TaskBatch> {
        let d = self.dims.clone();
        let b = self.batch_size;
        let io_len = d.num_strings_per_task * d.max_characters;

        let mut inputs = Vec::with_capacity(b * io_len);
        let mut outputs = Vec::with_capacity(b * io_len);
        let mut programs = Vec::with_capacity(b * d.max_program_length);

        for _ in 0..b {
            // Leave room for the EOS terminator.
            let upper = d.max_program_length.min(d.max_characters).max(2);
            let target_len = self.rng.gen_range(1..upper);
            let target_ids = self.random_char_ids(target_len);
            let target: String = target_ids
                .iter()
                .filter_map(|&id| self.dsl.table().char_for(id))
                .collect();
            let tokens = self
                .dsl
                .encode(&target)
                .ok_or_else(|| SynthError::Data("target not encodable".into()))?;
            programs.extend(&tokens);
            programs.extend(std::iter::repeat(0).take(d.max_program_length - tokens.len()));

            for _ in 0..d.num_strings_per_task {
                let in_len = self.rng.gen_range(1..=d.max_characters.min(8));
                let row = self.random_char_ids(in_len);
                inputs.extend(&row);
                inputs.extend(std::iter::repeat(0).take(d.max_characters - in_len));

                outputs.extend(&target_ids);
                outputs.extend(std::iter::repeat(0).take(d.max_characters - target_ids.len()));
            }
        }

        let dev = Device::Cpu;
        Ok(TaskBatch {
            inputs: Tensor::from_vec(inputs, (b, d.num_strings_per_task, d.max_characters), &dev)?,
            outputs: Tensor::from_vec(outputs, (b, d.num_strings_per_task, d.max_characters), &dev)?,
            programs: Tensor::from_vec(programs, (b, d.max_program_length), &dev)?,
        })
    }
}

impl BatchSource for SyntheticTaskSource {
    fn next_batch(&mut self) -> Result<Option<TaskBatch>> {
        match self.remaining {
            Some(0) => return Ok(None),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        Ok(Some(self.generate()?))
    }
}
