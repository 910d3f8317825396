//! Configuration for the seq-to-seq program synthesis trainer.
//!
//! One immutable base config is derived into three step-mode variants
//! (train/eval/predict) by toggling the `deterministic` and `decode` flags.

use serde::{Deserialize, Serialize};

use crate::error::{config_error, Result};

/// Model and task dimensions shared by every step mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDims {
    /// Embedding dimension.
    pub emb_dim: usize,
    /// Hidden (MLP) dimension.
    pub hidden_dim: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of layers.
    pub num_layers: usize,
    /// Vocabulary over input/output characters; id 0 is reserved for padding.
    pub io_vocab_size: usize,
    /// Vocabulary over program tokens; id 0 is reserved for padding.
    pub program_vocab_size: usize,
    /// Input/output string pairs per task.
    pub num_strings_per_task: usize,
    /// Maximum characters per input/output string.
    pub max_characters: usize,
    /// Maximum tokens per program.
    pub max_program_length: usize,
    /// Maximum expressions per program.
    pub max_expressions: usize,
    /// Begin-of-sequence token id in the program vocabulary.
    pub bos_token: u32,
    /// End-of-sequence token id in the program vocabulary.
    pub eos_token: u32,
}

impl ModelDims {
    pub fn validate(&self) -> Result<()> {
        if self.emb_dim == 0 {
            return Err(config_error("emb_dim must be > 0"));
        }
        if self.io_vocab_size < 2 || self.program_vocab_size < 2 {
            return Err(config_error("vocab sizes must leave room for padding id 0"));
        }
        if self.bos_token == 0 || self.eos_token == 0 {
            return Err(config_error("special tokens must not collide with padding id 0"));
        }
        if self.max_program_length == 0 || self.max_characters == 0 {
            return Err(config_error("sequence lengths must be > 0"));
        }
        Ok(())
    }
}

/// Flags distinguishing the train/eval/predict variants of one base config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMode {
    /// Disables stochastic regularization (dropout) when set.
    pub deterministic: bool,
    /// Enables the incremental decode cache when set.
    pub decode: bool,
}

/// Full configuration handed to the model and the step functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthConfig {
    pub dims: ModelDims,
    pub mode: StepMode,
    /// Dropout rate used when `mode.deterministic` is false.
    pub dropout: f32,
}

impl SynthConfig {
    /// Base (training) variant: stochastic, full-sequence forward.
    pub fn train(dims: ModelDims, dropout: f32) -> Self {
        Self {
            dims,
            mode: StepMode {
                deterministic: false,
                decode: false,
            },
            dropout,
        }
    }

    /// Evaluation variant: deterministic, full-sequence forward.
    pub fn eval(&self) -> Self {
        Self {
            mode: StepMode {
                deterministic: true,
                decode: false,
            },
            ..self.clone()
        }
    }

    /// Prediction variant: deterministic, incremental decode cache enabled.
    pub fn predict(&self) -> Self {
        Self {
            mode: StepMode {
                deterministic: true,
                decode: true,
            },
            ..self.clone()
        }
    }
}

/// Process-level run options (the full configuration surface).
///
/// All fields are required at process start; `validate` enforces the fatal
/// cases, in particular a missing dataset location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub seed: u64,
    pub lr: f64,
    pub weight_decay: f64,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub dataset_filepattern: Option<String>,
    pub per_device_batch_size: usize,
    pub num_strings_per_task: usize,
    pub max_expressions: usize,
    pub max_program_length: usize,
    pub max_characters: usize,
    pub save_dir: String,
    pub num_train_steps: usize,
    pub num_eval_steps: usize,
    pub log_freq: usize,
    pub checkpoint_freq: usize,
    pub restore_checkpoints: bool,
    /// Compute devices on this host.
    pub num_devices: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            lr: 1e-3,
            weight_decay: 1e-1,
            embedding_dim: 128,
            hidden_dim: 512,
            num_heads: 4,
            num_layers: 3,
            dataset_filepattern: None,
            per_device_batch_size: 16,
            num_strings_per_task: 4,
            max_expressions: 10,
            max_program_length: 50,
            max_characters: 100,
            save_dir: "./runs".into(),
            num_train_steps: 1_500_000,
            num_eval_steps: 10,
            log_freq: 1000,
            checkpoint_freq: 1000,
            restore_checkpoints: true,
            num_devices: 1,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.dataset_filepattern.is_none() {
            return Err(config_error("Must specify filepattern to dataset."));
        }
        if self.per_device_batch_size == 0 {
            return Err(config_error("per_device_batch_size must be > 0"));
        }
        if self.num_devices == 0 {
            return Err(config_error("num_devices must be > 0"));
        }
        if self.num_train_steps == 0 {
            return Err(config_error("num_train_steps must be > 0"));
        }
        if self.log_freq == 0 || self.checkpoint_freq == 0 {
            return Err(config_error("log_freq and checkpoint_freq must be > 0"));
        }
        Ok(())
    }

    /// Global batch size across this host's devices.
    pub fn batch_size(&self) -> usize {
        self.per_device_batch_size * self.num_devices
    }

    /// Hyperparameters that key the checkpoint run identifier.
    pub fn hparam_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("lr".into(), format!("{}", self.lr)),
            ("seed".into(), format!("{}", self.seed)),
        ]
    }
}
