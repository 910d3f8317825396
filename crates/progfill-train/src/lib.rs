//! # progfill training engine
//!
//! Trains a seq-to-seq model that synthesizes a program from a handful of
//! input/output string examples, and evaluates it by decoding candidate
//! programs with beam search and scoring them against held-out examples.
//!
//! The engine is the distributed orchestration layer: replicated step
//! functions across compute devices, collective gradient/metric reduction,
//! checkpoint-based resumability, and an incremental-cache beam decoder. The
//! model architecture, the dataset pipeline, and the task DSL are external
//! collaborators reached through traits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use progfill_core::{ModelDims, RunOptions, SynthConfig};
//! use progfill_train::baseline::PooledSeqModel;
//! use progfill_train::collective::HostTopology;
//! use progfill_train::parallel::ReplicaSet;
//!
//! # fn main() -> anyhow::Result<()> {
//! let opts = RunOptions::default();
//! let dims = ModelDims {
//!     emb_dim: 128, hidden_dim: 512, num_heads: 4, num_layers: 3,
//!     io_vocab_size: 96, program_vocab_size: 98, num_strings_per_task: 4,
//!     max_characters: 100, max_program_length: 50, max_expressions: 10,
//!     bos_token: 1, eos_token: 2,
//! };
//! let config = SynthConfig::train(dims, 0.1);
//! let topology = HostTopology::single_host(opts.num_devices)?;
//! let _replicas = ReplicaSet::new(&config, topology, opts.seed, PooledSeqModel::build)?;
//! # Ok(())
//! # }
//! ```

pub mod baseline;
pub mod beam;
pub mod checkpoint;
pub mod collective;
pub mod dashboard;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod parallel;
pub mod rng;
pub mod run;
