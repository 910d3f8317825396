//! Shared types for the progfill training stack.
//!
//! Holds the configuration surface (model dimensions, step-mode flags, run
//! options) and the error type used across the train and eval crates.

pub mod config;
pub mod error;

pub use config::{ModelDims, RunOptions, StepMode, SynthConfig};
pub use error::{checkpoint_error, config_error, IoResultExt, Result, SynthError};
