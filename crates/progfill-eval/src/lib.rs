//! Program decoding, execution, and beam-candidate scoring.
//!
//! The DSL itself is an external collaborator: this crate defines the
//! `ProgramExecutor` boundary, the localized parse/runtime failure types, and
//! the best-effort selection over decoded beam candidates.

pub mod executor;
pub mod score;

pub use executor::{
    truncate_at_eos, CharTable, ConstStringDsl, ParseFailure, ProgramExecutor, RuntimeFailure,
};
pub use score::{decode_io, eval_predicted, ScoredPrediction};
