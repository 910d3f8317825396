//! Error types for training and evaluation.
//!
//! Fatal conditions (shape mismatches, unknown schedule factors, missing
//! dataset location) surface as errors that abort the run; recoverable
//! conditions (program parse/execute failures) live in the eval crate and
//! never reach this type.

use thiserror::Error;

/// Main error type for the training engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SynthError {
    /// Errors from the Candle tensor library.
    #[error("Candle error: {0}")]
    Candle(String),

    /// Configuration validation failures.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint save/load failures.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// I/O errors with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// Rank mismatch between logits and targets in metric computation.
    #[error("Incorrect shapes. Got shape {logits:?} logits and {targets:?} targets")]
    ShapeMismatch {
        logits: Vec<usize>,
        targets: Vec<usize>,
    },

    /// Unrecognized factor name in a learning-rate schedule string.
    #[error("Unknown factor {0}.")]
    UnknownScheduleFactor(String),

    /// Dataset pipeline failures (exhausted iterator, bad shard shape).
    #[error("Data error: {0}")]
    Data(String),
}

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, SynthError>;

impl SynthError {
    /// Fatal errors indicate a programming/configuration mistake; the process
    /// terminates rather than retrying. Recovery is via checkpoint restart.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SynthError::Io { .. })
    }

    /// Path associated with this error, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            SynthError::Checkpoint { path, .. } => Some(path),
            SynthError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for SynthError {
    fn from(err: candle_core::Error) -> Self {
        SynthError::Candle(err.to_string())
    }
}

/// Helper for creating config errors.
pub fn config_error(message: impl Into<String>) -> SynthError {
    SynthError::Config(message.into())
}

/// Helper for creating checkpoint errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> SynthError {
    SynthError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T> {
        self.map_err(|e| SynthError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_reports_both_shapes() {
        let err = SynthError::ShapeMismatch {
            logits: vec![2, 4, 8],
            targets: vec![2, 4, 1],
        };
        let msg = err.to_string();
        assert!(msg.contains("[2, 4, 8]"));
        assert!(msg.contains("[2, 4, 1]"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SynthError::UnknownScheduleFactor("foo".into()).is_fatal());
        assert!(SynthError::Config("missing dataset".into()).is_fatal());
        assert!(!SynthError::Io {
            message: "transient".into(),
            path: "/tmp/x".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_path_extraction() {
        let err = checkpoint_error("failed", "/tmp/ckpt");
        assert_eq!(err.path(), Some("/tmp/ckpt"));
        assert_eq!(SynthError::Config("x".into()).path(), None);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        match result.with_path("/tmp/missing.bin") {
            Err(SynthError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.bin"),
            _ => panic!("Expected IO error with path"),
        }
    }
}
