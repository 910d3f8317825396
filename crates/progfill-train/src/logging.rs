//! Structured logging for the training run with tracing.
//!
//! JSON output for long-running jobs, pretty console output for local runs,
//! plus small helpers that keep the event fields consistent across the
//! orchestration loop.

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::metrics::MetricsSummary;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,progfill_train=info,progfill_core=info,progfill_eval=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for local runs and debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,progfill_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Log the flushed training summary for a reporting window.
pub fn log_train_summary(step: usize, summary: &MetricsSummary, steps_per_second: f64) {
    if !summary.loss.is_finite() {
        error!(
            step = step,
            loss = summary.loss,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        step = step,
        loss = summary.loss,
        accuracy = summary.accuracy,
        lr = summary.learning_rate,
        steps_per_second = steps_per_second,
        "Training window flushed"
    );

    if summary.denominator == 0.0 {
        warn!(
            step = step,
            "Reporting window saw only padding tokens; metrics are zeroed"
        );
    }
}

/// Log evaluation results.
pub fn log_evaluation(step: usize, summary: &MetricsSummary) {
    info!(
        step = step,
        eval_loss = summary.loss,
        eval_accuracy = summary.accuracy,
        eval_perplexity = summary.perplexity,
        event = "evaluation",
        "Evaluation completed"
    );
}

/// Log the end-to-end synthesis score for one beam width.
pub fn log_predict_score(step: usize, beam_size: usize, score: f64) {
    info!(
        step = step,
        beam_size = beam_size,
        score = score,
        event = "predict",
        "Beam decoding scored"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str) {
    info!(
        step = step,
        path = path,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log checkpoint restore at process start.
pub fn log_checkpoint_restore(step: usize, path: &str) {
    info!(
        step = step,
        path = path,
        event = "checkpoint_restored",
        "Resuming from checkpoint"
    );
}
