//! Per-batch weighted loss/accuracy and metric aggregation.
//!
//! Loss and accuracy are returned as (sum, denominator) pairs rather than
//! pre-divided means, so numerators and denominators stay separable under
//! cross-device summation; callers divide once at report time.

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use progfill_core::{Result, SynthError};

/// Per-device metric totals. Summed across devices before reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub loss: f64,
    pub accuracy: f64,
    pub denominator: f64,
    /// Learning rate used for the step; averaged at report time, not summed.
    pub learning_rate: Option<f64>,
}

impl Metrics {
    pub fn merge_sum(&mut self, other: &Metrics) {
        self.loss += other.loss;
        self.accuracy += other.accuracy;
        self.denominator += other.denominator;
    }
}

/// Normalized view of accumulated metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub denominator: f64,
    pub perplexity: f64,
    pub learning_rate: f64,
}

/// Flush a list of accumulated step metrics into one normalized summary.
///
/// Sums are divided by the accumulated denominator; a zero denominator (an
/// all-padding accumulation) yields zero loss/accuracy rather than NaN.
/// Perplexity is `exp(mean_loss)` clipped at 1e4, computed after averaging
/// log-perplexities.
pub fn summarize(pending: &[Metrics]) -> MetricsSummary {
    let mut totals = Metrics::default();
    let mut lr_sum = 0.0;
    let mut lr_count = 0usize;
    for m in pending {
        totals.merge_sum(m);
        if let Some(lr) = m.learning_rate {
            lr_sum += lr;
            lr_count += 1;
        }
    }
    let loss = safe_div(totals.loss, totals.denominator);
    MetricsSummary {
        loss,
        accuracy: safe_div(totals.accuracy, totals.denominator),
        denominator: totals.denominator,
        perplexity: loss.exp().min(1.0e4),
        learning_rate: if lr_count > 0 { lr_sum / lr_count as f64 } else { 0.0 },
    }
}

/// Guarded divide: zero denominator yields zero, never NaN.
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Padding weight mask: 1.0 where `programs > 0`, 0.0 at padding positions.
/// Derived once per batch and shared by loss and accuracy.
pub fn padding_mask(programs: &Tensor) -> Result<Tensor> {
    let zeros = programs.zeros_like()?;
    Ok(programs.gt(&zeros)?.to_dtype(DType::F32)?)
}

fn check_ranks(logits: &Tensor, targets: &Tensor) -> Result<()> {
    if logits.rank() != targets.rank() + 1 {
        return Err(SynthError::ShapeMismatch {
            logits: logits.dims().to_vec(),
            targets: targets.dims().to_vec(),
        });
    }
    Ok(())
}

/// Weighted cross entropy over the trailing logits axis.
///
/// Returns `(summed_loss, denominator)` as graph tensors — not yet divided.
/// With no weights the denominator is the target element count; with weights
/// it is the weight sum.
pub fn compute_weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    weights: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    check_ranks(logits, targets)?;

    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let ids = targets.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
    let nll = log_probs
        .gather(&ids, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;

    let device = logits.device();
    match weights {
        Some(w) => {
            let loss = nll.mul(w)?.sum_all()?;
            let denominator = w.sum_all()?;
            Ok((loss, denominator))
        }
        None => {
            let loss = nll.sum_all()?;
            let count = targets.elem_count() as f32;
            Ok((loss, Tensor::new(count, device)?))
        }
    }
}

/// Weighted exact-match accuracy of argmax predictions. Same contract as
/// `compute_weighted_cross_entropy`.
pub fn compute_weighted_accuracy(
    logits: &Tensor,
    targets: &Tensor,
    weights: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    check_ranks(logits, targets)?;

    let predictions = logits.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?;

    let device = logits.device();
    match weights {
        Some(w) => {
            let acc = correct.mul(w)?.sum_all()?;
            let denominator = w.sum_all()?;
            Ok((acc, denominator))
        }
        None => {
            let acc = correct.sum_all()?;
            let count = targets.elem_count() as f32;
            Ok((acc, Tensor::new(count, device)?))
        }
    }
}

/// Bundle loss, accuracy, and denominator into one per-device record.
///
/// The caller (the replicated step function) hands these to the collective
/// layer for the cross-device sum; after that reduction every device holds
/// identical totals.
pub fn compute_metrics(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Result<Metrics> {
    let (loss, denominator) = compute_weighted_cross_entropy(logits, targets, Some(weights))?;
    let (accuracy, _) = compute_weighted_accuracy(logits, targets, Some(weights))?;
    Ok(Metrics {
        loss: loss.to_scalar::<f32>()? as f64,
        accuracy: accuracy.to_scalar::<f32>()? as f64,
        denominator: denominator.to_scalar::<f32>()? as f64,
        learning_rate: None,
    })
}
