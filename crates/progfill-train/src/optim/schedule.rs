//! Factor-string learning rate schedule.
//!
//! A schedule is a `*`-joined product of named factors, e.g.
//! `"constant * linear_warmup * rsqrt_normalized_decay"`. Each factor
//! multiplies (or divides) a running value; the result is a pure function of
//! the step.

use progfill_core::{Result, SynthError};

/// Numeric hyperparameters consumed by the schedule factors.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    /// Starting constant for the schedule.
    pub base_learning_rate: f64,
    /// `*`-joined factor names.
    pub factors: String,
    /// Steps to warm up for.
    pub warmup_steps: usize,
    /// Amount `decay_every` decays by.
    pub decay_factor: f64,
    /// Period of `decay_every`.
    pub steps_per_decay: usize,
    /// Cycle length for `cosine_decay`.
    pub steps_per_cycle: usize,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            base_learning_rate: 0.5,
            factors: "constant * linear_warmup * rsqrt_normalized_decay".into(),
            warmup_steps: 16_000,
            decay_factor: 0.5,
            steps_per_decay: 50_000,
            steps_per_cycle: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Factor {
    Constant,
    LinearWarmup,
    RsqrtDecay,
    RsqrtNormalizedDecay,
    DecayEvery,
    CosineDecay,
}

/// A compiled schedule: `step -> learning rate`.
#[derive(Debug, Clone)]
pub struct LearningRateFn {
    spec: ScheduleSpec,
    factors: Vec<Factor>,
}

impl LearningRateFn {
    /// Parse the factor string. An unrecognized factor name is a fatal
    /// configuration error reported at build time, not at step time.
    pub fn new(spec: ScheduleSpec) -> Result<Self> {
        let mut factors = Vec::new();
        for name in spec.factors.split('*').map(str::trim) {
            let factor = match name {
                "constant" => Factor::Constant,
                "linear_warmup" => Factor::LinearWarmup,
                "rsqrt_decay" => Factor::RsqrtDecay,
                "rsqrt_normalized_decay" => Factor::RsqrtNormalizedDecay,
                "decay_every" => Factor::DecayEvery,
                "cosine_decay" => Factor::CosineDecay,
                other => return Err(SynthError::UnknownScheduleFactor(other.to_string())),
            };
            factors.push(factor);
        }
        Ok(Self { spec, factors })
    }

    /// Learning rate at `step`.
    pub fn rate(&self, step: usize) -> f64 {
        let step = step as f64;
        let warmup = self.spec.warmup_steps as f64;
        let mut ret = 1.0;
        for factor in &self.factors {
            match factor {
                Factor::Constant => ret *= self.spec.base_learning_rate,
                Factor::LinearWarmup => ret *= (step / warmup).min(1.0),
                Factor::RsqrtDecay => ret /= (step - warmup).max(1.0).sqrt(),
                Factor::RsqrtNormalizedDecay => {
                    ret *= warmup.sqrt();
                    ret /= step.max(warmup).sqrt();
                }
                Factor::DecayEvery => {
                    let periods = (step / self.spec.steps_per_decay as f64).floor();
                    ret *= self.spec.decay_factor.powf(periods);
                }
                Factor::CosineDecay => {
                    let progress = ((step - warmup) / self.spec.steps_per_cycle as f64).max(0.0);
                    let cycle = 0.5 * (1.0 + (std::f64::consts::PI * (progress % 1.0)).cos());
                    ret *= cycle.max(0.0);
                }
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(factors: &str) -> LearningRateFn {
        LearningRateFn::new(ScheduleSpec {
            base_learning_rate: 0.5,
            factors: factors.into(),
            warmup_steps: 100,
            decay_factor: 0.5,
            steps_per_decay: 50,
            steps_per_cycle: 200,
        })
        .unwrap()
    }

    #[test]
    fn test_unknown_factor_is_fatal() {
        let err = LearningRateFn::new(ScheduleSpec {
            factors: "constant * quadratic_warmup".into(),
            ..ScheduleSpec::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("quadratic_warmup"));
    }

    #[test]
    fn test_linear_warmup_boundaries() {
        let lr = schedule("linear_warmup");
        assert_eq!(lr.rate(0), 0.0);
        assert!((lr.rate(50) - 0.5).abs() < 1e-12);
        // At and past warmup the factor is exactly 1.0.
        for step in [100, 101, 500, 100_000] {
            assert!((lr.rate(step) - 1.0).abs() < 1e-12, "step {}", step);
        }
    }

    #[test]
    fn test_constant_factor() {
        let lr = schedule("constant");
        assert!((lr.rate(0) - 0.5).abs() < 1e-12);
        assert!((lr.rate(12345) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rsqrt_decay_divides_past_warmup() {
        let lr = schedule("rsqrt_decay");
        // Within warmup the divisor clamps at 1.
        assert!((lr.rate(0) - 1.0).abs() < 1e-12);
        assert!((lr.rate(100) - 1.0).abs() < 1e-12);
        // 400 steps past warmup: divide by sqrt(400) = 20.
        assert!((lr.rate(500) - 1.0 / 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_rsqrt_normalized_decay_matches_warmup_peak() {
        let lr = schedule("rsqrt_normalized_decay");
        // Flat at 1.0 through warmup, then decays as sqrt(warmup / step).
        assert!((lr.rate(100) - 1.0).abs() < 1e-12);
        assert!((lr.rate(400) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_decay_every_steps() {
        let lr = schedule("decay_every");
        assert!((lr.rate(0) - 1.0).abs() < 1e-12);
        assert!((lr.rate(49) - 1.0).abs() < 1e-12);
        assert!((lr.rate(50) - 0.5).abs() < 1e-12);
        assert!((lr.rate(100) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_decay_cycles() {
        let lr = schedule("cosine_decay");
        // Before warmup progress clamps to 0 -> factor 1.
        assert!((lr.rate(0) - 1.0).abs() < 1e-12);
        // Half a cycle past warmup -> factor 0.
        assert!(lr.rate(200).abs() < 1e-12);
        // Full cycle -> back to 1.
        assert!((lr.rate(300) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_factor_product_composes() {
        let lr = schedule("constant * linear_warmup");
        assert_eq!(lr.rate(0), 0.0);
        assert!((lr.rate(50) - 0.25).abs() < 1e-12);
        assert!((lr.rate(100) - 0.5).abs() < 1e-12);
    }
}
