//! Adam optimizer with decoupled weight decay.
//!
//! Update rule per parameter:
//!   1. m = beta1*m + (1-beta1)*grad
//!   2. v = beta2*v + (1-beta2)*grad^2
//!   3. mhat = m / (1 - beta1^t),  vhat = v / (1 - beta2^t)
//!   4. p -= lr * (mhat / (sqrt(vhat) + eps) + weight_decay * p)
//!
//! Applied with the same learning rate on every replica, so replicas stay
//! numerically identical after each collective step.

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use progfill_core::{Result, SynthError};

/// Serializable snapshot of one moment tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    fn capture(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }
}

/// Serializable AdamW state, persisted alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamWState {
    pub exp_avg: Vec<TensorState>,
    pub exp_avg_sq: Vec<TensorState>,
    pub t: usize,
}

pub struct AdamW {
    vars: Vec<Var>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    t: usize,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, beta1: f64, beta2: f64, eps: f64, weight_decay: f64) -> Result<Self> {
        let exp_avg = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let exp_avg_sq = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            exp_avg,
            exp_avg_sq,
            beta1,
            beta2,
            eps,
            weight_decay,
            t: 0,
        })
    }

    /// Apply one update from gradients aligned with the var order.
    ///
    /// Either every parameter is updated or the call fails; there is no
    /// partial update path.
    pub fn step(&mut self, grads: &[Option<Tensor>], lr: f64) -> Result<()> {
        if grads.len() != self.vars.len() {
            return Err(SynthError::Candle(format!(
                "gradient count {} does not match parameter count {}",
                grads.len(),
                self.vars.len()
            )));
        }
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, var) in self.vars.iter().enumerate() {
            let grad = match &grads[i] {
                Some(g) => g,
                None => continue,
            };

            let m = ((&self.exp_avg[i] * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * self.beta2)?
                + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let mhat = (&m / bias1)?;
            let vhat = (&v / bias2)?;
            let denom = (vhat.sqrt()? + self.eps)?;
            let update = mhat.broadcast_div(&denom)?;

            let mut new_val = (var.as_tensor() - (update * lr)?)?;
            if self.weight_decay > 0.0 {
                new_val = (new_val - (var.as_tensor() * (lr * self.weight_decay))?)?;
            }
            var.set(&new_val)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    pub fn export_state(&self) -> Result<AdamWState> {
        let mut exp_avg = Vec::with_capacity(self.exp_avg.len());
        let mut exp_avg_sq = Vec::with_capacity(self.exp_avg_sq.len());
        for tensor in &self.exp_avg {
            exp_avg.push(TensorState::capture(tensor)?);
        }
        for tensor in &self.exp_avg_sq {
            exp_avg_sq.push(TensorState::capture(tensor)?);
        }
        Ok(AdamWState {
            exp_avg,
            exp_avg_sq,
            t: self.t,
        })
    }

    pub fn import_state(&mut self, state: &AdamWState) -> Result<()> {
        if state.exp_avg.len() != self.vars.len() || state.exp_avg_sq.len() != self.vars.len() {
            return Err(SynthError::Candle(format!(
                "AdamW state mismatch: expected {} moment tensors, got {}/{}",
                self.vars.len(),
                state.exp_avg.len(),
                state.exp_avg_sq.len()
            )));
        }
        self.exp_avg = self.restore_moments(&state.exp_avg)?;
        self.exp_avg_sq = self.restore_moments(&state.exp_avg_sq)?;
        self.t = state.t;
        Ok(())
    }

    fn restore_moments(&self, snaps: &[TensorState]) -> Result<Vec<Tensor>> {
        let mut restored = Vec::with_capacity(snaps.len());
        for (idx, snap) in snaps.iter().enumerate() {
            let expected = self.vars[idx].as_tensor().dims().to_vec();
            if snap.shape != expected {
                return Err(SynthError::Candle(format!(
                    "AdamW state shape mismatch at index {}: expected {:?}, got {:?}",
                    idx, expected, snap.shape
                )));
            }
            restored.push(Tensor::from_vec(
                snap.data.clone(),
                snap.shape.as_slice(),
                self.vars[idx].device(),
            )?);
        }
        Ok(restored)
    }
}
