//! Checkpoint layout and restore.
//!
//! Checkpoints live under `<save_dir>/checkpoints/<run_id>/step_<N>/` with
//! three files: `model.safetensors` (parameters), `optimizer_state.json`
//! (first/second moments and the step counter) and `meta.json` (config and
//! step). The run id is derived from hyperparameters so runs with different
//! settings never collide.

use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use progfill_core::{checkpoint_error, IoResultExt, Result, SynthConfig};

use crate::optim::AdamWState;

/// Sorted `name=value` pairs joined with commas, e.g. `lr=0.001,seed=0`.
pub fn hparam_run_id(pairs: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(",")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: SynthConfig,
    pub step: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(save_dir: impl AsRef<Path>, run_id: &str) -> Self {
        Self {
            dir: save_dir.as_ref().join("checkpoints").join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn step_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("step_{step}"))
    }

    /// Persist the unreplicated lead-replica state for `step`.
    pub fn save(
        &self,
        step: usize,
        varmap: &VarMap,
        optim_state: &AdamWState,
        config: &SynthConfig,
    ) -> Result<PathBuf> {
        let dir = self.step_dir(step);
        fs::create_dir_all(&dir).with_path(&dir)?;

        let model_path = dir.join("model.safetensors");
        varmap
            .save(&model_path)
            .map_err(|e| checkpoint_error(e.to_string(), &model_path))?;

        let optim_path = dir.join("optimizer_state.json");
        let optim_json = serde_json::to_string(optim_state)
            .map_err(|e| checkpoint_error(e.to_string(), &optim_path))?;
        fs::write(&optim_path, optim_json).with_path(&optim_path)?;

        let meta_path = dir.join("meta.json");
        let meta = CheckpointMeta {
            config: config.clone(),
            step,
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
        fs::write(&meta_path, meta_json).with_path(&meta_path)?;

        Ok(dir)
    }

    /// Highest saved step, or `None` when the run has no checkpoints yet.
    pub fn latest_step(&self) -> Result<Option<usize>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix("step_"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if latest.map_or(true, |l| step > l) {
                latest = Some(step);
            }
        }
        Ok(latest)
    }

    /// Load parameters for `step` into `varmap` and return the optimizer
    /// state and metadata. `varmap` must already hold variables with the
    /// checkpointed names and shapes.
    pub fn load(&self, step: usize, varmap: &mut VarMap) -> Result<(AdamWState, CheckpointMeta)> {
        let dir = self.step_dir(step);

        let model_path = dir.join("model.safetensors");
        varmap
            .load(&model_path)
            .map_err(|e| checkpoint_error(e.to_string(), &model_path))?;

        let optim_path = dir.join("optimizer_state.json");
        let optim_json = fs::read_to_string(&optim_path).with_path(&optim_path)?;
        let optim_state: AdamWState = serde_json::from_str(&optim_json)
            .map_err(|e| checkpoint_error(e.to_string(), &optim_path))?;

        let meta_path = dir.join("meta.json");
        let meta_json = fs::read_to_string(&meta_path).with_path(&meta_path)?;
        let meta: CheckpointMeta = serde_json::from_str(&meta_json)
            .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;

        Ok((optim_state, meta))
    }
}
