//! Checkpoint directory layout: `{root}/{iter:06}/{network}[_ema].safetensors`
//! plus `training_state.json`.

use anyhow::{Context, Result};
use candle_nn::VarMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const STATE_FILE: &str = "training_state.json";

/// Bookkeeping saved next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub iteration: usize,
    pub lr: f64,
    pub f_lr: f64,
    pub lambda_ds: f64,
    /// Last logged value of every loss term
    pub losses: BTreeMap<String, f32>,
}

pub struct CheckpointIo {
    root: PathBuf,
}

impl CheckpointIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, iter: usize) -> PathBuf {
        self.root.join(format!("{:06}", iter))
    }

    fn weights_path(&self, iter: usize, name: &str, ema: bool) -> PathBuf {
        let suffix = if ema { "_ema" } else { "" };
        self.dir(iter).join(format!("{}{}.safetensors", name, suffix))
    }

    pub fn save(&self, iter: usize, nets: &[(&str, &VarMap)], ema: bool) -> Result<()> {
        let dir = self.dir(iter);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create checkpoint dir {:?}", dir))?;
        for (name, vars) in nets {
            let path = self.weights_path(iter, name, ema);
            vars.save(&path).with_context(|| format!("Failed to save {:?}", path))?;
        }
        info!("Saved {} weights to {:?}", if ema { "EMA" } else { "model" }, dir);
        Ok(())
    }

    pub fn load(&self, iter: usize, nets: &mut [(&str, &mut VarMap)], ema: bool) -> Result<()> {
        for (name, vars) in nets.iter_mut() {
            let path = self.weights_path(iter, name, ema);
            vars.load(&path).with_context(|| format!("Failed to load {:?}", path))?;
        }
        info!("Loaded {} weights from {:?}", if ema { "EMA" } else { "model" }, self.dir(iter));
        Ok(())
    }

    pub fn save_state(&self, state: &TrainingState) -> Result<()> {
        let path = self.dir(state.iteration).join(STATE_FILE);
        fs::create_dir_all(self.dir(state.iteration))?;
        fs::write(&path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// `None` when the checkpoint carries no state file
    pub fn load_state(&self, iter: usize) -> Result<Option<TrainingState>> {
        let path = self.dir(iter).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let state = serde_json::from_str(&text).with_context(|| format!("Malformed {:?}", path))?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{init::Init, VarBuilder};

    fn store(value: f64) -> VarMap {
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 2), "layer.weight", Init::Const(value)).unwrap();
        vm
    }

    #[test]
    fn test_layout_and_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let io = CheckpointIo::new(dir.path());
        let g = store(0.5);
        io.save(1200, &[("generator", &g)], false)?;
        io.save(1200, &[("generator", &g)], true)?;
        assert!(dir.path().join("001200/generator.safetensors").exists());
        assert!(dir.path().join("001200/generator_ema.safetensors").exists());

        let mut fresh = store(0.0);
        io.load(1200, &mut [("generator", &mut fresh)], true)?;
        let w = fresh.data().lock().unwrap()["layer.weight"].as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(w, vec![0.5; 4]);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let io = CheckpointIo::new(dir.path());
        let mut g = store(0.0);
        assert!(io.load(5, &mut [("generator", &mut g)], false).is_err());
        assert!(io.load_state(5).unwrap().is_none());
    }

    #[test]
    fn test_state_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let io = CheckpointIo::new(dir.path());
        let mut losses = BTreeMap::new();
        losses.insert("D/latent_real".to_string(), 0.25);
        let state = TrainingState {
            iteration: 10,
            lr: 1e-4,
            f_lr: 1e-6,
            lambda_ds: 0.5,
            losses,
        };
        io.save_state(&state)?;
        assert_eq!(io.load_state(10)?, Some(state));
        Ok(())
    }
}
