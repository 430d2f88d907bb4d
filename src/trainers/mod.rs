pub mod checkpoint;
pub mod ema;
pub mod image_utils;
pub mod losses;
pub mod schedule;
pub mod solver;

// Re-export key types
pub use checkpoint::{CheckpointIo, TrainingState};
pub use ema::EmaHelper;
pub use solver::LandmarkSolver;

use crate::align;
use crate::config::{Config, Mode};
use crate::data::{build_loaders, Loaders};
use anyhow::{Context, Result};
use log::info;

/// The operations a run mode delegates to
pub trait Solver {
    fn train(&mut self, loaders: &mut Loaders) -> Result<()>;
    fn sample(&mut self, loaders: &mut Loaders) -> Result<()>;
    fn evaluate(&mut self) -> Result<()>;
}

/// Drive one run mode to completion.
///
/// `train` and `sample` build their loaders before the solver; `eval` gets
/// a solver and no loaders; `align` never constructs a solver.
pub fn run<S, F>(config: &Config, make_solver: F) -> Result<()>
where
    S: Solver,
    F: FnOnce() -> Result<S>,
{
    info!("Running mode {:?}", config.mode);
    match config.mode {
        Mode::Train => {
            let mut loaders = build_loaders(config)?.context("train mode builds loaders")?;
            make_solver()?.train(&mut loaders)
        }
        Mode::Sample => {
            let mut loaders = build_loaders(config)?.context("sample mode builds loaders")?;
            make_solver()?.sample(&mut loaders)
        }
        Mode::Eval => make_solver()?.evaluate(),
        Mode::Align => align::align_faces(config, &config.inp_dir, &config.out_dir),
    }
}
