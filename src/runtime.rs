//! Process-wide runtime state: compute device and RNG seed.
//!
//! Initialised once at startup and never mutated afterwards. Components that
//! run before (or without) initialisation fall back to the CPU and seed 0.

use anyhow::Result;
use candle_core::Device;
use log::info;
use once_cell::sync::OnceCell;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

#[derive(Debug)]
pub struct Runtime {
    pub device: Device,
    pub seed: u64,
}

/// Select the device and seed its generator. Later calls return the first runtime.
pub fn init(seed: u64, force_cpu: bool) -> Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        let device = if force_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };
        // The CPU backend draws from thread-local RNGs and cannot be seeded
        if !device.is_cpu() {
            device.set_seed(seed)?;
        }
        info!("Runtime initialised: device={:?}, seed={}", device, seed);
        Ok(Runtime { device, seed })
    })
}

pub fn get() -> Option<&'static Runtime> {
    RUNTIME.get()
}

pub fn device() -> Device {
    get().map(|rt| rt.device.clone()).unwrap_or(Device::Cpu)
}

pub fn seed() -> u64 {
    get().map(|rt| rt.seed).unwrap_or(0)
}
