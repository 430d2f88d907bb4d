//! Exponential moving average of network parameters.

use anyhow::{anyhow, Context, Result};
use candle_nn::VarMap;

pub const EMA_BETA: f64 = 0.999;

pub struct EmaHelper {
    beta: f64,
}

impl EmaHelper {
    pub fn new(beta: f64) -> Self {
        Self { beta }
    }

    /// Overwrite every averaged parameter with the live value
    pub fn init(&self, ema: &VarMap, live: &VarMap) -> Result<()> {
        self.blend(ema, live, 0.0)
    }

    /// `ema = beta * ema + (1 - beta) * live`
    pub fn update(&self, ema: &VarMap, live: &VarMap) -> Result<()> {
        self.blend(ema, live, self.beta)
    }

    fn blend(&self, ema: &VarMap, live: &VarMap, beta: f64) -> Result<()> {
        let ema_vars = ema.data().lock().map_err(|_| anyhow!("EMA parameter store poisoned"))?;
        let live_vars = live.data().lock().map_err(|_| anyhow!("parameter store poisoned"))?;

        for (name, ema_var) in ema_vars.iter() {
            let live_var = live_vars
                .get(name)
                .with_context(|| format!("EMA parameter {} has no live counterpart", name))?;
            let value = if beta == 0.0 {
                live_var.as_tensor().detach()
            } else {
                ((ema_var.as_tensor() * beta)? + (live_var.as_tensor() * (1.0 - beta))?)?.detach()
            };
            ema_var.set(&value)?;
        }
        Ok(())
    }
}
