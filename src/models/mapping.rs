//! Mapping network: latent code -> per-domain style code.

use super::{select_domain, NetConfig};
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

pub struct MappingNetwork {
    shared: Vec<Linear>,
    unshared: Vec<Vec<Linear>>,
}

impl MappingNetwork {
    pub fn new(cfg: &NetConfig, vb: VarBuilder) -> Result<Self> {
        let mut shared = vec![linear(cfg.latent_dim, cfg.hidden_dim, vb.pp("shared.0"))?];
        for i in 1..4 {
            shared.push(linear(cfg.hidden_dim, cfg.hidden_dim, vb.pp(format!("shared.{}", i)))?);
        }

        let mut unshared = Vec::with_capacity(cfg.num_domains);
        for d in 0..cfg.num_domains {
            let vb = vb.pp(format!("unshared.{}", d));
            let mut head = Vec::with_capacity(4);
            for i in 0..3 {
                head.push(linear(cfg.hidden_dim, cfg.hidden_dim, vb.pp(i))?);
            }
            head.push(linear(cfg.hidden_dim, cfg.style_dim, vb.pp(3))?);
            unshared.push(head);
        }

        Ok(Self { shared, unshared })
    }

    /// `z`: `[B, latent_dim]`, `y`: `[B]` u32 -> `[B, style_dim]`
    pub fn forward(&self, z: &Tensor, y: &Tensor) -> Result<Tensor> {
        let mut h = z.clone();
        for layer in &self.shared {
            h = layer.forward(&h)?.relu()?;
        }

        let mut outs = Vec::with_capacity(self.unshared.len());
        for head in &self.unshared {
            let mut o = h.clone();
            for (i, layer) in head.iter().enumerate() {
                o = layer.forward(&o)?;
                if i + 1 < head.len() {
                    o = o.relu()?;
                }
            }
            outs.push(o);
        }
        select_domain(&Tensor::stack(&outs, 1)?, y)
    }
}
