//! Style encoder and discriminator. Both reduce an image to a single
//! feature vector with the same residual trunk, then read out one head per
//! domain.

use super::layers::{conv1x1, conv3x3, lrelu, ResBlk};
use super::{select_domain, NetConfig};
use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

struct Trunk {
    stem: Conv2d,
    blocks: Vec<ResBlk>,
    head: Conv2d,
    out_dim: usize,
}

impl Trunk {
    fn new(cfg: &NetConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let mut dim_in = cfg.base_dim();
        let stem = conv3x3(in_channels, dim_in, vb.pp("stem"))?;

        // down to 4x4
        let stages = cfg.num_stages() + 2;
        let mut blocks = Vec::with_capacity(stages);
        for i in 0..stages {
            let dim_out = (dim_in * 2).min(cfg.max_conv_dim);
            blocks.push(ResBlk::new(dim_in, dim_out, false, true, vb.pp(format!("blocks.{}", i)))?);
            dim_in = dim_out;
        }
        let head = conv2d(dim_in, dim_in, 4, Conv2dConfig::default(), vb.pp("head"))?;

        Ok(Self {
            stem,
            blocks,
            head,
            out_dim: dim_in,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.stem.forward(x)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let h = lrelu(&self.head.forward(&lrelu(&h)?)?)?;
        h.flatten_from(1)
    }
}

pub struct StyleEncoder {
    trunk: Trunk,
    heads: Vec<Linear>,
}

impl StyleEncoder {
    pub fn new(cfg: &NetConfig, vb: VarBuilder) -> Result<Self> {
        let trunk = Trunk::new(cfg, 3, vb.pp("trunk"))?;
        let heads = (0..cfg.num_domains)
            .map(|d| linear(trunk.out_dim, cfg.style_dim, vb.pp(format!("unshared.{}", d))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { trunk, heads })
    }

    /// `x`: `[B, 3, S, S]`, `y`: `[B]` u32 -> `[B, style_dim]`
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let h = self.trunk.forward(x)?;
        let outs = self
            .heads
            .iter()
            .map(|head| head.forward(&h))
            .collect::<Result<Vec<_>>>()?;
        select_domain(&Tensor::stack(&outs, 1)?, y)
    }
}

/// Conditional discriminator: judges an image together with the landmark
/// heatmap it is supposed to follow
pub struct Discriminator {
    trunk: Trunk,
    out: Conv2d,
    num_domains: usize,
}

impl Discriminator {
    pub fn new(cfg: &NetConfig, vb: VarBuilder) -> Result<Self> {
        let trunk = Trunk::new(cfg, 4, vb.pp("trunk"))?;
        let out = conv1x1(trunk.out_dim, cfg.num_domains, true, vb.pp("out"))?;
        Ok(Self {
            trunk,
            out,
            num_domains: cfg.num_domains,
        })
    }

    /// Logit of the `y` domain head, `[B]`
    pub fn forward(&self, x: &Tensor, heatmap: &Tensor, y: &Tensor) -> Result<Tensor> {
        let h = self.trunk.forward(&Tensor::cat(&[x, heatmap], 1)?)?;
        let b = h.dim(0)?;
        let h = h.reshape((b, self.trunk.out_dim, 1, 1))?;
        let logits = self.out.forward(&h)?.reshape((b, self.num_domains))?;
        select_domain(&logits, y)
    }
}
