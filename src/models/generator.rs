//! Landmark-conditioned generator.
//!
//! The source image and its landmark heatmap are encoded together, then
//! decoded under a target style code. With `w_hpf > 0` high-pass encoder
//! features, masked by the heatmap, are added back at the matching decoder
//! resolutions.

use super::layers::{conv1x1, conv3x3, lrelu, AdainResBlk, AffineInstanceNorm, HighPass, ResBlk};
use super::NetConfig;
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};
use std::collections::HashMap;

pub struct Generator {
    from_rgb: Conv2d,
    encode: Vec<ResBlk>,
    decode: Vec<AdainResBlk>,
    to_rgb_norm: AffineInstanceNorm,
    to_rgb: Conv2d,
    hpf: Option<HighPass>,
    stages: usize,
    img_size: usize,
}

impl Generator {
    pub fn new(cfg: &NetConfig, vb: VarBuilder) -> Result<Self> {
        let mut dim_in = cfg.base_dim();
        // image channels + landmark heatmap
        let from_rgb = conv3x3(4, dim_in, vb.pp("from_rgb"))?;

        let mut stages = cfg.num_stages();
        if cfg.w_hpf > 0.0 {
            stages += 1;
        }

        let mut encode = Vec::new();
        let mut decode = Vec::new();
        for i in 0..stages {
            let dim_out = (dim_in * 2).min(cfg.max_conv_dim);
            encode.push(ResBlk::new(dim_in, dim_out, true, true, vb.pp(format!("encode.{}", i)))?);
            decode.insert(
                0,
                AdainResBlk::new(dim_out, dim_in, cfg.style_dim, cfg.w_hpf, true, vb.pp(format!("decode_up.{}", i)))?,
            );
            dim_in = dim_out;
        }

        // bottleneck
        for j in 0..2 {
            encode.push(ResBlk::new(dim_in, dim_in, true, false, vb.pp(format!("encode.{}", stages + j)))?);
            decode.insert(
                0,
                AdainResBlk::new(dim_in, dim_in, cfg.style_dim, cfg.w_hpf, false, vb.pp(format!("decode_mid.{}", j)))?,
            );
        }

        let base = cfg.base_dim();
        Ok(Self {
            from_rgb,
            encode,
            decode,
            to_rgb_norm: AffineInstanceNorm::new(base, vb.pp("to_rgb_norm"))?,
            to_rgb: conv1x1(base, 3, true, vb.pp("to_rgb"))?,
            hpf: (cfg.w_hpf > 0.0).then(|| HighPass::new(cfg.w_hpf)),
            stages,
            img_size: cfg.img_size,
        })
    }

    /// Resolutions whose encoder features are reused by the decoder
    fn keeps_skip(&self, size: usize) -> bool {
        size < self.img_size && size >= self.img_size / 8
    }

    /// `x`: `[B, 3, S, S]`, `heatmap`: `[B, 1, S, S]`, `s`: `[B, style_dim]`
    pub fn forward(&self, x: &Tensor, heatmap: &Tensor, s: &Tensor) -> Result<Tensor> {
        let mut x = self.from_rgb.forward(&Tensor::cat(&[x, heatmap], 1)?)?;

        let mut cache: HashMap<usize, Tensor> = HashMap::new();
        for (i, block) in self.encode.iter().enumerate() {
            let size = x.dim(2)?;
            if self.hpf.is_some() && i < self.stages && self.keeps_skip(size) {
                cache.insert(size, x.clone());
            }
            x = block.forward(&x)?;
        }

        for block in &self.decode {
            x = block.forward(&x, s)?;
            let size = x.dim(2)?;
            if let (Some(hpf), Some(skip)) = (&self.hpf, cache.get(&size)) {
                let mask = heatmap.interpolate2d(size, size)?;
                x = (x + hpf.forward(&skip.broadcast_mul(&mask)?)?)?;
            }
        }

        self.to_rgb.forward(&lrelu(&self.to_rgb_norm.forward(&x)?)?)
    }
}
