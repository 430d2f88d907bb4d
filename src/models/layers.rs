//! Building blocks shared by the translation networks: instance norm,
//! adaptive instance norm and the residual blocks of the StarGAN v2 family.

use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{conv2d, conv2d_no_bias, init::Init, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

const EPS: f64 = 1e-5;
const LRELU_SLOPE: f64 = 0.2;

pub fn lrelu(x: &Tensor) -> Result<Tensor> {
    candle_nn::ops::leaky_relu(x, LRELU_SLOPE)
}

pub fn conv3x3(c_in: usize, c_out: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(c_in, c_out, 3, cfg, vb)
}

pub fn conv1x1(c_in: usize, c_out: usize, bias: bool, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig::default();
    if bias {
        conv2d(c_in, c_out, 1, cfg, vb)
    } else {
        conv2d_no_bias(c_in, c_out, 1, cfg, vb)
    }
}

/// Interpolation matrix `[dst, src]` for a half-pixel-centred bilinear resize
fn bilinear_weights(src: usize, dst: usize, device: &Device) -> Result<Tensor> {
    let scale = src as f64 / dst as f64;
    let mut w = vec![0f32; dst * src];
    for i in 0..dst {
        let pos = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (pos.floor() as usize).min(src - 1);
        let i1 = (i0 + 1).min(src - 1);
        let frac = (pos - i0 as f64).clamp(0.0, 1.0) as f32;
        w[i * src + i0] += 1.0 - frac;
        w[i * src + i1] += frac;
    }
    Tensor::from_vec(w, (dst, src), device)
}

/// Bilinear resize of `[B, C, H, W]` to any size, built from plain 2D
/// matmuls so gradients flow for non-integer scale factors.
pub fn resize_bilinear(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let cols = bilinear_weights(w, out_w, x.device())?.to_dtype(x.dtype())?.t()?.contiguous()?;
    let rows = bilinear_weights(h, out_h, x.device())?.to_dtype(x.dtype())?.t()?.contiguous()?;

    // [B*C*H, W] x [W, W'] then [B*C*W', H] x [H, H']
    let x = x.contiguous()?.reshape((b * c * h, w))?.matmul(&cols)?;
    let x = x.reshape((b * c, h, out_w))?.transpose(1, 2)?.contiguous()?;
    let x = x.reshape((b * c * out_w, h))?.matmul(&rows)?;
    x.reshape((b * c, out_w, out_h))?.transpose(1, 2)?.contiguous()?.reshape((b, c, out_h, out_w))
}

/// Normalise each channel of each sample over its spatial extent
pub fn instance_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    centered.broadcast_div(&(var + EPS)?.sqrt()?)
}

/// Instance norm with learned per-channel scale and shift
pub struct AffineInstanceNorm {
    weight: Tensor,
    bias: Tensor,
}

impl AffineInstanceNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight: weight.reshape((1, channels, 1, 1))?,
            bias: bias.reshape((1, channels, 1, 1))?,
        })
    }
}

impl Module for AffineInstanceNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        instance_norm(x)?.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Adaptive instance norm: scale and shift predicted from a style code
pub struct AdaIn {
    fc: Linear,
    channels: usize,
}

impl AdaIn {
    pub fn new(style_dim: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: linear(style_dim, channels * 2, vb.pp("fc"))?,
            channels,
        })
    }

    pub fn forward(&self, x: &Tensor, s: &Tensor) -> Result<Tensor> {
        let b = s.dim(0)?;
        let h = self.fc.forward(s)?.reshape((b, self.channels * 2, 1, 1))?;
        let gamma = h.narrow(1, 0, self.channels)?;
        let beta = h.narrow(1, self.channels, self.channels)?;
        instance_norm(x)?
            .broadcast_mul(&(gamma + 1.0)?)?
            .broadcast_add(&beta)
    }
}

/// Pre-activation residual block used by encoders and discriminators
pub struct ResBlk {
    conv1: Conv2d,
    conv2: Conv2d,
    norm1: Option<AffineInstanceNorm>,
    norm2: Option<AffineInstanceNorm>,
    shortcut: Option<Conv2d>,
    downsample: bool,
}

impl ResBlk {
    pub fn new(dim_in: usize, dim_out: usize, normalize: bool, downsample: bool, vb: VarBuilder) -> Result<Self> {
        let (norm1, norm2) = if normalize {
            (
                Some(AffineInstanceNorm::new(dim_in, vb.pp("norm1"))?),
                Some(AffineInstanceNorm::new(dim_in, vb.pp("norm2"))?),
            )
        } else {
            (None, None)
        };
        let shortcut = if dim_in != dim_out {
            Some(conv1x1(dim_in, dim_out, false, vb.pp("conv1x1"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv3x3(dim_in, dim_in, vb.pp("conv1"))?,
            conv2: conv3x3(dim_in, dim_out, vb.pp("conv2"))?,
            norm1,
            norm2,
            shortcut,
            downsample,
        })
    }

    fn shortcut(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        if self.downsample {
            x = x.avg_pool2d(2)?;
        }
        Ok(x)
    }

    fn residual(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = match &self.norm1 {
            Some(norm) => norm.forward(x)?,
            None => x.clone(),
        };
        h = self.conv1.forward(&lrelu(&h)?)?;
        if self.downsample {
            h = h.avg_pool2d(2)?;
        }
        if let Some(norm) = &self.norm2 {
            h = norm.forward(&h)?;
        }
        self.conv2.forward(&lrelu(&h)?)
    }
}

impl Module for ResBlk {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // unit variance
        ((self.shortcut(x)? + self.residual(x)?)? / std::f64::consts::SQRT_2)
    }
}

/// Residual block whose norms are driven by a style code
pub struct AdainResBlk {
    conv1: Conv2d,
    conv2: Conv2d,
    norm1: AdaIn,
    norm2: AdaIn,
    shortcut: Option<Conv2d>,
    upsample: bool,
    w_hpf: f64,
}

impl AdainResBlk {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        style_dim: usize,
        w_hpf: f64,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shortcut = if dim_in != dim_out {
            Some(conv1x1(dim_in, dim_out, false, vb.pp("conv1x1"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv3x3(dim_in, dim_out, vb.pp("conv1"))?,
            conv2: conv3x3(dim_out, dim_out, vb.pp("conv2"))?,
            norm1: AdaIn::new(style_dim, dim_in, vb.pp("norm1"))?,
            norm2: AdaIn::new(style_dim, dim_out, vb.pp("norm2"))?,
            shortcut,
            upsample,
            w_hpf,
        })
    }

    fn upsample2x(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        x.upsample_nearest2d(h * 2, w * 2)
    }

    fn shortcut(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.upsample { self.upsample2x(x)? } else { x.clone() };
        match &self.shortcut {
            Some(conv) => conv.forward(&x),
            None => Ok(x),
        }
    }

    fn residual(&self, x: &Tensor, s: &Tensor) -> Result<Tensor> {
        let mut h = lrelu(&self.norm1.forward(x, s)?)?;
        if self.upsample {
            h = self.upsample2x(&h)?;
        }
        h = self.conv1.forward(&h)?;
        h = lrelu(&self.norm2.forward(&h, s)?)?;
        self.conv2.forward(&h)
    }

    pub fn forward(&self, x: &Tensor, s: &Tensor) -> Result<Tensor> {
        let out = self.residual(x, s)?;
        // With high-pass skips the shortcut path is carried by the generator
        if self.w_hpf == 0.0 {
            (out + self.shortcut(x)?)? / std::f64::consts::SQRT_2
        } else {
            Ok(out)
        }
    }
}

/// Fixed Laplacian high-pass filter applied channel-wise
pub struct HighPass {
    w_hpf: f64,
}

impl HighPass {
    pub fn new(w_hpf: f64) -> Self {
        Self { w_hpf }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let c = x.dim(1)?;
        let kernel: Vec<f32> = [-1., -1., -1., -1., 8., -1., -1., -1., -1.]
            .iter()
            .map(|v: &f64| (*v / self.w_hpf) as f32)
            .collect();
        let kernel = Tensor::from_vec(kernel, (1, 1, 3, 3), x.device())?
            .to_dtype(x.dtype())?
            .repeat((c, 1, 1, 1))?;
        x.conv2d(&kernel, 1, 1, 1, c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_instance_norm_statistics() -> Result<()> {
        let x = Tensor::randn(3f32, 2.0, (2, 4, 8, 8), &Device::Cpu)?;
        let y = instance_norm(&x)?;
        let mean = y.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let max_mean = mean.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max_mean < 1e-4);
        let var = y.sqr()?.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let worst = (var - 1.0)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(worst < 1e-2);
        Ok(())
    }

    #[test]
    fn test_block_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let x = Tensor::randn(0f32, 1.0, (2, 8, 16, 16), &Device::Cpu)?;
        let s = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu)?;

        let down = ResBlk::new(8, 16, true, true, vb.pp("down"))?;
        assert_eq!(down.forward(&x)?.dims(), &[2, 16, 8, 8]);

        let up = AdainResBlk::new(8, 4, 4, 0.0, true, vb.pp("up"))?;
        assert_eq!(up.forward(&x, &s)?.dims(), &[2, 4, 32, 32]);

        let hp = HighPass::new(1.0).forward(&x)?;
        assert_eq!(hp.dims(), x.dims());
        // a constant image has no high frequencies away from the border
        let flat = Tensor::ones((1, 2, 8, 8), DType::F32, &Device::Cpu)?;
        let centre = HighPass::new(1.0).forward(&flat)?.narrow(2, 1, 6)?.narrow(3, 1, 6)?;
        assert_eq!(centre.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_resize_bilinear_values() -> Result<()> {
        let x = Tensor::new(&[[0f32, 4.0], [8.0, 12.0]], &Device::Cpu)?.reshape((1, 1, 2, 2))?;
        // same size is the identity
        let same = resize_bilinear(&x, 2, 2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(same, vec![0.0, 4.0, 8.0, 12.0]);
        let up = resize_bilinear(&x, 4, 4)?.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(up[0], vec![0.0, 1.0, 3.0, 4.0]);
        assert_eq!(up[3], vec![8.0, 9.0, 11.0, 12.0]);
        // a constant image stays constant at any scale
        let flat = Tensor::full(2f32, (2, 3, 25, 25), &Device::Cpu)?;
        let down = resize_bilinear(&flat, 7, 11)?;
        assert_eq!(down.dims(), &[2, 3, 7, 11]);
        let err = (down - 2.0)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(err < 1e-5);
        Ok(())
    }

    #[test]
    fn test_resize_bilinear_backward_non_integer_scale() -> Result<()> {
        let x = candle_core::Var::randn(0f32, 1.0, (2, 3, 25, 25), &Device::Cpu)?;
        let y = resize_bilinear(x.as_tensor(), 112, 112)?;
        let grads = y.sqr()?.mean_all()?.backward()?;
        let grad = grads.get(x.as_tensor()).expect("gradient for the input");
        assert_eq!(grad.dims(), &[2, 3, 25, 25]);
        assert!(grad.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }
}
