//! IResNet-50 face recognition backbone, used frozen for the identity loss.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};
use std::path::Path;

use super::layers::resize_bilinear;

pub const ARCFACE_INPUT: usize = 112;
pub const EMBEDDING_DIM: usize = 512;
const BN_EPS: f64 = 1e-5;

struct PRelu {
    weight: Tensor,
}

impl PRelu {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", candle_nn::init::Init::Const(0.25))?;
        Ok(Self { weight })
    }
}

impl Module for PRelu {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let w = self.weight.reshape((1, (), 1, 1))?;
        let neg = x.neg()?.relu()?.broadcast_mul(&w)?;
        x.relu()? - neg
    }
}

fn conv3x3(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(c_in, c_out, 3, cfg, vb)
}

struct IBasicBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    prelu: PRelu,
    conv2: Conv2d,
    bn3: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl IBasicBlock {
    fn new(inplanes: usize, planes: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let downsample = if stride != 1 || inplanes != planes {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            Some((
                conv2d_no_bias(inplanes, planes, 1, cfg, vb.pp("downsample.0"))?,
                batch_norm(planes, BN_EPS, vb.pp("downsample.1"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            bn1: batch_norm(inplanes, BN_EPS, vb.pp("bn1"))?,
            conv1: conv3x3(inplanes, planes, 1, vb.pp("conv1"))?,
            bn2: batch_norm(planes, BN_EPS, vb.pp("bn2"))?,
            prelu: PRelu::new(planes, vb.pp("prelu"))?,
            conv2: conv3x3(planes, planes, stride, vb.pp("conv2"))?,
            bn3: batch_norm(planes, BN_EPS, vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl Module for IBasicBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.bn1.forward_t(x, false)?;
        let out = self.conv1.forward(&out)?;
        let out = self.bn2.forward_t(&out, false)?;
        let out = self.prelu.forward(&out)?;
        let out = self.conv2.forward(&out)?;
        let out = self.bn3.forward_t(&out, false)?;
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(x)?, false)?,
            None => x.clone(),
        };
        out + identity
    }
}

pub struct ArcFace {
    conv1: Conv2d,
    bn1: BatchNorm,
    prelu: PRelu,
    blocks: Vec<IBasicBlock>,
    bn2: BatchNorm,
    fc: Linear,
    features: BatchNorm,
}

impl ArcFace {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let conv1 = conv3x3(3, 64, 1, vb.pp("conv1"))?;
        let bn1 = batch_norm(64, BN_EPS, vb.pp("bn1"))?;
        let prelu = PRelu::new(64, vb.pp("prelu"))?;

        let mut blocks = Vec::new();
        let mut inplanes = 64;
        for (i, (planes, depth)) in [(64, 3), (128, 4), (256, 14), (512, 3)].into_iter().enumerate() {
            let vb = vb.pp(format!("layer{}", i + 1));
            for j in 0..depth {
                let stride = if j == 0 { 2 } else { 1 };
                blocks.push(IBasicBlock::new(inplanes, planes, stride, vb.pp(j))?);
                inplanes = planes;
            }
        }

        // 112 -> 7 after four stride-2 stages
        let spatial = ARCFACE_INPUT / 16;
        Ok(Self {
            conv1,
            bn1,
            prelu,
            blocks,
            bn2: batch_norm(512, BN_EPS, vb.pp("bn2"))?,
            fc: linear(512 * spatial * spatial, EMBEDDING_DIM, vb.pp("fc"))?,
            features: batch_norm(EMBEDDING_DIM, BN_EPS, vb.pp("features"))?,
        })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load ArcFace weights from {:?}", path))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Ok(Self::new(vb)?)
    }

    /// Identity embeddings `[B, 512]` for images in `[-1, 1]`
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let x = if h != ARCFACE_INPUT || w != ARCFACE_INPUT {
            resize_bilinear(x, ARCFACE_INPUT, ARCFACE_INPUT)?
        } else {
            x.clone()
        };

        let mut h = self.conv1.forward(&x)?;
        h = self.bn1.forward_t(&h, false)?;
        h = self.prelu.forward(&h)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        h = self.bn2.forward_t(&h, false)?;
        let h = self.fc.forward(&h.flatten_from(1)?)?;
        self.features.forward_t(&h, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_basic_block_downsamples() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = IBasicBlock::new(8, 16, 2, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &device)?;
        assert_eq!(block.forward(&x)?.dims(), &[2, 16, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_prelu_scales_negatives() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let prelu = PRelu::new(1, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let x = Tensor::new(&[-4f32, 2.0], &device)?.reshape((1, 1, 1, 2))?;
        let y = prelu.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(y, vec![-1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_missing_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ArcFace::load(&dir.path().join("arcface.safetensors"), &Device::Cpu).is_err());
    }
}
