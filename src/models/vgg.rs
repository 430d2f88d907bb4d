//! Frozen VGG16 feature extractor used by the perceptual and content losses.
//!
//! Weights follow the torchvision `features.{i}` naming and are read from a
//! safetensors file. Only the layers up to `relu4_3` are built.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use std::path::Path;

/// Conv output channels; `None` is a 2x2 max pool
const LAYOUT: [Option<usize>; 13] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
];

/// torchvision indices of relu1_2, relu2_2, relu3_3, relu4_3
const TAPS: [usize; 4] = [3, 8, 15, 22];

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

enum Layer {
    Conv { conv: Conv2d, relu_index: usize },
    Pool,
}

pub struct Vgg16Features {
    layers: Vec<Layer>,
    mean: Tensor,
    std: Tensor,
}

impl Vgg16Features {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(LAYOUT.len());
        let mut index = 0;
        let mut c_in = 3;
        for entry in LAYOUT {
            match entry {
                Some(c_out) => {
                    let conv = conv2d(c_in, c_out, 3, cfg, vb.pp(format!("features.{}", index)))?;
                    layers.push(Layer::Conv {
                        conv,
                        relu_index: index + 1,
                    });
                    c_in = c_out;
                    index += 2;
                }
                None => {
                    layers.push(Layer::Pool);
                    index += 1;
                }
            }
        }

        let device = vb.device();
        Ok(Self {
            layers,
            mean: Tensor::new(&MEAN, device)?.reshape((1, 3, 1, 1))?,
            std: Tensor::new(&STD, device)?.reshape((1, 3, 1, 1))?,
        })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load VGG16 weights from {:?}", path))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Ok(Self::new(vb)?)
    }

    /// Feature maps at the four tap points for images in `[-1, 1]`
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let x = ((x + 1.0)? / 2.0)?;
        let mut h = x.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?;

        let mut taps = Vec::with_capacity(TAPS.len());
        for layer in &self.layers {
            match layer {
                Layer::Conv { conv, relu_index } => {
                    h = conv.forward(&h)?.relu()?;
                    if TAPS.contains(relu_index) {
                        taps.push(h.clone());
                    }
                }
                Layer::Pool => h = h.max_pool2d(2)?,
            }
        }
        Ok(taps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_taps_and_weight_names() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vgg = Vgg16Features::new(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        for idx in [0, 2, 5, 7, 10, 12, 14, 17, 19, 21] {
            assert!(names.contains(&format!("features.{}.weight", idx)), "missing features.{}", idx);
        }

        let x = Tensor::zeros((1, 3, 32, 32), DType::F32, &device)?;
        let feats = vgg.forward(&x)?;
        let shapes: Vec<_> = feats.iter().map(|f| f.dims().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![vec![1, 64, 32, 32], vec![1, 128, 16, 16], vec![1, 256, 8, 8], vec![1, 512, 4, 4]]
        );
        Ok(())
    }

    #[test]
    fn test_missing_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Vgg16Features::load(&dir.path().join("vgg16.safetensors"), &Device::Cpu).is_err());
    }
}
