//! Objective terms of the translation GAN and the frozen backbones some of
//! them need.

use crate::config::LossKind;
use crate::models::{ArcFace, Vgg16Features};
use candle_core::{Device, Result, Tensor};
use log::{info, warn};
use std::path::Path;

/// Step size of the finite-difference gradient probe used for R1
pub const R1_PROBE_EPS: f64 = 1e-2;

/// Numerically stable `log(1 + exp(x))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?
}

/// Binary cross-entropy of logits against a constant 0/1 target
pub fn adv_loss(logits: &Tensor, target: f64) -> Result<Tensor> {
    if target >= 0.5 {
        softplus(&logits.neg()?)?.mean_all()
    } else {
        softplus(logits)?.mean_all()
    }
}

pub fn l1(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    (a - b)?.abs()?.mean_all()
}

/// Zero-centred gradient penalty on real images, estimated along a random
/// direction: `0.5 * E[((D(x + eps u) - D(x)) / eps)^2]`.
pub fn r1_penalty<F>(d: F, x: &Tensor, d_real: &Tensor, probe: &Tensor, eps: f64) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let shifted = d(&(x + (probe * eps)?)?)?;
    let slope = ((shifted - d_real)? / eps)?;
    slope.sqr()?.mean_all()? * 0.5
}

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = (x.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-8)?;
    x.broadcast_div(&norm)
}

/// Mean `1 - cos(a, b)` over the batch
pub fn cosine_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let cos = (l2_normalize(a)? * l2_normalize(b)?)?.sum(1)?;
    cos.neg()?.affine(1.0, 1.0)?.mean_all()
}

/// Sum of L1 distances between matching feature maps
pub fn perceptual_loss(a: &[Tensor], b: &[Tensor]) -> Result<Tensor> {
    let Some(first) = a.first() else {
        candle_core::bail!("perceptual loss needs at least one feature map")
    };
    let mut total = Tensor::zeros((), candle_core::DType::F32, first.device())?;
    for (fa, fb) in a.iter().zip(b) {
        total = (total + l1(fa, fb)?)?;
    }
    Ok(total)
}

/// L1 distance between the deepest feature maps
pub fn content_loss(a: &[Tensor], b: &[Tensor]) -> Result<Tensor> {
    match (a.last(), b.last()) {
        (Some(fa), Some(fb)) => l1(fa, fb),
        _ => candle_core::bail!("content loss needs at least one feature map"),
    }
}

/// Frozen networks for the active loss pipeline
#[derive(Default)]
pub struct Backbones {
    pub vgg: Option<Vgg16Features>,
    pub arcface: Option<ArcFace>,
}

impl Backbones {
    /// Load the backbone `loss` needs. A missing or unreadable weight file
    /// disables the corresponding loss terms.
    pub fn load(loss: LossKind, vgg_path: &Path, arcface_path: &Path, device: &Device) -> Self {
        let mut backbones = Self::default();
        match loss {
            LossKind::Perceptual => match Vgg16Features::load(vgg_path, device) {
                Ok(vgg) => {
                    info!("Loaded VGG16 features from {:?}", vgg_path);
                    backbones.vgg = Some(vgg);
                }
                Err(e) => warn!("Perceptual and content losses disabled: {:#}", e),
            },
            LossKind::Arcface => match ArcFace::load(arcface_path, device) {
                Ok(arcface) => {
                    info!("Loaded ArcFace backbone from {:?}", arcface_path);
                    backbones.arcface = Some(arcface);
                }
                Err(e) => warn!("Identity loss disabled: {:#}", e),
            },
        }
        backbones
    }
}
