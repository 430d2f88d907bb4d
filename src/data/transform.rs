//! Geometric and photometric preprocessing shared by both pipelines.
//!
//! Crops are described in source-pixel coordinates so the same geometry can
//! be applied to the image and to its landmarks.

use image::{imageops::FilterType, DynamicImage, RgbImage};
use rand::Rng;

/// Side of the identity crop consumed by the ArcFace backbone
pub const ID_CROP_SIZE: u32 = 112;

/// Fraction of the frame kept by the identity crop
const ID_CROP_FRACTION: f32 = 0.8;

/// Axis-aligned crop window in source pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl CropBox {
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, w: width, h: height }
    }
}

/// Random-resized crop window: area scale in [0.8, 1.0], aspect in [0.9, 1.1].
/// Falls back to the full frame after ten rejected draws.
pub fn random_resized_crop(width: u32, height: u32, rng: &mut impl Rng) -> CropBox {
    let area = (width * height) as f32;
    let (log_lo, log_hi) = (0.9f32.ln(), 1.1f32.ln());

    for _ in 0..10 {
        let target_area = area * rng.gen_range(0.8f32..=1.0);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            return CropBox { x, y, w, h };
        }
    }
    CropBox::full(width, height)
}

/// Crop then resize to a `size x size` RGB image
pub fn crop_resize(img: &DynamicImage, crop: CropBox, size: u32) -> RgbImage {
    let cropped = img.crop_imm(crop.x, crop.y, crop.w, crop.h);
    cropped.resize_exact(size, size, FilterType::Triangle).to_rgb8()
}

/// Carry landmark points through a crop + resize
pub fn map_points(points: &[(f32, f32)], crop: CropBox, size: u32) -> Vec<(f32, f32)> {
    let sx = size as f32 / crop.w as f32;
    let sy = size as f32 / crop.h as f32;
    points
        .iter()
        .map(|&(x, y)| ((x - crop.x as f32) * sx, (y - crop.y as f32) * sy))
        .collect()
}

/// Central crop fed to the identity backbone
pub fn identity_crop(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    let cw = ((w as f32) * ID_CROP_FRACTION).round().max(1.0) as u32;
    let ch = ((h as f32) * ID_CROP_FRACTION).round().max(1.0) as u32;
    let x = (w - cw) / 2;
    let y = (h - ch) / 2;
    let cropped = image::imageops::crop_imm(img, x, y, cw, ch).to_image();
    image::imageops::resize(&cropped, ID_CROP_SIZE, ID_CROP_SIZE, FilterType::Triangle)
}

/// HWC u8 -> CHW f32 in [-1, 1]
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0f32; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = px.0[c] as f32 / 127.5 - 1.0;
        }
    }
    out
}
