//! Saving generated tensors as images.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use image::{ImageFormat, RgbImage};
use std::path::Path;

/// `[3, H, W]` in [-1, 1] -> 8-bit RGB image
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.round()?.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        bail!("Expected 3 channels (RGB), got {}", channel);
    }

    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, data).context("Failed to create image buffer")
}

pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let img = tensor_to_image(tensor)?;
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image to {:?}", path))?;
    Ok(())
}

/// Tile batches into one image: each `[B, 3, H, W]` entry of `rows` becomes
/// one row of `B` images.
pub fn save_grid<P: AsRef<Path>>(rows: &[Tensor], path: P) -> Result<()> {
    if rows.is_empty() {
        bail!("Cannot save an empty image grid");
    }

    let mut strips = Vec::with_capacity(rows.len());
    for row in rows {
        let (b, c, h, w) = row.dims4().context("Expected grid rows of shape [B, C, H, W]")?;
        strips.push(row.permute((1, 2, 0, 3))?.reshape((c, h, b * w))?);
    }
    let grid = Tensor::cat(&strips, 1)?;
    save_image(&grid, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_to_image_range() -> Result<()> {
        let t = Tensor::new(&[-1f32, 0.0, 1.0, 2.0], &Device::Cpu)?
            .reshape((1, 1, 4))?
            .repeat((3, 1, 1))?;
        let img = tensor_to_image(&t)?;
        let reds: Vec<u8> = (0..4).map(|x| img.get_pixel(x, 0)[0]).collect();
        assert_eq!(reds, vec![0, 128, 255, 255]);
        Ok(())
    }

    #[test]
    fn test_save_grid_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let top = Tensor::ones((3, 3, 4, 5), DType::F32, &device)?;
        let bottom = top.neg()?;
        let path = dir.path().join("nested/grid.jpg");
        save_grid(&[top, bottom], &path)?;

        let img = image::open(&path)?.to_rgb8();
        assert_eq!(img.dimensions(), (15, 8));
        assert!(img.get_pixel(7, 1)[0] > 200);
        assert!(img.get_pixel(7, 6)[0] < 50);
        Ok(())
    }

    #[test]
    fn test_rejects_grayscale() {
        let t = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
    }
}
