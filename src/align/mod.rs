//! Face alignment preprocessing: warp every image of a directory so that
//! its landmarks land on a mean face template.

pub mod similarity;

pub use similarity::{warp, Similarity};

use crate::config::Config;
use crate::data::{load_landmarks, sidecar_landmarks, Landmarks};
use crate::error::DataError;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Tensor};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Template coordinates are stored for 256x256 faces
const TEMPLATE_SIZE: f32 = 256.0;
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Read the template landmarks from an `.npz` archive (`mean` entry, else
/// the first array), scaled to `img_size`
pub fn load_template(path: &Path, img_size: usize) -> Result<Landmarks> {
    let arrays = Tensor::read_npz(path).with_context(|| format!("Failed to read landmark template {:?}", path))?;
    let tensor = arrays
        .iter()
        .find(|(name, _)| name == "mean")
        .or_else(|| arrays.first())
        .map(|(_, t)| t)
        .ok_or_else(|| anyhow!("Landmark template {:?} holds no arrays", path))?;

    let count = tensor.elem_count();
    if count == 0 || count % 2 != 0 {
        return Err(DataError::Landmarks {
            path: path.to_path_buf(),
            reason: format!("expected N x 2 coordinates, found {} values", count),
        }
        .into());
    }
    let rows = tensor.to_dtype(DType::F32)?.reshape((count / 2, 2))?.to_vec2::<f32>()?;
    let scale = img_size as f32 / TEMPLATE_SIZE;
    Ok(rows.into_iter().map(|r| (r[0] * scale, r[1] * scale)).collect())
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read input directory {:?}", dir))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Align one image; `Ok(false)` when it has no landmark annotation
fn align_one(path: &Path, template: &[(f32, f32)], img_size: u32, out_dir: &Path) -> Result<bool> {
    let Some(lm_path) = sidecar_landmarks(path) else {
        warn!("Skipping {:?}: no landmark annotation", path);
        return Ok(false);
    };
    let points = load_landmarks(&lm_path)?;
    if points.len() != template.len() {
        return Err(DataError::LandmarkCount {
            path: lm_path,
            expected: template.len(),
            found: points.len(),
        }
        .into());
    }

    let to_template = Similarity::estimate(&points, template)
        .ok_or_else(|| anyhow!("Degenerate landmarks for {:?}", path))?;
    let to_source = to_template
        .inverse()
        .ok_or_else(|| anyhow!("Singular alignment transform for {:?}", path))?;

    let img = image::open(path)
        .map_err(|source| DataError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let aligned = warp(&img, &to_source, img_size);

    let name = path.file_name().ok_or_else(|| anyhow!("No file name in {:?}", path))?;
    let out_path = out_dir.join(name);
    aligned
        .save(&out_path)
        .with_context(|| format!("Failed to save {:?}", out_path))?;
    Ok(true)
}

/// Align every image of `inp_dir` into `out_dir` at `config.img_size`
pub fn align_faces(config: &Config, inp_dir: &Path, out_dir: &Path) -> Result<()> {
    info!("Aligning faces from {:?} to {:?}", inp_dir, out_dir);
    info!("Landmark template: {:?}, detector weights: {:?}", config.lm_path, config.wing_path);

    let template = load_template(&config.lm_path, config.img_size)?;
    fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {:?}", out_dir))?;

    let images = list_images(inp_dir)?;
    let mut aligned = 0;
    for path in &images {
        if align_one(path, &template, config.img_size as u32, out_dir)? {
            aligned += 1;
        }
    }
    info!("Aligned {}/{} images", aligned, images.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use image::{Rgb, RgbImage};

    fn config_for(dir: &Path, lm: &Path) -> Config {
        let lm = lm.to_string_lossy().to_string();
        let list_dir = dir.to_string_lossy().to_string();
        Config::try_parse_resolved_from([
            "trainer", "--mode", "align", "--img_size", "64", "--lm_path", lm.as_str(), "--list_dir",
            list_dir.as_str(),
        ])
        .unwrap()
    }

    fn write_template(path: &Path) {
        // eyes and mouth of a 256 template
        let t = Tensor::new(&[[96f32, 112.0], [160.0, 112.0], [128.0, 176.0]], &Device::Cpu).unwrap();
        Tensor::write_npz(&[("mean", &t)], path).unwrap();
    }

    #[test]
    fn test_template_scaling() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lm = dir.path().join("lm.npz");
        write_template(&lm);
        let pts = load_template(&lm, 128)?;
        assert_eq!(pts, vec![(48.0, 56.0), (80.0, 56.0), (64.0, 88.0)]);
        Ok(())
    }

    #[test]
    fn test_align_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lm = dir.path().join("lm.npz");
        write_template(&lm);
        let (inp, out) = (dir.path().join("inp"), dir.path().join("out"));
        fs::create_dir_all(&inp)?;

        // landmarks at twice the template scale (64 / 256 * 2)
        let mut img = RgbImage::from_pixel(100, 90, Rgb([20, 20, 20]));
        img.put_pixel(48, 56, Rgb([250, 250, 250]));
        img.save(inp.join("face.png"))?;
        fs::write(inp.join("face.pts"), "version: 1\nn_points: 3\n{\n48 56\n80 56\n64 88\n}\n")?;
        // no annotation: skipped
        img.save(inp.join("bare.jpg"))?;

        align_faces(&config_for(dir.path(), &lm), &inp, &out)?;

        let aligned = image::open(out.join("face.png"))?.to_rgb8();
        assert_eq!(aligned.dimensions(), (64, 64));
        // left eye lands on the template's (24, 28)
        assert_eq!(aligned.get_pixel(24, 28), &Rgb([250, 250, 250]));
        assert!(!out.join("bare.jpg").exists());
        Ok(())
    }

    #[test]
    fn test_landmark_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let lm = dir.path().join("lm.npz");
        write_template(&lm);
        let inp = dir.path().join("inp");
        fs::create_dir_all(&inp).unwrap();
        RgbImage::new(10, 10).save(inp.join("face.png")).unwrap();
        fs::write(inp.join("face.pts"), "1 1\n5 5\n").unwrap();

        let err = align_faces(&config_for(dir.path(), &lm), &inp, &dir.path().join("out")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::LandmarkCount { expected: 3, found: 2, .. })
        ));
    }
}
