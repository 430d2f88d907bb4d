//! Loader factories and the per-mode loader bundle.

use super::loader::{DataLoader, LoaderSpec, Pipeline};
use crate::config::{Config, Dataset, LossKind, Mode};
use crate::runtime;
use anyhow::Result;
use log::info;
use std::path::Path;

/// Named loaders handed to the solver for one run
pub struct Loaders {
    pub src: DataLoader,
    pub val: Option<DataLoader>,
    /// Reference-image loader; no mode builds it yet
    pub reference: Option<DataLoader>,
}

impl Loaders {
    /// Names of the populated slots, in `src`, `val`, `ref` order
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = vec!["src"];
        if self.val.is_some() {
            keys.push("val");
        }
        if self.reference.is_some() {
            keys.push("ref");
        }
        keys
    }
}

#[allow(clippy::too_many_arguments)]
fn make_loader(
    root: &Path,
    train_data: Dataset,
    img_size: usize,
    batch_size: usize,
    shuffle: bool,
    prob: f64,
    num_workers: usize,
    pipeline: Pipeline,
) -> Result<DataLoader> {
    let spec = LoaderSpec {
        root: root.to_path_buf(),
        dataset: train_data,
        img_size,
        batch_size,
        shuffle,
        prob,
        num_workers,
        pipeline,
    };
    DataLoader::new(spec, runtime::device(), runtime::seed())
}

/// Training loader for the identity (ArcFace) pipeline
pub fn get_train_loader(
    root: impl AsRef<Path>,
    train_data: Dataset,
    img_size: usize,
    batch_size: usize,
    shuffle: bool,
    prob: f64,
    num_workers: usize,
) -> Result<DataLoader> {
    make_loader(root.as_ref(), train_data, img_size, batch_size, shuffle, prob, num_workers, Pipeline::ArcFace)
}

/// Evaluation loader for the identity (ArcFace) pipeline; never crops
pub fn get_test_loader(
    root: impl AsRef<Path>,
    train_data: Dataset,
    img_size: usize,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
) -> Result<DataLoader> {
    make_loader(root.as_ref(), train_data, img_size, batch_size, shuffle, 0.0, num_workers, Pipeline::ArcFace)
}

/// Training loader for the perceptual (VGG) pipeline
pub fn get_train_loader_vgg(
    root: impl AsRef<Path>,
    train_data: Dataset,
    img_size: usize,
    batch_size: usize,
    shuffle: bool,
    prob: f64,
    num_workers: usize,
) -> Result<DataLoader> {
    make_loader(root.as_ref(), train_data, img_size, batch_size, shuffle, prob, num_workers, Pipeline::Vgg)
}

/// Evaluation loader for the perceptual (VGG) pipeline; never crops
pub fn get_test_loader_vgg(
    root: impl AsRef<Path>,
    train_data: Dataset,
    img_size: usize,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
) -> Result<DataLoader> {
    make_loader(root.as_ref(), train_data, img_size, batch_size, shuffle, 0.0, num_workers, Pipeline::Vgg)
}

/// Build the loaders a mode consumes. `eval` and `align` take none.
pub fn build_loaders(config: &Config) -> Result<Option<Loaders>> {
    let root = config.train_list();
    let loaders = match config.mode {
        Mode::Train => {
            let (src, val) = match config.loss {
                LossKind::Arcface => (
                    get_train_loader(
                        &root,
                        config.dataset,
                        config.img_size,
                        config.batch_size,
                        true,
                        config.randcrop_prob,
                        config.num_workers,
                    )?,
                    get_test_loader(
                        &root,
                        config.dataset,
                        config.img_size,
                        config.val_batch_size,
                        false,
                        config.num_workers,
                    )?,
                ),
                LossKind::Perceptual => (
                    get_train_loader_vgg(
                        &root,
                        config.dataset,
                        config.img_size,
                        config.batch_size,
                        true,
                        config.randcrop_prob,
                        config.num_workers,
                    )?,
                    get_test_loader_vgg(
                        &root,
                        config.dataset,
                        config.img_size,
                        config.val_batch_size,
                        false,
                        config.num_workers,
                    )?,
                ),
            };
            Loaders {
                src,
                val: Some(val),
                reference: None,
            }
        }
        // Source-only until reference-guided sampling has a pairing contract
        Mode::Sample => Loaders {
            src: get_test_loader_vgg(
                &root,
                config.dataset,
                config.img_size,
                config.val_batch_size,
                false,
                config.num_workers,
            )?,
            val: None,
            reference: None,
        },
        Mode::Eval | Mode::Align => return Ok(None),
    };

    info!("Built loaders {:?} for mode {:?}", loaders.keys(), config.mode);
    Ok(Some(loaders))
}
