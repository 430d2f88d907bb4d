//! Batched data loader producing candle tensors.
//!
//! Samples of a batch are decoded on a rayon pool when workers are
//! requested. Every sample draws its augmentation from its own seed, which is
//! taken from the loader RNG in batch order, so results do not depend on the
//! worker count.

use super::landmarks::{heatmap_sigma, load_landmarks, render_heatmap};
use super::list::{read_list, ListEntry};
use super::transform::{crop_resize, identity_crop, map_points, random_resized_crop, to_chw, CropBox, ID_CROP_SIZE};
use crate::config::Dataset;
use crate::error::DataError;
use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::PathBuf;

/// Preprocessing pipeline, matched to the backbone of the similarity loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Full frame plus a 112x112 identity crop per sample
    ArcFace,
    /// Full frame only
    Vgg,
}

/// Everything a loader needs to know about its source and batching
#[derive(Debug, Clone)]
pub struct LoaderSpec {
    /// File list to read
    pub root: PathBuf,
    pub dataset: Dataset,
    pub img_size: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    /// Probability of a random-resized crop (0 disables it)
    pub prob: f64,
    pub num_workers: usize,
    pub pipeline: Pipeline,
}

/// One collated batch
#[derive(Debug)]
pub struct Batch {
    /// `[B, 3, S, S]` in [-1, 1]
    pub images: Tensor,
    /// `[B, 1, S, S]` landmark heatmaps in [0, 1]
    pub landmarks: Tensor,
    /// `[B]` domain labels (u32)
    pub labels: Tensor,
    /// `[B, 3, 112, 112]`, ArcFace pipeline only
    pub id_images: Option<Tensor>,
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The batch with every sample moved `shift` places back, so that
    /// sample `i` of the result is sample `(i + shift) % len` of `self`
    pub fn rolled(&self, shift: usize) -> candle_core::Result<Batch> {
        let n = self.len();
        let shift = if n == 0 { 0 } else { shift % n };
        let roll = |t: &Tensor| -> candle_core::Result<Tensor> {
            if shift == 0 {
                return Ok(t.clone());
            }
            Tensor::cat(&[t.narrow(0, shift, n - shift)?, t.narrow(0, 0, shift)?], 0)
        };

        let mut paths = self.paths.clone();
        paths.rotate_left(shift);
        Ok(Batch {
            images: roll(&self.images)?,
            landmarks: roll(&self.landmarks)?,
            labels: roll(&self.labels)?,
            id_images: self.id_images.as_ref().map(roll).transpose()?,
            paths,
        })
    }
}

struct Sample {
    image: Vec<f32>,
    heatmap: Vec<f32>,
    id_image: Option<Vec<f32>>,
    domain: u32,
    path: PathBuf,
}

pub struct DataLoader {
    spec: LoaderSpec,
    entries: Vec<ListEntry>,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
    pool: Option<rayon::ThreadPool>,
    device: Device,
}

impl DataLoader {
    /// Read the file list and prepare the first epoch
    pub fn new(spec: LoaderSpec, device: Device, seed: u64) -> Result<Self> {
        if spec.batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        if spec.img_size == 0 {
            anyhow::bail!("image size must be positive");
        }
        if !(0.0..=1.0).contains(&spec.prob) {
            anyhow::bail!("crop probability must lie in [0, 1], got {}", spec.prob);
        }

        let entries = read_list(&spec.root)
            .with_context(|| format!("Failed to load {} file list: {}", spec.dataset, spec.root.display()))?;

        let workers = spec.num_workers.min(num_cpus::get());
        let pool = if workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("loader-{}", i))
                    .build()
                    .context("Failed to start loader workers")?,
            )
        } else {
            None
        };

        info!(
            "Loaded {} samples from {} ({:?} pipeline, batch {}, {} workers)",
            entries.len(),
            spec.root.display(),
            spec.pipeline,
            spec.batch_size,
            workers
        );

        let mut loader = Self {
            order: (0..entries.len()).collect(),
            entries,
            spec,
            cursor: 0,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
            pool,
            device,
        };
        if loader.spec.shuffle {
            loader.order.shuffle(&mut loader.rng);
        }
        Ok(loader)
    }

    pub fn spec(&self) -> &LoaderSpec {
        &self.spec
    }

    pub fn pipeline(&self) -> Pipeline {
        self.spec.pipeline
    }

    pub fn dataset(&self) -> Dataset {
        self.spec.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.spec.batch_size
    }

    /// Number of samples in the file list
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Batches per epoch, counting a trailing short batch
    pub fn num_batches(&self) -> usize {
        (self.entries.len() + self.spec.batch_size - 1) / self.spec.batch_size
    }

    /// Completed epoch count
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Next full batch; wraps into a new (reshuffled) epoch as needed
    pub fn next_batch(&mut self) -> Result<Batch> {
        let mut indices = Vec::with_capacity(self.spec.batch_size);
        while indices.len() < self.spec.batch_size {
            if self.cursor >= self.entries.len() {
                self.start_epoch();
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        self.load(&indices)
    }

    /// Walk one epoch from its start; the last batch may be short
    pub fn iter_epoch(&mut self) -> EpochIter<'_> {
        if self.cursor != 0 {
            self.start_epoch();
        }
        EpochIter { loader: self }
    }

    fn start_epoch(&mut self) {
        self.epoch += 1;
        self.cursor = 0;
        if self.spec.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        debug!("{} starting epoch {}", self.spec.root.display(), self.epoch);
    }

    fn load(&mut self, indices: &[usize]) -> Result<Batch> {
        let seeds: Vec<u64> = indices.iter().map(|_| self.rng.gen()).collect();
        let jobs: Vec<(&ListEntry, u64)> = indices.iter().map(|&i| &self.entries[i]).zip(seeds).collect();
        let spec = &self.spec;

        let samples = match &self.pool {
            Some(pool) => pool.install(|| {
                jobs.par_iter()
                    .map(|(entry, seed)| load_sample(entry, *seed, spec))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => jobs
                .iter()
                .map(|(entry, seed)| load_sample(entry, *seed, spec))
                .collect::<Result<Vec<_>>>()?,
        };

        collate(samples, spec, &self.device)
    }
}

pub struct EpochIter<'a> {
    loader: &'a mut DataLoader,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let loader = &mut *self.loader;
        if loader.cursor >= loader.entries.len() {
            return None;
        }
        let end = (loader.cursor + loader.spec.batch_size).min(loader.entries.len());
        let indices = loader.order[loader.cursor..end].to_vec();
        loader.cursor = end;
        Some(loader.load(&indices))
    }
}

fn load_sample(entry: &ListEntry, seed: u64, spec: &LoaderSpec) -> Result<Sample> {
    let img = image::open(&entry.image).map_err(|source| DataError::Image {
        path: entry.image.clone(),
        source,
    })?;
    let points = load_landmarks(&entry.landmarks)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let crop = if spec.prob > 0.0 && rng.gen::<f64>() < spec.prob {
        random_resized_crop(img.width(), img.height(), &mut rng)
    } else {
        CropBox::full(img.width(), img.height())
    };

    let size = spec.img_size as u32;
    let rgb = crop_resize(&img, crop, size);
    let points = map_points(&points, crop, size);
    let heatmap = render_heatmap(&points, spec.img_size, heatmap_sigma(spec.img_size));
    let id_image = match spec.pipeline {
        Pipeline::ArcFace => Some(to_chw(&identity_crop(&rgb))),
        Pipeline::Vgg => None,
    };

    Ok(Sample {
        image: to_chw(&rgb),
        heatmap,
        id_image,
        domain: entry.domain,
        path: entry.image.clone(),
    })
}

fn collate(samples: Vec<Sample>, spec: &LoaderSpec, device: &Device) -> Result<Batch> {
    let b = samples.len();
    let s = spec.img_size;
    let id = ID_CROP_SIZE as usize;

    let mut images = Vec::with_capacity(b * 3 * s * s);
    let mut heatmaps = Vec::with_capacity(b * s * s);
    let mut id_images = Vec::new();
    let mut labels = Vec::with_capacity(b);
    let mut paths = Vec::with_capacity(b);

    for sample in samples {
        images.extend_from_slice(&sample.image);
        heatmaps.extend_from_slice(&sample.heatmap);
        if let Some(id_image) = &sample.id_image {
            id_images.extend_from_slice(id_image);
        }
        labels.push(sample.domain);
        paths.push(sample.path);
    }

    let id_images = match spec.pipeline {
        Pipeline::ArcFace => Some(Tensor::from_vec(id_images, (b, 3, id, id), device)?),
        Pipeline::Vgg => None,
    };

    Ok(Batch {
        images: Tensor::from_vec(images, (b, 3, s, s), device)?,
        landmarks: Tensor::from_vec(heatmaps, (b, 1, s, s), device)?,
        labels: Tensor::from_vec(labels, b, device)?,
        id_images,
        paths,
    })
}
