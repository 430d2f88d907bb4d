//! Error types shared by the configuration and data layers.
//!
//! Trainers and the binary wrap these in `anyhow::Error` with context.

use std::path::PathBuf;

/// Errors raised while resolving the run configuration
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown mode '{0}', expected one of: train, sample, eval, align")]
    UnknownMode(String),
    #[error("unknown dataset '{0}', expected one of: 300vw, mpie, vox1")]
    UnknownDataset(String),
    #[error("unknown loss '{0}', expected one of: arcface, perceptual")]
    UnknownLoss(String),
    #[error("invalid network setting: {0}")]
    InvalidNetwork(String),
    #[error("failed to write config dump to {path}")]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Errors raised while reading file lists, images and landmark annotations
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file list {0} contains no samples")]
    EmptyList(PathBuf),
    #[error("{path}:{line}: {reason}")]
    MalformedLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("no landmark annotation found for {0}")]
    MissingLandmarks(PathBuf),
    #[error("invalid landmark file {path}: {reason}")]
    Landmarks { path: PathBuf, reason: String },
    #[error("landmark count mismatch for {path}: expected {expected}, found {found}")]
    LandmarkCount {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("failed to decode image {path}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl DataError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
