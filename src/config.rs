//! Run configuration: command-line flags, dataset file-list resolution and
//! the reproducibility dump written before every run.

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What a single process invocation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Sample,
    Eval,
    Align,
}

/// Which frozen backbone supplies the similarity loss, and therefore which
/// data pipeline feeds the solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Arcface,
    Perceptual,
}

/// Known training corpora
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Dataset {
    #[value(name = "300vw")]
    #[serde(rename = "300vw")]
    Vw300,
    #[value(name = "mpie")]
    #[serde(rename = "mpie")]
    Mpie,
    #[value(name = "vox1")]
    #[serde(rename = "vox1")]
    Vox1,
}

impl Dataset {
    /// File lists used for training and validation, in that order
    pub fn file_lists(self) -> (&'static str, &'static str) {
        match self {
            Dataset::Vw300 => ("train_list_300vw_cross_id.txt", "train_list_300vw_cross_id.txt"),
            Dataset::Mpie => ("train_list_cross_id.txt", "train_list_cross_id.txt"),
            Dataset::Vox1 => ("train_list_vox1.txt", "val_list_vox1.txt"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dataset::Vw300 => "300vw",
            Dataset::Mpie => "mpie",
            Dataset::Vox1 => "vox1",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "300vw" => Ok(Dataset::Vw300),
            "mpie" => Ok(Dataset::Mpie),
            "vox1" => Ok(Dataset::Vox1),
            other => Err(ConfigError::UnknownDataset(other.to_string())),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "sample" => Ok(Mode::Sample),
            "eval" => Ok(Mode::Eval),
            "align" => Ok(Mode::Align),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arcface" => Ok(LossKind::Arcface),
            "perceptual" => Ok(LossKind::Perceptual),
            other => Err(ConfigError::UnknownLoss(other.to_string())),
        }
    }
}

/// Flat run configuration.
///
/// Built once per process with [`Config::parse_resolved`] (or
/// [`Config::try_parse_resolved_from`]), which also fills the derived
/// `train_img_dir` / `val_img_dir` fields from `dataset`.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "Landmark-conditioned face translation GAN", long_about = None)]
pub struct Config {
    // model arguments
    /// Image resolution
    #[arg(long = "img_size", default_value_t = 256)]
    pub img_size: usize,

    /// Number of domains
    #[arg(long = "num_domains", default_value_t = 2)]
    pub num_domains: usize,

    /// Latent vector dimension
    #[arg(long = "latent_dim", default_value_t = 16)]
    pub latent_dim: usize,

    /// Hidden dimension of mapping network
    #[arg(long = "hidden_dim", default_value_t = 512)]
    pub hidden_dim: usize,

    /// Style code dimension
    #[arg(long = "style_dim", default_value_t = 64)]
    pub style_dim: usize,

    /// Upper bound on convolution channel width
    #[arg(long = "max_conv_dim", default_value_t = 512)]
    pub max_conv_dim: usize,

    /// The type of similarity loss
    #[arg(long, value_enum, default_value_t = LossKind::Perceptual)]
    pub loss: LossKind,

    /// Training corpus; selects the file lists
    #[arg(long, value_enum, default_value_t = Dataset::Vw300)]
    pub dataset: Dataset,

    /// Use the landmark transformer
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub transformer: bool,

    // weight for objective functions
    /// Weight for domain classification loss
    #[arg(long = "lambda_cls", default_value_t = 1.0)]
    pub lambda_cls: f64,

    /// Weight for the discriminator adversarial loss
    #[arg(long = "lambda_d", default_value_t = 1.0)]
    pub lambda_d: f64,

    /// Weight for pose estimation loss
    #[arg(long = "lambda_pe", default_value_t = 1.0)]
    pub lambda_pe: f64,

    /// Weight for landmark loss
    #[arg(long = "lambda_lm", default_value_t = 1.0)]
    pub lambda_lm: f64,

    /// Weight for action-unit loss
    #[arg(long = "lambda_au_aus", default_value_t = 1.0)]
    pub lambda_au_aus: f64,

    /// Weight for action-unit head pose loss
    #[arg(long = "lambda_au_pose", default_value_t = 1.0)]
    pub lambda_au_pose: f64,

    /// Weight for perceptual loss
    #[arg(long = "lambda_per", default_value_t = 1.0)]
    pub lambda_per: f64,

    /// Weight for content loss
    #[arg(long = "lambda_con", default_value_t = 1.0)]
    pub lambda_con: f64,

    /// Weight for id loss
    #[arg(long = "lambda_id", default_value_t = 1.0)]
    pub lambda_id: f64,

    /// Weight for R1 regularization
    #[arg(long = "lambda_reg", default_value_t = 1.0)]
    pub lambda_reg: f64,

    /// Weight for cyclic consistency loss
    #[arg(long = "lambda_cyc", default_value_t = 1.0)]
    pub lambda_cyc: f64,

    /// Weight for style reconstruction loss
    #[arg(long = "lambda_sty", default_value_t = 1.0)]
    pub lambda_sty: f64,

    /// Weight for diversity sensitive loss
    #[arg(long = "lambda_ds", default_value_t = 1.0)]
    pub lambda_ds: f64,

    /// Number of iterations to optimize diversity sensitive loss
    #[arg(long = "ds_iter", default_value_t = 100_000)]
    pub ds_iter: usize,

    /// Weight for high-pass filtering
    #[arg(long = "w_hpf", default_value_t = 1.0)]
    pub w_hpf: f64,

    // training arguments
    /// Probability of using random-resized cropping
    #[arg(long = "randcrop_prob", default_value_t = 0.5)]
    pub randcrop_prob: f64,

    /// Number of total iterations
    #[arg(long = "total_iters", default_value_t = 100_000)]
    pub total_iters: usize,

    /// Iterations to resume training/testing
    #[arg(long = "resume_iter", default_value_t = 0)]
    pub resume_iter: usize,

    /// Batch size for training
    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    /// Batch size for validation
    #[arg(long = "val_batch_size", default_value_t = 32)]
    pub val_batch_size: usize,

    /// Learning rate for D, E and G
    #[arg(long, default_value_t = 2e-5)]
    pub lr: f64,

    /// Learning rate for C
    #[arg(long, default_value_t = 2e-5)]
    pub lr2: f64,

    /// Learning rate for F
    #[arg(long = "f_lr", default_value_t = 1e-6)]
    pub f_lr: f64,

    /// Decay rate for 1st moment of Adam
    #[arg(long, default_value_t = 0.99)]
    pub beta1: f64,

    /// Decay rate for 2nd moment of Adam
    #[arg(long, default_value_t = 0.999)]
    pub beta2: f64,

    /// Weight decay for optimizer
    #[arg(long = "weight_decay", default_value_t = 1e-4)]
    pub weight_decay: f64,

    /// Number of generated images per domain during sampling
    #[arg(long = "num_outs_per_domain", default_value_t = 10)]
    pub num_outs_per_domain: usize,

    // misc
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Number of workers used in the data loader
    #[arg(long = "num_workers", default_value_t = 0)]
    pub num_workers: usize,

    /// Seed for random number generator
    #[arg(long, default_value_t = 777)]
    pub seed: u64,

    /// Force CPU even when a CUDA device is present
    #[arg(long)]
    pub cpu: bool,

    /// Directory holding the dataset file lists
    #[arg(long = "list_dir", default_value = ".")]
    pub list_dir: PathBuf,

    // directory for training
    /// Directory for saving generated images
    #[arg(long = "sample_dir", default_value = "expr/samples")]
    pub sample_dir: PathBuf,

    /// Directory for saving network checkpoints
    #[arg(long = "checkpoint_dir", default_value = "./expr/checkpoints")]
    pub checkpoint_dir: PathBuf,

    // directory for calculating metrics
    /// Directory for saving metrics
    #[arg(long = "eval_dir", default_value = "expr/eval")]
    pub eval_dir: PathBuf,

    // directory for testing
    /// Directory for saving generated images and videos
    #[arg(long = "result_dir", default_value = "expr/results")]
    pub result_dir: PathBuf,

    /// Directory containing input source images
    #[arg(long = "src_dir", default_value = "test_list_300VW.txt")]
    pub src_dir: PathBuf,

    /// Directory containing input reference images
    #[arg(long = "ref_dir", default_value = "assets/representative/celeba_hq/ref")]
    pub ref_dir: PathBuf,

    /// Input directory when aligning faces
    #[arg(long = "inp_dir", default_value = "assets/representative/custom/female")]
    pub inp_dir: PathBuf,

    /// Output directory when aligning faces
    #[arg(long = "out_dir", default_value = "assets/representative/celeba_hq/src/female")]
    pub out_dir: PathBuf,

    // face alignment
    #[arg(long = "wing_path", default_value = "expr/checkpoints/wing.ckpt")]
    pub wing_path: PathBuf,

    #[arg(long = "lm_path", default_value = "expr/checkpoints/celeba_lm_mean.npz")]
    pub lm_path: PathBuf,

    // frozen backbones
    /// VGG16 feature weights (safetensors) for the perceptual loss
    #[arg(long = "vgg_path", default_value = "expr/checkpoints/vgg16.safetensors")]
    pub vgg_path: PathBuf,

    /// ArcFace IResNet-50 weights (safetensors) for the identity loss
    #[arg(long = "arcface_path", default_value = "expr/checkpoints/arcface_r50.safetensors")]
    pub arcface_path: PathBuf,

    // step size
    #[arg(long = "print_every", default_value_t = 10)]
    pub print_every: usize,

    #[arg(long = "sample_every", default_value_t = 100)]
    pub sample_every: usize,

    #[arg(long = "save_every", default_value_t = 1000)]
    pub save_every: usize,

    #[arg(long = "eval_every", default_value_t = 100_000)]
    pub eval_every: usize,

    #[arg(long = "decay_every", default_value_t = 10_000)]
    pub decay_every: usize,

    /// Where the resolved configuration is written
    #[arg(long = "config_out", default_value = "./expr/config.txt")]
    pub config_out: PathBuf,

    // derived from `dataset`
    #[arg(skip)]
    pub train_img_dir: String,

    #[arg(skip)]
    pub val_img_dir: String,
}

impl Config {
    /// Parse the process arguments and resolve derived fields.
    /// Exits with a usage error on invalid input.
    pub fn parse_resolved() -> Self {
        Self::parse().resolved()
    }

    /// Parse an explicit argument list (first item is the program name)
    pub fn try_parse_resolved_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::try_parse_from(args)?.resolved())
    }

    fn resolved(mut self) -> Self {
        let (train, val) = self.dataset.file_lists();
        self.train_img_dir = train.to_string();
        self.val_img_dir = val.to_string();
        self
    }

    /// Training file list, located under `list_dir`
    pub fn train_list(&self) -> PathBuf {
        self.list_dir.join(&self.train_img_dir)
    }

    /// Validation file list, located under `list_dir`
    pub fn val_list(&self) -> PathBuf {
        self.list_dir.join(&self.val_img_dir)
    }

    /// Render the configuration as one `field: value` line per field
    pub fn to_text(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the configuration dump, replacing any previous file
    pub fn dump(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_text()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Dump {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(path, text).map_err(|source| ConfigError::Dump {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuration written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec!["trainer"];
        args.extend_from_slice(extra);
        Config::try_parse_resolved_from(args).unwrap()
    }

    #[test]
    fn test_dataset_file_lists() {
        let cfg = parse(&["--mode", "train", "--dataset", "300vw"]);
        assert_eq!(cfg.train_img_dir, "train_list_300vw_cross_id.txt");
        assert_eq!(cfg.val_img_dir, "train_list_300vw_cross_id.txt");

        let cfg = parse(&["--mode", "train", "--dataset", "mpie"]);
        assert_eq!(cfg.train_img_dir, "train_list_cross_id.txt");
        assert_eq!(cfg.val_img_dir, "train_list_cross_id.txt");

        let cfg = parse(&["--mode", "train", "--dataset", "vox1"]);
        assert_eq!(cfg.train_img_dir, "train_list_vox1.txt");
        assert_eq!(cfg.val_img_dir, "val_list_vox1.txt");
    }

    #[test]
    fn test_default_dataset_is_resolved() {
        let cfg = parse(&["--mode", "sample"]);
        assert_eq!(cfg.dataset, Dataset::Vw300);
        assert!(!cfg.train_img_dir.is_empty());
        assert!(!cfg.val_img_dir.is_empty());
        assert_eq!(cfg.train_list(), PathBuf::from("./train_list_300vw_cross_id.txt"));
    }

    #[test]
    fn test_unknown_dataset_is_rejected() {
        let err = Config::try_parse_resolved_from(["trainer", "--mode", "train", "--dataset", "celeba"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);

        match "celeba".parse::<Dataset>() {
            Err(ConfigError::UnknownDataset(name)) => assert_eq!(name, "celeba"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_mode_is_required_and_closed() {
        let err = Config::try_parse_resolved_from(["trainer"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let err = Config::try_parse_resolved_from(["trainer", "--mode", "finetune"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
        assert!(err.exit_code() != 0);

        assert!(matches!("finetune".parse::<Mode>(), Err(ConfigError::UnknownMode(_))));
        assert_eq!("align".parse::<Mode>().unwrap(), Mode::Align);
    }

    #[test]
    fn test_bare_transformer_flag() {
        assert!(parse(&["--mode", "train", "--transformer"]).transformer);
        assert!(parse(&["--transformer", "--mode", "train"]).transformer);
        assert!(!parse(&["--mode", "train", "--transformer", "false"]).transformer);
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&["--mode", "eval"]);
        assert_eq!(cfg.img_size, 256);
        assert_eq!(cfg.num_domains, 2);
        assert_eq!(cfg.loss, LossKind::Perceptual);
        assert!(cfg.transformer);
        assert_eq!(cfg.seed, 777);
        assert_eq!(cfg.f_lr, 1e-6);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("./expr/checkpoints"));
        assert_eq!(cfg.config_out, PathBuf::from("./expr/config.txt"));
    }

    #[test]
    fn test_snake_case_flags() {
        let cfg = parse(&[
            "--mode", "train", "--img_size", "128", "--lambda_cyc", "2.5",
            "--loss", "arcface", "--transformer", "false",
        ]);
        assert_eq!(cfg.img_size, 128);
        assert_eq!(cfg.lambda_cyc, 2.5);
        assert_eq!(cfg.loss, LossKind::Arcface);
        assert!(!cfg.transformer);
    }

    #[test]
    fn test_dump_contains_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expr").join("config.txt");
        let cfg = parse(&["--mode", "train", "--lambda_cyc", "3"]);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale: true").unwrap();
        cfg.dump(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("stale"));
        assert!(text.contains("img_size: 256"));
        assert!(text.contains("mode: train"));
        assert!(text.contains("lambda_cyc: 3"));
        assert!(text.contains("dataset: 300vw"));
        assert!(text.contains("train_img_dir: train_list_300vw_cross_id.txt"));

        // every serialized field appears exactly once
        let value: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let fields = value.as_mapping().unwrap();
        assert_eq!(fields.len(), text.lines().count());
        for key in ["lambda_ds", "ds_iter", "w_hpf", "val_img_dir", "lm_path", "decay_every"] {
            assert!(fields.contains_key(key), "missing {}", key);
        }
    }
}
