//! Translation networks and the frozen backbones used by the losses.

pub mod arcface;
pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod mapping;
pub mod vgg;

pub use arcface::ArcFace;
pub use discriminator::{Discriminator, StyleEncoder};
pub use generator::Generator;
pub use mapping::MappingNetwork;
pub use vgg::Vgg16Features;

use crate::config::Config;
use crate::error::ConfigError;
use candle_core::{bail, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

/// Network hyper-parameters taken from the run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub img_size: usize,
    pub num_domains: usize,
    pub latent_dim: usize,
    pub hidden_dim: usize,
    pub style_dim: usize,
    pub max_conv_dim: usize,
    pub w_hpf: f64,
}

impl NetConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let net = Self {
            img_size: config.img_size,
            num_domains: config.num_domains,
            latent_dim: config.latent_dim,
            hidden_dim: config.hidden_dim,
            style_dim: config.style_dim,
            max_conv_dim: config.max_conv_dim,
            w_hpf: config.w_hpf,
        };
        net.validate()?;
        Ok(net)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.img_size < 32 || !self.img_size.is_power_of_two() {
            return Err(ConfigError::InvalidNetwork(format!(
                "img_size must be a power of two >= 32, got {}",
                self.img_size
            )));
        }
        for (name, value) in [
            ("num_domains", self.num_domains),
            ("latent_dim", self.latent_dim),
            ("hidden_dim", self.hidden_dim),
            ("style_dim", self.style_dim),
            ("max_conv_dim", self.max_conv_dim),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidNetwork(format!("{} must be positive", name)));
            }
        }
        if self.w_hpf < 0.0 {
            return Err(ConfigError::InvalidNetwork(format!("w_hpf must be >= 0, got {}", self.w_hpf)));
        }
        Ok(())
    }

    /// Channel width of the first convolution
    pub fn base_dim(&self) -> usize {
        (16384 / self.img_size).min(self.max_conv_dim)
    }

    /// Down/up-sampling stages of the generator before the high-pass extra
    pub fn num_stages(&self) -> usize {
        self.img_size.trailing_zeros() as usize - 4
    }
}

/// Pick row `y[b]` of `x[b]` for `x` shaped `[B, K]` or `[B, K, S]`
pub fn select_domain(x: &Tensor, y: &Tensor) -> candle_core::Result<Tensor> {
    match x.rank() {
        2 => {
            let b = x.dim(0)?;
            x.gather(&y.reshape((b, 1))?, 1)?.squeeze(1)
        }
        3 => {
            let (b, _, s) = x.dims3()?;
            let idx = y.reshape((b, 1, 1))?.broadcast_as((b, 1, s))?.contiguous()?;
            x.contiguous()?.gather(&idx, 1)?.squeeze(1)
        }
        rank => bail!("select_domain expects rank 2 or 3, got {}", rank),
    }
}

/// Parameter stores, one per network, keyed the way checkpoints name them
pub struct NetVars {
    pub generator: VarMap,
    pub mapping_network: VarMap,
    pub style_encoder: VarMap,
    pub discriminator: Option<VarMap>,
}

impl NetVars {
    pub fn named(&self) -> Vec<(&'static str, &VarMap)> {
        let mut out = vec![
            ("generator", &self.generator),
            ("mapping_network", &self.mapping_network),
            ("style_encoder", &self.style_encoder),
        ];
        if let Some(d) = &self.discriminator {
            out.push(("discriminator", d));
        }
        out
    }

    pub fn named_mut(&mut self) -> Vec<(&'static str, &mut VarMap)> {
        let mut out = vec![
            ("generator", &mut self.generator),
            ("mapping_network", &mut self.mapping_network),
            ("style_encoder", &mut self.style_encoder),
        ];
        if let Some(d) = self.discriminator.as_mut() {
            out.push(("discriminator", d));
        }
        out
    }

    /// The networks whose running average is kept
    pub fn averaged(&self) -> Vec<(&'static str, &VarMap)> {
        let mut named = self.named();
        named.retain(|(name, _)| *name != "discriminator");
        named
    }
}

pub struct Networks {
    pub generator: Generator,
    pub mapping_network: MappingNetwork,
    pub style_encoder: StyleEncoder,
    pub discriminator: Option<Discriminator>,
    pub vars: NetVars,
}

impl Networks {
    /// Freshly initialised networks; the discriminator is only built for training
    pub fn new(cfg: &NetConfig, device: &Device, with_discriminator: bool) -> candle_core::Result<Self> {
        let g_vars = VarMap::new();
        let f_vars = VarMap::new();
        let e_vars = VarMap::new();

        let generator = Generator::new(cfg, VarBuilder::from_varmap(&g_vars, DType::F32, device))?;
        let mapping_network = MappingNetwork::new(cfg, VarBuilder::from_varmap(&f_vars, DType::F32, device))?;
        let style_encoder = StyleEncoder::new(cfg, VarBuilder::from_varmap(&e_vars, DType::F32, device))?;

        let (discriminator, d_vars) = if with_discriminator {
            let d_vars = VarMap::new();
            let d = Discriminator::new(cfg, VarBuilder::from_varmap(&d_vars, DType::F32, device))?;
            (Some(d), Some(d_vars))
        } else {
            (None, None)
        };

        Ok(Self {
            generator,
            mapping_network,
            style_encoder,
            discriminator,
            vars: NetVars {
                generator: g_vars,
                mapping_network: f_vars,
                style_encoder: e_vars,
                discriminator: d_vars,
            },
        })
    }
}
