//! Landmark-conditioned StarGAN v2 style solver.
//!
//! Each iteration runs a discriminator and a generator update twice: once
//! with target styles drawn from the mapping network (latent-guided) and once
//! with styles encoded from reference images (reference-guided). References
//! are the source batch rolled by one sample, so target domains follow the
//! rolled labels.

use super::checkpoint::{CheckpointIo, TrainingState};
use super::ema::{EmaHelper, EMA_BETA};
use super::image_utils::{save_grid, save_image};
use super::losses::{
    adv_loss, content_loss, cosine_distance, l1, perceptual_loss, r1_penalty, Backbones, R1_PROBE_EPS,
};
use super::schedule::{decayed_lr, diversity_weight, is_due};
use super::Solver;
use crate::config::{Config, LossKind, Mode};
use crate::data::{get_test_loader, get_test_loader_vgg, Batch, Loaders};
use crate::models::{NetConfig, Networks};
use crate::runtime;
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Shape, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;

type LossLog = BTreeMap<String, f32>;

/// Where target style codes come from
enum Guide<'a> {
    /// Two latent codes, fed to the mapping network
    Latent(&'a Tensor, &'a Tensor),
    /// Two reference batches, fed to the style encoder
    Reference(&'a Batch, &'a Batch),
}

impl Guide<'_> {
    fn prefix(&self) -> &'static str {
        match self {
            Guide::Latent(..) => "latent",
            Guide::Reference(..) => "ref",
        }
    }
}

#[derive(Debug, Serialize)]
struct EvalMetrics {
    iteration: usize,
    num_images: usize,
    /// Mean L1 between sources and their cycle reconstructions
    recon_l1: f64,
    /// Mean L1 between reference styles and the styles re-encoded from outputs
    style_distance: f64,
}

struct Optimizers {
    generator: AdamW,
    mapping_network: AdamW,
    style_encoder: AdamW,
    discriminator: AdamW,
}

pub struct LandmarkSolver {
    config: Config,
    net_cfg: NetConfig,
    device: Device,
    nets: Networks,
    nets_ema: Networks,
    backbones: Backbones,
    ema: EmaHelper,
    checkpoints: CheckpointIo,
    rng: StdRng,
}

fn randn(rng: &mut StdRng, shape: Shape, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_scalar::<f32>()?)
}

/// Central crop covering `fraction` of each side
fn central_crop(x: &Tensor, fraction: f64) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let (ch, cw) = ((h as f64 * fraction) as usize, (w as f64 * fraction) as usize);
    x.narrow(2, (h - ch) / 2, ch)?.narrow(3, (w - cw) / 2, cw)
}

fn param_count(vars: &VarMap) -> usize {
    vars.all_vars().iter().map(|v| v.elem_count()).sum()
}

impl LandmarkSolver {
    pub fn new(config: &Config) -> Result<Self> {
        let net_cfg = NetConfig::from_config(config)?;
        let device = runtime::device();
        let training = config.mode == Mode::Train;

        let nets = Networks::new(&net_cfg, &device, training).context("Failed to build networks")?;
        let nets_ema = Networks::new(&net_cfg, &device, false).context("Failed to build EMA networks")?;
        for (name, vars) in nets.vars.named() {
            info!("Number of parameters of {}: {}", name, param_count(vars));
        }

        let ema = EmaHelper::new(EMA_BETA);
        for ((_, ema_vars), (_, live)) in nets_ema.vars.averaged().into_iter().zip(nets.vars.averaged()) {
            ema.init(ema_vars, live)?;
        }

        let backbones = if training {
            Backbones::load(config.loss, &config.vgg_path, &config.arcface_path, &device)
        } else {
            Backbones::default()
        };

        Ok(Self {
            config: config.clone(),
            net_cfg,
            device,
            nets,
            nets_ema,
            backbones,
            ema,
            checkpoints: CheckpointIo::new(&config.checkpoint_dir),
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    fn optimizers(&self, lr: f64, f_lr: f64) -> Result<Optimizers> {
        let params = |lr: f64| ParamsAdamW {
            lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: 1e-8,
            weight_decay: self.config.weight_decay,
        };
        let vars = &self.nets.vars;
        let d_vars = vars
            .discriminator
            .as_ref()
            .ok_or_else(|| anyhow!("Training needs a discriminator"))?;
        Ok(Optimizers {
            generator: AdamW::new(vars.generator.all_vars(), params(lr))?,
            mapping_network: AdamW::new(vars.mapping_network.all_vars(), params(f_lr))?,
            style_encoder: AdamW::new(vars.style_encoder.all_vars(), params(lr))?,
            discriminator: AdamW::new(d_vars.all_vars(), params(lr))?,
        })
    }

    fn latent(&mut self, batch: usize) -> Result<Tensor> {
        randn(&mut self.rng, Shape::from((batch, self.net_cfg.latent_dim)), &self.device)
    }

    fn save_checkpoint(&self, iter: usize, state: &TrainingState) -> Result<()> {
        self.checkpoints.save(iter, &self.nets.vars.named(), false)?;
        self.checkpoints.save(iter, &self.nets_ema.vars.averaged(), true)?;
        self.checkpoints.save_state(state)
    }

    fn load_checkpoint(&mut self, iter: usize) -> Result<()> {
        self.checkpoints.load(iter, &mut self.nets.vars.named_mut(), false)?;
        self.load_ema(iter)
    }

    fn load_ema(&mut self, iter: usize) -> Result<()> {
        let mut named = self.nets_ema.vars.named_mut();
        self.checkpoints.load(iter, &mut named, true)
    }

    fn target_style(nets: &Networks, guide: &Guide, y_trg: &Tensor, second: bool) -> Result<Tensor> {
        Ok(match guide {
            Guide::Latent(z1, z2) => nets.mapping_network.forward(if second { z2 } else { z1 }, y_trg)?,
            Guide::Reference(r1, r2) => {
                let reference = if second { r2 } else { r1 };
                nets.style_encoder.forward(&reference.images, y_trg)?
            }
        })
    }

    fn discriminator_loss(
        &self,
        batch: &Batch,
        y_trg: &Tensor,
        guide: &Guide,
        probe: &Tensor,
        log: &mut LossLog,
    ) -> Result<Tensor> {
        let cfg = &self.config;
        let nets = &self.nets;
        let d = nets
            .discriminator
            .as_ref()
            .ok_or_else(|| anyhow!("Training needs a discriminator"))?;
        let (x_real, heat, y_org) = (&batch.images, &batch.landmarks, &batch.labels);

        let out_real = d.forward(x_real, heat, y_org)?;
        let loss_real = adv_loss(&out_real, 1.0)?;
        let loss_reg = r1_penalty(|x| d.forward(x, heat, y_org), x_real, &out_real, probe, R1_PROBE_EPS)?;

        let s_trg = Self::target_style(nets, guide, y_trg, false)?.detach();
        let x_fake = nets.generator.forward(x_real, heat, &s_trg)?.detach();
        let loss_fake = adv_loss(&d.forward(&x_fake, heat, y_trg)?, 0.0)?;

        let loss = (((&loss_real + &loss_fake)? * cfg.lambda_d)? + (&loss_reg * cfg.lambda_reg)?)?;

        let prefix = format!("D/{}", guide.prefix());
        log.insert(format!("{}_real", prefix), scalar(&loss_real)?);
        log.insert(format!("{}_fake", prefix), scalar(&loss_fake)?);
        log.insert(format!("{}_reg", prefix), scalar(&loss_reg)?);
        Ok(loss)
    }

    fn generator_loss(
        &self,
        batch: &Batch,
        y_trg: &Tensor,
        guide: &Guide,
        lambda_ds: f64,
        log: &mut LossLog,
    ) -> Result<Tensor> {
        let cfg = &self.config;
        let nets = &self.nets;
        let d = nets
            .discriminator
            .as_ref()
            .ok_or_else(|| anyhow!("Training needs a discriminator"))?;
        let (x_real, heat, y_org) = (&batch.images, &batch.landmarks, &batch.labels);
        let prefix = format!("G/{}", guide.prefix());

        // adversarial
        let s_trg = Self::target_style(nets, guide, y_trg, false)?;
        let x_fake = nets.generator.forward(x_real, heat, &s_trg)?;
        let loss_adv = adv_loss(&d.forward(&x_fake, heat, y_trg)?, 1.0)?;

        // style reconstruction
        let s_pred = nets.style_encoder.forward(&x_fake, y_trg)?;
        let loss_sty = l1(&s_pred, &s_trg)?;

        // diversity sensitive
        let s_trg2 = Self::target_style(nets, guide, y_trg, true)?;
        let x_fake2 = nets.generator.forward(x_real, heat, &s_trg2)?.detach();
        let loss_ds = l1(&x_fake, &x_fake2)?;

        // cycle consistency
        let s_org = nets.style_encoder.forward(x_real, y_org)?;
        let x_rec = nets.generator.forward(&x_fake, heat, &s_org)?;
        let loss_cyc = l1(&x_rec, x_real)?;

        let mut loss = (((&loss_adv + (&loss_sty * cfg.lambda_sty)?)? - (&loss_ds * lambda_ds)?)?
            + (&loss_cyc * cfg.lambda_cyc)?)?;

        log.insert(format!("{}_adv", prefix), scalar(&loss_adv)?);
        log.insert(format!("{}_sty", prefix), scalar(&loss_sty)?);
        log.insert(format!("{}_ds", prefix), scalar(&loss_ds)?);
        log.insert(format!("{}_cyc", prefix), scalar(&loss_cyc)?);

        if let Guide::Reference(reference, _) = guide {
            if let Some(vgg) = &self.backbones.vgg {
                let feats_src = vgg.forward(x_real)?;
                let loss_per = perceptual_loss(&vgg.forward(&x_rec)?, &feats_src)?;
                let loss_con = content_loss(&vgg.forward(&x_fake)?, &feats_src)?;
                loss = ((loss + (&loss_per * cfg.lambda_per)?)? + (&loss_con * cfg.lambda_con)?)?;
                log.insert(format!("{}_per", prefix), scalar(&loss_per)?);
                log.insert(format!("{}_con", prefix), scalar(&loss_con)?);
            }
            if let (Some(arcface), Some(id_ref)) = (&self.backbones.arcface, &reference.id_images) {
                let emb_fake = arcface.forward(&central_crop(&x_fake, 0.8)?)?;
                let emb_ref = arcface.forward(id_ref)?.detach();
                let loss_id = cosine_distance(&emb_fake, &emb_ref)?;
                loss = (loss + (&loss_id * cfg.lambda_id)?)?;
                log.insert(format!("{}_id", prefix), scalar(&loss_id)?);
            }
        }

        Ok(loss)
    }

    /// Reference-guided translation with the EMA networks
    fn translate_reference(&self, src: &Batch, reference: &Batch) -> Result<Tensor> {
        let nets = &self.nets_ema;
        let s_ref = nets.style_encoder.forward(&reference.images, &reference.labels)?;
        Ok(nets.generator.forward(&src.images, &src.landmarks, &s_ref)?)
    }

    /// Latent-guided translation of `src` into `domain` with the EMA networks
    fn translate_latent(&self, src: &Batch, z: &Tensor, domain: u32) -> Result<Tensor> {
        let nets = &self.nets_ema;
        let y = Tensor::full(domain, src.len(), &self.device)?;
        let s = nets.mapping_network.forward(z, &y)?;
        Ok(nets.generator.forward(&src.images, &src.landmarks, &s)?)
    }

    /// Sample grids written during training
    fn debug_image(&mut self, batch: &Batch, iter: usize) -> Result<()> {
        let dir = self.config.sample_dir.clone();
        let reference = batch.rolled(1)?;
        let fake = self.translate_reference(batch, &reference)?;
        save_grid(
            &[batch.images.clone(), reference.images.clone(), fake],
            dir.join(format!("{:06}_reference.jpg", iter)),
        )?;

        let z = self.latent(batch.len())?;
        let mut rows = vec![batch.images.clone()];
        for domain in 0..self.net_cfg.num_domains as u32 {
            rows.push(self.translate_latent(batch, &z, domain)?);
        }
        save_grid(&rows, dir.join(format!("{:06}_latent.jpg", iter)))?;
        info!("Saved sample grids for iteration {} to {:?}", iter, dir);
        Ok(())
    }

    /// Translate the validation list with the in-memory EMA networks and
    /// write images plus a metrics file under `eval_dir`
    fn evaluate_at(&self, iter: usize) -> Result<()> {
        let cfg = &self.config;
        let (root, size, batch) = (cfg.val_list(), cfg.img_size, cfg.val_batch_size);
        let mut loader = match cfg.loss {
            LossKind::Arcface => get_test_loader(root, cfg.dataset, size, batch, false, cfg.num_workers)?,
            LossKind::Perceptual => get_test_loader_vgg(root, cfg.dataset, size, batch, false, cfg.num_workers)?,
        };

        let out_dir = cfg.eval_dir.join(format!("{:06}", iter));
        fs::create_dir_all(&out_dir).with_context(|| format!("Failed to create {:?}", out_dir))?;

        let nets = &self.nets_ema;
        let (mut recon_sum, mut style_sum, mut count) = (0f64, 0f64, 0usize);
        for batch in loader.iter_epoch() {
            let batch = batch?;
            let reference = batch.rolled(1)?;

            let s_ref = nets.style_encoder.forward(&reference.images, &reference.labels)?;
            let fake = nets.generator.forward(&batch.images, &batch.landmarks, &s_ref)?;
            let s_org = nets.style_encoder.forward(&batch.images, &batch.labels)?;
            let rec = nets.generator.forward(&fake, &batch.landmarks, &s_org)?;
            let s_back = nets.style_encoder.forward(&fake, &reference.labels)?;

            let n = batch.len();
            recon_sum += scalar(&l1(&rec, &batch.images)?)? as f64 * n as f64;
            style_sum += scalar(&l1(&s_back, &s_ref)?)? as f64 * n as f64;
            count += n;

            for (i, (src_path, ref_path)) in batch.paths.iter().zip(&reference.paths).enumerate() {
                let stem = |p: &std::path::Path| {
                    p.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
                };
                let name = format!("{}_to_{}.png", stem(src_path), stem(ref_path));
                save_image(&fake.get(i)?, out_dir.join(name))?;
            }
        }

        let metrics = EvalMetrics {
            iteration: iter,
            num_images: count,
            recon_l1: if count > 0 { recon_sum / count as f64 } else { 0.0 },
            style_distance: if count > 0 { style_sum / count as f64 } else { 0.0 },
        };
        let path = cfg.eval_dir.join(format!("metrics_{:06}.json", iter));
        fs::write(&path, serde_json::to_string_pretty(&metrics)?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        info!("Evaluation at iteration {}: {:?}", iter, metrics);
        Ok(())
    }
}

#[cfg(feature = "progress-bar")]
fn progress_bar(total: usize, start: usize) -> indicatif::ProgressBar {
    use indicatif::{ProgressBar, ProgressStyle};
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb.set_position(start as u64);
    pb
}

impl Solver for LandmarkSolver {
    fn train(&mut self, loaders: &mut Loaders) -> Result<()> {
        let cfg = self.config.clone();
        let start_iter = cfg.resume_iter;
        if start_iter > 0 {
            self.load_checkpoint(start_iter)?;
            if let Some(state) = self.checkpoints.load_state(start_iter)? {
                info!("Resuming from iteration {} (lr {:.2e})", state.iteration, state.lr);
            }
        }

        let mut opt = self.optimizers(cfg.lr, cfg.f_lr)?;

        // fixed validation batch for the sample grids
        let fixed = match loaders.val.as_mut() {
            Some(val) => Some(val.next_batch()?),
            None => {
                warn!("No validation loader: sample grids disabled");
                None
            }
        };

        info!("\n=== Starting Training ===");
        info!("Iterations: {} -> {}", start_iter, cfg.total_iters);
        info!("Batch size: {}", loaders.src.batch_size());
        info!("Learning rate: {} (mapping network {})", cfg.lr, cfg.f_lr);

        #[cfg(feature = "progress-bar")]
        let pb = progress_bar(cfg.total_iters, start_iter);

        let started = Instant::now();
        let mut log = LossLog::new();
        for i in start_iter..cfg.total_iters {
            let iter = i + 1;
            let batch = loaders.src.next_batch()?;
            let ref1 = batch.rolled(1)?;
            let ref2 = batch.rolled(2)?;
            let y_trg = ref1.labels.clone();
            let z_trg = self.latent(batch.len())?;
            let z_trg2 = self.latent(batch.len())?;
            let probe = randn(&mut self.rng, batch.images.shape().clone(), &self.device)?;

            let lr = decayed_lr(cfg.lr, i, cfg.decay_every);
            let f_lr = decayed_lr(cfg.f_lr, i, cfg.decay_every);
            opt.generator.set_learning_rate(lr);
            opt.style_encoder.set_learning_rate(lr);
            opt.discriminator.set_learning_rate(lr);
            opt.mapping_network.set_learning_rate(f_lr);
            let lambda_ds = diversity_weight(cfg.lambda_ds, i, cfg.ds_iter);

            log.clear();
            let latent = Guide::Latent(&z_trg, &z_trg2);
            let reference = Guide::Reference(&ref1, &ref2);

            // discriminator
            let d_loss = self.discriminator_loss(&batch, &y_trg, &latent, &probe, &mut log)?;
            opt.discriminator.backward_step(&d_loss)?;
            let d_loss = self.discriminator_loss(&batch, &y_trg, &reference, &probe, &mut log)?;
            opt.discriminator.backward_step(&d_loss)?;

            // generator, mapping network and style encoder
            let g_loss = self.generator_loss(&batch, &y_trg, &latent, lambda_ds, &mut log)?;
            let grads = g_loss.backward()?;
            opt.generator.step(&grads)?;
            opt.mapping_network.step(&grads)?;
            opt.style_encoder.step(&grads)?;
            let g_loss = self.generator_loss(&batch, &y_trg, &reference, lambda_ds, &mut log)?;
            opt.generator.backward_step(&g_loss)?;

            for ((_, ema_vars), (_, live)) in self.nets_ema.vars.averaged().into_iter().zip(self.nets.vars.averaged()) {
                self.ema.update(ema_vars, live)?;
            }
            log.insert("G/lambda_ds".to_string(), lambda_ds as f32);

            #[cfg(feature = "progress-bar")]
            pb.set_position(iter as u64);

            if is_due(iter, cfg.print_every) {
                let elapsed = started.elapsed().as_secs();
                let items: Vec<String> = log.iter().map(|(k, v)| format!("{}: [{:.4}]", k, v)).collect();
                info!(
                    "Elapsed time [{:02}:{:02}:{:02}], Iteration [{}/{}], {}",
                    elapsed / 3600,
                    elapsed / 60 % 60,
                    elapsed % 60,
                    iter,
                    cfg.total_iters,
                    items.join(" ")
                );
            }

            if is_due(iter, cfg.sample_every) {
                if let Some(fixed) = &fixed {
                    self.debug_image(fixed, iter)?;
                }
            }

            if is_due(iter, cfg.save_every) {
                let state = TrainingState {
                    iteration: iter,
                    lr,
                    f_lr,
                    lambda_ds,
                    losses: log.clone(),
                };
                self.save_checkpoint(iter, &state)?;
            }

            if is_due(iter, cfg.eval_every) {
                self.evaluate_at(iter)?;
            }
        }

        #[cfg(feature = "progress-bar")]
        pb.finish_with_message("done");
        info!("Training finished after {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    }

    fn sample(&mut self, loaders: &mut Loaders) -> Result<()> {
        let iter = self.config.resume_iter;
        self.load_ema(iter)?;

        let result_dir = self.config.result_dir.clone();
        fs::create_dir_all(&result_dir).with_context(|| format!("Failed to create {:?}", result_dir))?;
        let num_outs = self.config.num_outs_per_domain;

        let mut written = 0;
        for (b, batch) in loaders.src.iter_epoch().enumerate() {
            let batch = batch?;
            let reference = batch.rolled(1)?;
            let fake = self.translate_reference(&batch, &reference)?;
            save_grid(
                &[batch.images.clone(), reference.images.clone(), fake],
                result_dir.join(format!("reference_{:04}.jpg", b)),
            )?;
            written += 1;

            for domain in 0..self.net_cfg.num_domains as u32 {
                let mut rows = vec![batch.images.clone()];
                for _ in 0..num_outs {
                    let z = self.latent(batch.len())?;
                    rows.push(self.translate_latent(&batch, &z, domain)?);
                }
                save_grid(&rows, result_dir.join(format!("latent_{:04}_domain{}.jpg", b, domain)))?;
                written += 1;
            }
        }
        info!("Wrote {} sample grids to {:?}", written, result_dir);
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        let iter = self.config.resume_iter;
        self.load_ema(iter)?;
        self.evaluate_at(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::build_loaders;
    use crate::data::loader::fixtures;
    use crate::models::{ArcFace, Vgg16Features};
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use std::path::Path;

    fn config_for(dir: &Path, extra: &[&str]) -> Config {
        let root = dir.to_string_lossy().to_string();
        let sub = |name: &str| dir.join(name).to_string_lossy().to_string();
        let (samples, ckpt, eval, results) = (sub("samples"), sub("ckpt"), sub("eval"), sub("results"));
        let mut args = vec![
            "trainer", "--dataset", "300vw", "--img_size", "32", "--max_conv_dim", "16",
            "--latent_dim", "4", "--hidden_dim", "8", "--style_dim", "8",
            "--batch_size", "2", "--val_batch_size", "2", "--list_dir", root.as_str(),
            "--sample_dir", samples.as_str(), "--checkpoint_dir", ckpt.as_str(),
            "--eval_dir", eval.as_str(), "--result_dir", results.as_str(),
            "--num_outs_per_domain", "2", "--print_every", "1", "--seed", "3",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_resolved_from(args).unwrap()
    }

    #[test]
    fn test_central_crop() -> Result<()> {
        let x = Tensor::zeros((1, 3, 40, 40), candle_core::DType::F32, &Device::Cpu)?;
        assert_eq!(central_crop(&x, 0.8)?.dims(), &[1, 3, 32, 32]);
        Ok(())
    }

    #[test]
    fn test_bad_image_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_for(dir.path(), &["--mode", "eval", "--img_size", "48"]);
        assert!(LandmarkSolver::new(&cfg).is_err());
    }

    #[test]
    fn test_train_then_sample_and_evaluate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fixtures::write_dataset(dir.path(), "train_list_300vw_cross_id.txt", 4);

        let cfg = config_for(
            dir.path(),
            &[
                "--mode", "train", "--total_iters", "2", "--sample_every", "1", "--save_every", "2",
                "--eval_every", "2", "--decay_every", "1", "--ds_iter", "2",
            ],
        );
        let mut loaders = build_loaders(&cfg)?.expect("train builds loaders");
        let mut solver = LandmarkSolver::new(&cfg)?;
        // no backbone weights in the temp dir
        assert!(solver.backbones.vgg.is_none());
        solver.train(&mut loaders)?;

        let ckpt = dir.path().join("ckpt/000002");
        for name in ["generator", "mapping_network", "style_encoder", "discriminator"] {
            assert!(ckpt.join(format!("{}.safetensors", name)).exists(), "{}", name);
        }
        for name in ["generator_ema", "mapping_network_ema", "style_encoder_ema"] {
            assert!(ckpt.join(format!("{}.safetensors", name)).exists(), "{}", name);
        }
        assert!(!ckpt.join("discriminator_ema.safetensors").exists());

        let state = CheckpointIo::new(dir.path().join("ckpt")).load_state(2)?.expect("state saved");
        assert_eq!(state.iteration, 2);
        assert_eq!(state.lr, cfg.lr * 0.5);
        assert_eq!(state.lambda_ds, 0.5);
        assert!(state.losses.contains_key("D/latent_reg"));
        assert!(state.losses.contains_key("G/ref_cyc"));

        assert!(dir.path().join("samples/000001_latent.jpg").exists());
        assert!(dir.path().join("samples/000002_reference.jpg").exists());
        assert!(dir.path().join("eval/metrics_000002.json").exists());
        assert!(dir.path().join("eval/000002/face_000_to_face_001.png").exists());

        // sample from the saved EMA weights
        let cfg = config_for(dir.path(), &["--mode", "sample", "--resume_iter", "2"]);
        let mut loaders = build_loaders(&cfg)?.expect("sample builds loaders");
        let mut solver = LandmarkSolver::new(&cfg)?;
        solver.sample(&mut loaders)?;
        assert!(dir.path().join("results/reference_0000.jpg").exists());
        assert!(dir.path().join("results/latent_0001_domain1.jpg").exists());

        // evaluate reads the validation list on its own
        let cfg = config_for(dir.path(), &["--mode", "eval", "--resume_iter", "2", "--loss", "arcface"]);
        let mut solver = LandmarkSolver::new(&cfg)?;
        fs::remove_file(dir.path().join("eval/metrics_000002.json"))?;
        solver.evaluate()?;
        let text = fs::read_to_string(dir.path().join("eval/metrics_000002.json"))?;
        let metrics: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(metrics["num_images"], 4);
        assert!(metrics["recon_l1"].as_f64().unwrap() >= 0.0);
        Ok(())
    }

    fn random_vgg() -> Result<Vgg16Features> {
        let varmap = VarMap::new();
        Ok(Vgg16Features::new(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))?)
    }

    fn random_arcface() -> Result<ArcFace> {
        let varmap = VarMap::new();
        Ok(ArcFace::new(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))?)
    }

    #[test]
    fn test_identity_loss_backpropagates_to_generator() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fixtures::write_dataset(dir.path(), "train_list_300vw_cross_id.txt", 4);
        let cfg = config_for(dir.path(), &["--mode", "train", "--loss", "arcface"]);
        let mut loaders = build_loaders(&cfg)?.expect("train builds loaders");
        let mut solver = LandmarkSolver::new(&cfg)?;
        solver.backbones.arcface = Some(random_arcface()?);

        let batch = loaders.src.next_batch()?;
        let (ref1, ref2) = (batch.rolled(1)?, batch.rolled(2)?);
        assert!(ref1.id_images.is_some());
        let mut log = LossLog::new();
        let loss = solver.generator_loss(&batch, &ref1.labels, &Guide::Reference(&ref1, &ref2), 1.0, &mut log)?;
        assert!(log.contains_key("G/ref_id"));

        // 25x25 crop resized to 112 on the way into the backbone
        let grads = loss.backward()?;
        let (_, generator) = solver.nets.vars.named()[0];
        let reached = generator.all_vars().iter().any(|v| grads.get(v.as_tensor()).is_some());
        assert!(reached);
        Ok(())
    }

    #[test]
    fn test_backbone_losses_are_trained_and_recorded() -> Result<()> {
        for (loss, keys) in [("perceptual", &["G/ref_per", "G/ref_con"][..]), ("arcface", &["G/ref_id"][..])] {
            let dir = tempfile::tempdir()?;
            fixtures::write_dataset(dir.path(), "train_list_300vw_cross_id.txt", 4);
            let cfg = config_for(
                dir.path(),
                &["--mode", "train", "--loss", loss, "--total_iters", "1", "--save_every", "1",
                  "--sample_every", "5", "--eval_every", "5"],
            );
            let mut loaders = build_loaders(&cfg)?.expect("train builds loaders");
            let mut solver = LandmarkSolver::new(&cfg)?;
            match cfg.loss {
                LossKind::Perceptual => solver.backbones.vgg = Some(random_vgg()?),
                LossKind::Arcface => solver.backbones.arcface = Some(random_arcface()?),
            }
            solver.train(&mut loaders)?;

            let state = CheckpointIo::new(dir.path().join("ckpt")).load_state(1)?.expect("state saved");
            for key in keys {
                assert!(state.losses.contains_key(*key), "{} missing for {}", key, loss);
            }
            // latent-guided steps never use the backbones
            assert!(!state.losses.contains_key("G/latent_per"));
            assert!(!state.losses.contains_key("G/latent_id"));
        }
        Ok(())
    }

    #[test]
    fn test_sample_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_dataset(dir.path(), "train_list_300vw_cross_id.txt", 2);
        let cfg = config_for(dir.path(), &["--mode", "sample", "--resume_iter", "7"]);
        let mut loaders = build_loaders(&cfg).unwrap().unwrap();
        let mut solver = LandmarkSolver::new(&cfg).unwrap();
        assert!(solver.sample(&mut loaders).is_err());
    }
}
