//! # Image to image sampling
//!
//! The source image is encoded to the latent space, noised up to an
//! intermediate timestep picked from `strength`, then denoised with the UNet
//! conditioned on the prompt and decoded back to pixels.
//!
//! Each sub-model is only moved to the accelerator for the phase that needs
//! it, see [`crate::residency`].
use std::path::PathBuf;
use std::time::Instant;

use diffusers::schedulers::ddim;
use diffusers::transformers::clip;
use rand::Rng;
use tch::{nn::Module, Device, Kind, Tensor};
use tracing::{debug, info};

use super::stable_diffusion::{Autoencoder, ModelSpec, TextEncoder, Unet};
use crate::checkpoint::{self, KeyRemapper};
use crate::config::{Img2ImgConfig, Precision, WeightSource};
use crate::image_io;
use crate::output::OutputLayout;
use crate::prompt;
use crate::residency::{Resident, ResidencyManager, ResidentSet};
use crate::schedule::StrengthSchedule;
use crate::submodel::{SubModelKind, Weights};
use crate::utils::DeviceSetup;

// Scaling applied to the autoencoder latents during training.
const LATENT_SCALE: f64 = 0.18215;
const MAX_RANDOM_SEED: u64 = 1_000_000;

/// The kind weights are stored in for a sub-model computing on `device`.
pub fn storage_kind(precision: Precision, device: Device) -> Kind {
    match (precision, device) {
        (Precision::Autocast, Device::Cpu) => Kind::Float,
        (Precision::Autocast, _) => Kind::Half,
        (Precision::Full, _) => Kind::Float,
    }
}

/// The three sub-models of a checkpoint.
#[derive(Debug)]
pub struct SubModels {
    pub unet: Unet,
    pub clip: TextEncoder,
    pub vae: Autoencoder,
}

impl ResidentSet for SubModels {
    fn resident_mut(&mut self, kind: SubModelKind) -> &mut dyn Resident {
        match kind {
            SubModelKind::Unet => &mut self.unet,
            SubModelKind::TextEncoder => &mut self.clip,
            SubModelKind::Autoencoder => &mut self.vae,
        }
    }
}

impl SubModels {
    /// Builds the sub-models in host memory.
    pub fn load(
        spec: &ModelSpec,
        weights: &WeightSource,
        devices: &DeviceSetup,
        precision: Precision,
    ) -> anyhow::Result<Self> {
        let target = |kind| {
            let device = devices.get(kind);
            (device, storage_kind(precision, device))
        };
        let (unet_device, unet_kind) = target(SubModelKind::Unet);
        let (clip_device, clip_kind) = target(SubModelKind::TextEncoder);
        let (vae_device, vae_kind) = target(SubModelKind::Autoencoder);
        match weights {
            WeightSource::Separate { unet, clip, vae } => {
                info!("building the clip transformer");
                let clip =
                    spec.build_clip_transformer(Weights::File(clip), clip_device, clip_kind)?;
                info!("building the autoencoder");
                let vae = spec.build_vae(Weights::File(vae), vae_device, vae_kind)?;
                info!("building the unet");
                let unet = spec.build_unet(Weights::File(unet), unet_device, unet_kind)?;
                Ok(Self { unet, clip, vae })
            }
            WeightSource::Combined { checkpoint, unet_prefix, clip_prefix, vae_prefix } => {
                info!("loading model from {checkpoint:?}");
                let tensors = checkpoint::read_tensors(checkpoint)?;
                let remapper = KeyRemapper::new(unet_prefix, clip_prefix, vae_prefix);
                let mut parts = remapper.partition(tensors);
                for kind in SubModelKind::ALL {
                    debug!("{kind}: {} tensors in the checkpoint", parts.len(kind));
                }
                let clip = spec.build_clip_transformer(
                    Weights::Tensors(parts.take(SubModelKind::TextEncoder)),
                    clip_device,
                    clip_kind,
                )?;
                let vae = spec.build_vae(
                    Weights::Tensors(parts.take(SubModelKind::Autoencoder)),
                    vae_device,
                    vae_kind,
                )?;
                let unet = spec.build_unet(
                    Weights::Tensors(parts.take(SubModelKind::Unet)),
                    unet_device,
                    unet_kind,
                )?;
                Ok(Self { unet, clip, vae })
            }
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub seed: u64,
    pub samples: Vec<PathBuf>,
    pub sample_dir: PathBuf,
    pub grid: Option<PathBuf>,
}

pub struct Img2ImgPipeline {
    config: Img2ImgConfig,
    spec: ModelSpec,
    tokenizer: clip::Tokenizer,
    models: SubModels,
    residency: ResidencyManager,
}

impl Img2ImgPipeline {
    pub fn new(config: Img2ImgConfig) -> anyhow::Result<Self> {
        config.validate()?;
        tch::maybe_init_cuda();
        info!("cuda available: {}", tch::Cuda::is_available());
        info!("cudnn available: {}", tch::Cuda::cudnn_is_available());
        let devices = DeviceSetup::new(config.cpu.clone());
        let precision = match (config.precision, devices.accelerator()) {
            (Precision::Autocast, Device::Cpu) => {
                tracing::warn!("no accelerator available, running in full precision");
                Precision::Full
            }
            (precision, _) => precision,
        };
        let spec = ModelSpec::for_version(
            config.sd_version,
            config.sliced_attention_size,
            config.ddim_eta,
        );
        let tokenizer = clip::Tokenizer::create(&config.vocab_file, &spec.clip)?;
        let models = SubModels::load(&spec, &config.weights, &devices, precision)?;
        let residency =
            ResidencyManager::new(devices.accelerator(), config.vram_budget, config.residency);
        Ok(Self { config, spec, tokenizer, models, residency })
    }

    /// Samples, decodes and saves the images. Sub-models are back in host
    /// memory once this returns, successfully or not.
    pub fn run(&mut self) -> anyhow::Result<RunSummary> {
        let result = self.sample_and_save();
        self.residency.finish(&mut self.models, result)
    }

    fn sample_and_save(&mut self) -> anyhow::Result<RunSummary> {
        let start = Instant::now();
        let prompt = prompt::resolve(&self.config.prompt)?;
        info!("prompt: {prompt}");
        let seed = match self.config.seed {
            Some(seed) => seed,
            None => rand::thread_rng().gen_range(0..MAX_RANDOM_SEED),
        };
        info!("init_seed = {seed}");
        let mut layout = OutputLayout::prepare(&self.config.outdir, &prompt)?;
        let init_image =
            image_io::load_init_image(&self.config.init_image, self.config.target_size())?;

        let _no_grad_guard = tch::no_grad_guard();
        tch::manual_seed(seed as i64);
        let init_latent = self.encode(&init_image)?;
        let conditioning = self.condition(&prompt)?;

        let n_steps = self.config.ddim_steps;
        let scheduler = self.spec.build_scheduler(n_steps);
        let schedule = StrengthSchedule::new(self.config.strength, n_steps);
        info!("target t_enc is {} steps", schedule.t_enc());

        self.residency.acquire(&mut self.models, SubModelKind::Unet)?;
        let latents = sample_batch(seed, self.config.batch_size(), |_| {
            self.denoise(&init_latent, &conditioning, &scheduler, &schedule)
        });
        self.residency.release(&mut self.models, SubModelKind::Unet)?;

        info!("saving images");
        self.residency.acquire(&mut self.models, SubModelKind::Autoencoder)?;
        let images = latents
            .iter()
            .map(|latent| self.decode(latent))
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.residency.release(&mut self.models, SubModelKind::Autoencoder)?;

        let grid_columns = (!self.config.skip_grid).then(|| self.config.grid_columns());
        let (samples, grid) =
            save_outputs(&mut layout, seed, &images, self.config.skip_save, grid_columns)?;

        let minutes = start.elapsed().as_secs_f64() / 60.;
        let sample_dir = layout.sample_dir().to_path_buf();
        info!("samples ready in {minutes:.2} minutes in {sample_dir:?}");
        Ok(RunSummary { seed, samples, sample_dir, grid })
    }

    /// Samples the scaled latent of the source image, on the UNet device.
    fn encode(&mut self, image: &Tensor) -> anyhow::Result<Tensor> {
        self.residency.acquire(&mut self.models, SubModelKind::Autoencoder)?;
        let vae = &self.models.vae;
        let image = vae.input(image);
        let latent = vae.forward_with(|m| m.encode(&image).sample()) * LATENT_SCALE;
        let latent = latent.to_device(self.models.unet.target_device());
        debug!("init latent {:?}", latent.size());
        self.residency.release(&mut self.models, SubModelKind::Autoencoder)?;
        Ok(latent)
    }

    fn condition(&mut self, prompt: &str) -> anyhow::Result<Conditioning> {
        self.residency.acquire(&mut self.models, SubModelKind::TextEncoder)?;
        let (tokenizer, clip) = (&self.tokenizer, &self.models.clip);
        let conditioning = Conditioning::new(prompt, self.config.guidance_scale, |text| {
            embed(tokenizer, clip, text)
        })?;
        self.residency.release(&mut self.models, SubModelKind::TextEncoder)?;
        Ok(conditioning)
    }

    fn denoise(
        &self,
        init_latent: &Tensor,
        conditioning: &Conditioning,
        scheduler: &ddim::DDIMScheduler,
        schedule: &StrengthSchedule,
    ) -> Tensor {
        let unet = &self.models.unet;
        let conditioning = conditioning.map(|xs| unet.input(xs));
        let init_latent = unet.input(init_latent);
        denoise_latent(&init_latent, &conditioning, scheduler, schedule, |xs, t, emb| {
            unet.forward_with(|m| m.forward(xs, t, emb))
        })
    }

    fn decode(&self, latents: &Tensor) -> anyhow::Result<image::RgbImage> {
        let vae = &self.models.vae;
        let latents = vae.input(latents) / LATENT_SCALE;
        let image = vae.forward_with(|m| m.decode(&latents));
        image_io::tensor_to_rgb(&image)
    }
}

/// Runs the text encoder on a prompt.
fn embed(tokenizer: &clip::Tokenizer, clip: &TextEncoder, text: &str) -> anyhow::Result<Tensor> {
    let tokens = tokenizer.encode(text)?;
    let tokens: Vec<i64> = tokens.into_iter().map(|x| x as i64).collect();
    let tokens = Tensor::from_slice(&tokens).view((1, -1)).to(clip.device());
    Ok(clip.forward_with(|m| m.forward(&tokens)))
}

/// The text conditioning of the denoising loop.
#[derive(Debug)]
pub struct Conditioning {
    pub cond: Tensor,
    /// Only computed for classifier free guidance, i.e. a scale other than 1.
    pub uncond: Option<Tensor>,
    pub guidance_scale: f64,
}

impl Conditioning {
    /// Encodes the prompt with `encode`. A prompt with weighted sub-prompts
    /// is conditioned on the weighted sum of their embeddings, the weights
    /// normalized to sum to one.
    pub fn new<F>(prompt: &str, guidance_scale: f64, mut encode: F) -> anyhow::Result<Self>
    where
        F: FnMut(&str) -> anyhow::Result<Tensor>,
    {
        let uncond = if guidance_scale != 1.0 { Some(encode("")?) } else { None };
        let subprompts = prompt::split_weighted_subprompts(prompt);
        let cond = if subprompts.len() > 1 {
            let weights = prompt::normalized_weights(&subprompts);
            let mut cond = encode(&subprompts[0].text)? * weights[0];
            for (sub, weight) in subprompts.iter().zip(weights.iter()).skip(1) {
                debug!("subprompt {:?} with weight {weight:.3}", sub.text);
                cond = cond + encode(&sub.text)? * *weight;
            }
            cond
        } else {
            encode(prompt)?
        };
        Ok(Self { cond, uncond, guidance_scale })
    }

    pub fn is_guided(&self) -> bool {
        self.uncond.is_some()
    }

    pub fn map<F: Fn(&Tensor) -> Tensor>(&self, f: F) -> Self {
        Self {
            cond: f(&self.cond),
            uncond: self.uncond.as_ref().map(&f),
            guidance_scale: self.guidance_scale,
        }
    }

    /// The UNet text embeddings, the unconditional ones first when guided.
    fn text_embeddings(&self) -> Tensor {
        match &self.uncond {
            Some(uncond) => Tensor::cat(&[uncond, &self.cond], 0),
            None => self.cond.shallow_clone(),
        }
    }
}

/// `uc + scale * (c - uc)` over the two halves of a guided noise prediction.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Tensor {
    let noise_pred = noise_pred.chunk(2, 0);
    let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
    noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * guidance_scale
}

/// Noises `init_latent` up to the start of `schedule` and denoises it over
/// the remaining steps. `unet` predicts the noise from the scaled latents, the
/// timestep and the text embeddings, with a single call per step.
pub fn denoise_latent<F>(
    init_latent: &Tensor,
    conditioning: &Conditioning,
    scheduler: &ddim::DDIMScheduler,
    schedule: &StrengthSchedule,
    mut unet: F,
) -> Tensor
where
    F: FnMut(&Tensor, f64, &Tensor) -> Tensor,
{
    let timesteps = scheduler.timesteps();
    let mut latents = match schedule.noise_timestep(timesteps) {
        None => return init_latent.shallow_clone(),
        Some(timestep) => scheduler.add_noise(init_latent, init_latent.randn_like(), timestep),
    };
    let text_embeddings = conditioning.text_embeddings();
    for (timestep_index, timestep) in schedule.remaining(timesteps) {
        debug!("timestep {timestep_index}/{}", timesteps.len());
        let noise_pred = if conditioning.is_guided() {
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0);
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep);
            let noise_pred = unet(&latent_model_input, timestep as f64, &text_embeddings);
            apply_guidance(&noise_pred, conditioning.guidance_scale)
        } else {
            let latent_model_input = scheduler.scale_model_input(latents.shallow_clone(), timestep);
            unet(&latent_model_input, timestep as f64, &text_embeddings)
        };
        latents = scheduler.step(&noise_pred, timestep, &latents);
    }
    latents
}

/// Calls `sample` once per image, seeding the generator with `seed + idx`
/// beforehand so that any image can be reproduced on its own. The samples
/// are returned in host memory.
pub fn sample_batch<F>(seed: u64, batch_size: usize, mut sample: F) -> Vec<Tensor>
where
    F: FnMut(usize) -> Tensor,
{
    (0..batch_size)
        .map(|idx| {
            info!("sampling {}/{batch_size}", idx + 1);
            tch::manual_seed((seed + idx as u64) as i64);
            sample(idx).to_device(Device::Cpu)
        })
        .collect()
}

/// Writes each image as `seed_<seed + idx>_<count>.png` and `latest.png`
/// unless `skip_save`, then the grid when `grid_columns` is set.
pub fn save_outputs(
    layout: &mut OutputLayout,
    seed: u64,
    images: &[image::RgbImage],
    skip_save: bool,
    grid_columns: Option<usize>,
) -> anyhow::Result<(Vec<PathBuf>, Option<PathBuf>)> {
    let mut samples = vec![];
    if !skip_save {
        for (idx, image) in images.iter().enumerate() {
            let path = layout.next_sample_path(seed + idx as u64);
            image_io::save(image, &path)?;
            image_io::save(image, layout.latest_path())?;
            samples.push(path);
        }
    }
    let grid = match grid_columns.and_then(|columns| image_io::make_grid(images, columns)) {
        Some(grid) => {
            let path = layout.grid_path();
            image_io::save(&grid, &path)?;
            Some(path)
        }
        None => None,
    };
    Ok((samples, grid))
}
