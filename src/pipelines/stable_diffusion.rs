use diffusers::models::{unet_2d, vae};
use diffusers::schedulers::{ddim, PredictionType};
use diffusers::transformers::clip;
use tch::{Device, Kind};

use crate::config::StableDiffusionVersion;
use crate::submodel::{SubModel, SubModelKind, Weights};

pub type Unet = SubModel<unet_2d::UNet2DConditionModel>;
pub type TextEncoder = SubModel<clip::ClipTextTransformer>;
pub type Autoencoder = SubModel<vae::AutoEncoderKL>;

/// Architecture of the three sub-models and of the scheduler for a given
/// stable diffusion release.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub clip: clip::Config,
    autoencoder: vae::AutoEncoderKLConfig,
    unet: unet_2d::UNet2DConditionModelConfig,
    scheduler: ddim::DDIMSchedulerConfig,
}

impl ModelSpec {
    pub fn for_version(
        version: StableDiffusionVersion,
        sliced_attention_size: Option<i64>,
        eta: f64,
    ) -> Self {
        let spec = match version {
            StableDiffusionVersion::V1_5 => Self::v1_5(sliced_attention_size),
            StableDiffusionVersion::V2_1 => Self::v2_1(sliced_attention_size),
        };
        spec.with_eta(eta)
    }

    fn with_eta(mut self, eta: f64) -> Self {
        self.scheduler.eta = eta;
        self
    }

    fn v1_5(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![bc(320, true, 8), bc(640, true, 8), bc(1280, true, 8), bc(1280, false, 8)],
            center_input_sample: false,
            cross_attention_dim: 768,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            layers_per_block: 2,
            mid_block_scale_factor: 1.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            sliced_attention_size,
            use_linear_projection: false,
        };
        Self {
            clip: clip::Config::v1_5(),
            autoencoder: Self::autoencoder_config(),
            scheduler: Default::default(),
            unet,
        }
    }

    fn v2_1(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/stabilityai/stable-diffusion-2-1/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![
                bc(320, true, 5),
                bc(640, true, 10),
                bc(1280, true, 20),
                bc(1280, false, 20),
            ],
            center_input_sample: false,
            cross_attention_dim: 1024,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            layers_per_block: 2,
            mid_block_scale_factor: 1.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            sliced_attention_size,
            use_linear_projection: true,
        };
        let scheduler = ddim::DDIMSchedulerConfig {
            prediction_type: PredictionType::VPrediction,
            ..Default::default()
        };
        Self {
            clip: clip::Config::v2_1(),
            autoencoder: Self::autoencoder_config(),
            scheduler,
            unet,
        }
    }

    // Both releases share the same autoencoder.
    fn autoencoder_config() -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        }
    }

    pub fn build_vae(
        &self,
        weights: Weights<'_>,
        device: Device,
        storage: Kind,
    ) -> anyhow::Result<Autoencoder> {
        let cfg = self.autoencoder.clone();
        SubModel::build(SubModelKind::Autoencoder, device, storage, weights, |p| {
            vae::AutoEncoderKL::new(p, 3, 3, cfg)
        })
    }

    pub fn build_unet(
        &self,
        weights: Weights<'_>,
        device: Device,
        storage: Kind,
    ) -> anyhow::Result<Unet> {
        let cfg = self.unet.clone();
        SubModel::build(SubModelKind::Unet, device, storage, weights, |p| {
            unet_2d::UNet2DConditionModel::new(p, 4, 4, cfg)
        })
    }

    pub fn build_clip_transformer(
        &self,
        weights: Weights<'_>,
        device: Device,
        storage: Kind,
    ) -> anyhow::Result<TextEncoder> {
        SubModel::build(SubModelKind::TextEncoder, device, storage, weights, |p| {
            clip::ClipTextTransformer::new(p, &self.clip)
        })
    }

    pub fn build_scheduler(&self, n_steps: usize) -> ddim::DDIMScheduler {
        ddim::DDIMScheduler::new(n_steps, self.scheduler)
    }
}
