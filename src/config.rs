//! # Run configuration
//!
//! Everything a sampling run needs, independent of how it was collected.
//! The binary fills this from the command line.
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_PROMPT: &str = "a painting of a virus monster playing guitar";

/// The numerical precision used for sub-models living on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Precision {
    /// Single precision everywhere.
    Full,
    /// Half precision on the accelerator, single precision on the CPU.
    #[default]
    Autocast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StableDiffusionVersion {
    #[default]
    #[value(name = "v1-5")]
    V1_5,
    #[value(name = "v2-1")]
    V2_1,
}

/// What happens to a sub-model on the accelerator once its phase is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidencyPolicy {
    /// Move it back to host memory straight away.
    #[default]
    LowVram,
    /// Keep it resident, only evict when another sub-model needs the room.
    Turbo,
}

/// Where the prompt comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Text(String),
    /// Only the first line of the file is used.
    File(PathBuf),
}

/// Where the weights of the three sub-models come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    /// One file per sub-model, loaded straight into its var store.
    Separate { unet: PathBuf, clip: PathBuf, vae: PathBuf },
    /// A single checkpoint holding all three sub-models under distinct prefixes.
    Combined {
        checkpoint: PathBuf,
        unet_prefix: String,
        clip_prefix: String,
        vae_prefix: String,
    },
}

#[derive(Debug, Clone)]
pub struct Img2ImgConfig {
    pub prompt: PromptSource,
    pub init_image: PathBuf,
    pub outdir: PathBuf,
    pub weights: WeightSource,
    pub vocab_file: PathBuf,
    pub sd_version: StableDiffusionVersion,
    pub sliced_attention_size: Option<i64>,
    /// Sub-models forced on the CPU: `all`, `unet`, `clip` or `vae`.
    pub cpu: Vec<String>,
    pub ddim_steps: usize,
    pub ddim_eta: f64,
    pub strength: f64,
    pub n_samples: usize,
    pub n_iter: usize,
    pub n_rows: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub precision: Precision,
    pub skip_grid: bool,
    pub skip_save: bool,
    pub residency: ResidencyPolicy,
    /// Accelerator memory budget in bytes, unlimited when not set.
    pub vram_budget: Option<u64>,
}

impl Img2ImgConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0. ..=1.).contains(&self.strength) {
            return Err(Error::InvalidConfig(format!(
                "strength should be between 0 and 1, got {}",
                self.strength
            )));
        }
        if self.ddim_steps == 0 {
            return Err(Error::InvalidConfig("ddim_steps must be at least 1".to_string()));
        }
        if self.n_samples == 0 || self.n_iter == 0 {
            return Err(Error::InvalidConfig(
                "n_samples and n_iter must be at least 1".to_string(),
            ));
        }
        if self.ddim_eta < 0. {
            return Err(Error::InvalidConfig(format!(
                "ddim_eta must be non-negative, got {}",
                self.ddim_eta
            )));
        }
        match (self.height, self.width) {
            (None, None) => {}
            (Some(h), Some(w)) if h >= 64 && w >= 64 => {}
            (Some(_), Some(_)) => {
                return Err(Error::InvalidConfig(
                    "height and width must be at least 64 pixels".to_string(),
                ))
            }
            _ => {
                return Err(Error::InvalidConfig(
                    "height and width have to be given together".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Iterations are folded into a single batch.
    pub fn batch_size(&self) -> usize {
        self.n_samples * self.n_iter
    }

    /// Number of images per grid row.
    pub fn grid_columns(&self) -> usize {
        if self.n_rows > 0 {
            self.n_rows
        } else {
            self.batch_size()
        }
    }

    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Img2ImgConfig {
        Img2ImgConfig {
            prompt: PromptSource::Text(DEFAULT_PROMPT.to_string()),
            init_image: PathBuf::from("input.png"),
            outdir: PathBuf::from("outputs/img2img-samples"),
            weights: WeightSource::Separate {
                unet: "data/unet.ot".into(),
                clip: "data/pytorch_model.ot".into(),
                vae: "data/vae.ot".into(),
            },
            vocab_file: PathBuf::from("data/bpe_simple_vocab_16e6.txt"),
            sd_version: StableDiffusionVersion::V1_5,
            sliced_attention_size: None,
            cpu: vec![],
            ddim_steps: 50,
            ddim_eta: 0.,
            strength: 0.75,
            n_samples: 5,
            n_iter: 1,
            n_rows: 0,
            guidance_scale: 7.5,
            seed: None,
            height: None,
            width: None,
            precision: Precision::Autocast,
            skip_grid: false,
            skip_save: false,
            residency: ResidencyPolicy::LowVram,
            vram_budget: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn strength_out_of_range() {
        for strength in [-0.1, 1.01] {
            let cfg = Img2ImgConfig { strength, ..sample_config() };
            assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        }
        let cfg = Img2ImgConfig { strength: 1.0, ..sample_config() };
        cfg.validate().unwrap();
    }

    #[test]
    fn size_needs_both_dimensions() {
        let cfg = Img2ImgConfig { height: Some(512), ..sample_config() };
        assert!(cfg.validate().is_err());
        let cfg = Img2ImgConfig { height: Some(512), width: Some(32), ..sample_config() };
        assert!(cfg.validate().is_err());
        let cfg = Img2ImgConfig { height: Some(512), width: Some(768), ..sample_config() };
        cfg.validate().unwrap();
        assert_eq!(cfg.target_size(), Some((768, 512)));
    }

    #[test]
    fn batch_and_grid() {
        let cfg = Img2ImgConfig { n_samples: 3, n_iter: 2, ..sample_config() };
        assert_eq!(cfg.batch_size(), 6);
        assert_eq!(cfg.grid_columns(), 6);
        let cfg = Img2ImgConfig { n_rows: 2, ..cfg };
        assert_eq!(cfg.grid_columns(), 2);
    }
}
