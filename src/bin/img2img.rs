// Stable diffusion image to image sampling on a memory constrained accelerator.
//
// The UNet, CLIP and autoencoder weights are kept in host memory and each one
// is moved to the accelerator only while it is needed. Weights either come as
// three .ot/.safetensors files, or as one combined checkpoint where the keys
// of each sub-model share a prefix (see --ckpt and the --*-prefix flags).
//
// Suggestions:
// image: https://raw.githubusercontent.com/CompVis/stable-diffusion/main/assets/stable-samples/img2img/sketch-mountains-input.jpg
// prompt = "A fantasy landscape, trending on artstation"
use clap::Parser;
use img2img::config::{
    Img2ImgConfig, Precision, PromptSource, ResidencyPolicy, StableDiffusionVersion,
    WeightSource, DEFAULT_PROMPT,
};
use img2img::pipelines::img2img::Img2ImgPipeline;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to render.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// If specified, the prompt is the first line of this file.
    #[arg(long, value_name = "FILE", alias = "from_file")]
    from_file: Option<PathBuf>,

    /// The input image.
    #[arg(long, value_name = "FILE", alias = "init_img")]
    init_img: PathBuf,

    /// The directory to write results to.
    #[arg(long, value_name = "DIR", default_value = "outputs/img2img-samples")]
    outdir: PathBuf,

    /// Do not save a grid, only individual samples.
    #[arg(long, alias = "skip_grid")]
    skip_grid: bool,

    /// Do not save individual samples.
    #[arg(long, alias = "skip_save")]
    skip_save: bool,

    /// The number of DDIM sampling steps.
    #[arg(long, default_value_t = 50, alias = "ddim_steps")]
    ddim_steps: usize,

    /// DDIM eta, 0.0 corresponds to deterministic sampling.
    #[arg(long, default_value_t = 0.0, alias = "ddim_eta")]
    ddim_eta: f64,

    /// Sample this often.
    #[arg(long, default_value_t = 1, alias = "n_iter")]
    n_iter: usize,

    /// Image height in pixel space, defaults to the input image height.
    #[arg(long, alias = "H", requires = "width")]
    height: Option<u32>,

    /// Image width in pixel space, defaults to the input image width.
    #[arg(long, alias = "W", requires = "height")]
    width: Option<u32>,

    /// The strength, indicates how much to transform the initial image. The
    /// value must be between 0 and 1, a value of 1 discards the initial image
    /// information.
    #[arg(long, default_value_t = 0.75)]
    strength: f64,

    /// How many samples to produce for the prompt.
    #[arg(long, default_value_t = 5, alias = "n_samples")]
    n_samples: usize,

    /// Images per grid row, defaults to the number of samples.
    #[arg(long, default_value_t = 0, alias = "n_rows")]
    n_rows: usize,

    /// Unconditional guidance scale.
    #[arg(long, default_value_t = 7.5)]
    scale: f64,

    /// The random seed, picked at random when not set.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = Precision::Autocast)]
    precision: Precision,

    /// A combined checkpoint holding the three sub-models. When set, the
    /// separate weight files are not used.
    #[arg(long, value_name = "FILE")]
    ckpt: Option<PathBuf>,

    /// Key prefix of the UNet weights in the combined checkpoint.
    #[arg(long, default_value = "unet.")]
    unet_prefix: String,

    /// Key prefix of the CLIP weights in the combined checkpoint.
    #[arg(long, default_value = "text_encoder.")]
    clip_prefix: String,

    /// Key prefix of the autoencoder weights in the combined checkpoint.
    #[arg(long, default_value = "vae.")]
    vae_prefix: String,

    /// The UNet weight file, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE", default_value = "data/unet.ot")]
    unet_weights: PathBuf,

    /// The CLIP weight file, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE", default_value = "data/pytorch_model.ot")]
    clip_weights: PathBuf,

    /// The VAE weight file, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE", default_value = "data/vae.ot")]
    vae_weights: PathBuf,

    /// The file specifying the vocabulary to used for tokenization.
    #[arg(long, value_name = "FILE", default_value = "data/bpe_simple_vocab_16e6.txt")]
    vocab_file: PathBuf,

    #[arg(long, value_enum, default_value_t = StableDiffusionVersion::V1_5)]
    sd_version: StableDiffusionVersion,

    /// The size of the sliced attention or 0 to disable slicing (default)
    #[arg(long)]
    sliced_attention_size: Option<i64>,

    /// When set, use the CPU for the listed devices, can be 'all', 'unet', 'clip', etc.
    /// Multiple values can be set.
    #[arg(long)]
    cpu: Vec<String>,

    /// Keep sub-models on the accelerator between phases, faster but uses
    /// more memory.
    #[arg(long)]
    turbo: bool,

    /// The accelerator memory budget for the sub-model weights, in MB.
    #[arg(long)]
    vram_budget_mb: Option<u64>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Img2ImgConfig {
        let prompt = match self.from_file {
            Some(path) => PromptSource::File(path),
            None => PromptSource::Text(self.prompt),
        };
        let weights = match self.ckpt {
            Some(checkpoint) => WeightSource::Combined {
                checkpoint,
                unet_prefix: self.unet_prefix,
                clip_prefix: self.clip_prefix,
                vae_prefix: self.vae_prefix,
            },
            None => WeightSource::Separate {
                unet: self.unet_weights,
                clip: self.clip_weights,
                vae: self.vae_weights,
            },
        };
        let residency = if self.turbo { ResidencyPolicy::Turbo } else { ResidencyPolicy::LowVram };
        Img2ImgConfig {
            prompt,
            init_image: self.init_img,
            outdir: self.outdir,
            weights,
            vocab_file: self.vocab_file,
            sd_version: self.sd_version,
            sliced_attention_size: self.sliced_attention_size,
            cpu: self.cpu,
            ddim_steps: self.ddim_steps,
            ddim_eta: self.ddim_eta,
            strength: self.strength,
            n_samples: self.n_samples,
            n_iter: self.n_iter,
            n_rows: self.n_rows,
            guidance_scale: self.scale,
            seed: self.seed,
            height: self.height,
            width: self.width,
            precision: self.precision,
            skip_grid: self.skip_grid,
            skip_save: self.skip_save,
            residency,
            vram_budget: self.vram_budget_mb.map(|mb| mb * 1_000_000),
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let mut pipeline = Img2ImgPipeline::new(args.into_config())?;
    let summary = pipeline.run()?;
    println!("Your samples are ready and waiting for you here: {}", summary.sample_dir.display());
    if let Some(grid) = summary.grid {
        println!("Grid: {}", grid.display());
    }
    Ok(())
}
