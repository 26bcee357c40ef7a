//! # Pipelines

pub mod img2img;
pub mod stable_diffusion;
