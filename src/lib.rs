//! # Low-VRAM image to image diffusion
//!
//! Image to image sampling for latent diffusion checkpoints, built on the
//! [diffusers](https://github.com/LaurentMazare/diffusers-rs) models using Torch
//! via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Loading the UNet, CLIP and autoencoder sub-models, either from separate
//!   weight files or from a single combined checkpoint with key remapping.
//! - Moving these sub-models between host and accelerator memory so that only
//!   the ones needed by the current phase take accelerator memory.
//! - The img2img sampling loop itself: encode, partial noising, guided DDIM
//!   denoising, decode and image output.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod image_io;
pub mod output;
pub mod pipelines;
pub mod prompt;
pub mod residency;
pub mod schedule;
pub mod submodel;
pub mod utils;

pub use error::{Error, Result};
