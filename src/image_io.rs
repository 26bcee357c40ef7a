//! Conversions between image files and the tensors fed to the autoencoder.
//!
//! Pixel tensors are laid out as (channel, height, width) with values in
//! `[-1, 1]`.
use std::path::Path;

use anyhow::Context;
use image::{imageops::FilterType, RgbImage};
use tch::{Device, Kind, Tensor};

use crate::error::Error;

const SIZE_MULTIPLE: u32 = 64;
const GRID_PADDING: u32 = 2;

/// Rounds a size down to what the autoencoder and UNet accept.
pub fn round_size(width: u32, height: u32) -> (u32, u32) {
    (width - width % SIZE_MULTIPLE, height - height % SIZE_MULTIPLE)
}

/// Loads the source image as a `[1, 3, height, width]` tensor.
///
/// The image is resized to `size` (width, height) if given, else kept at its
/// own size, after rounding both dimensions down to a multiple of 64.
pub fn load_init_image<P: AsRef<Path>>(
    path: P,
    size: Option<(u32, u32)>,
) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let image = image::open(path)
        .with_context(|| format!("error opening image {:?}", path.to_string_lossy()))?
        .to_rgb8();
    let (w, h) = image.dimensions();
    tracing::info!("loaded input image of size ({w}, {h}) from {path:?}");
    let (w0, h0) = size.unwrap_or((w, h));
    let (new_w, new_h) = round_size(w0, h0);
    if new_w == 0 || new_h == 0 {
        let path = path.to_path_buf();
        return Err(Error::ImageTooSmall { path, width: w0, height: h0 }.into());
    }
    tracing::info!("new image size ({new_w}, {new_h})");
    let image = if (new_w, new_h) == (w, h) {
        image
    } else {
        image::imageops::resize(&image, new_w, new_h, FilterType::Lanczos3)
    };
    Ok(rgb_to_tensor(&image).unsqueeze(0))
}

/// `[3, height, width]` float tensor in `[-1, 1]`.
pub fn rgb_to_tensor(image: &RgbImage) -> Tensor {
    let (w, h) = image.dimensions();
    let xs = Tensor::from_slice(image.as_raw())
        .view([h as i64, w as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float);
    xs / 255. * 2. - 1.
}

/// Inverse of [`rgb_to_tensor`], accepts a leading batch dimension of one.
pub fn tensor_to_rgb(xs: &Tensor) -> anyhow::Result<RgbImage> {
    let xs = match xs.dim() {
        4 => xs.squeeze_dim(0),
        _ => xs.shallow_clone(),
    };
    let (channels, height, width) = xs.size3()?;
    if channels != 3 {
        anyhow::bail!("expected 3 channels, got a tensor of shape {:?}", xs.size());
    }
    let xs = ((xs.to_kind(Kind::Float).to_device(Device::Cpu) + 1.) / 2.).clamp(0., 1.);
    let xs = (xs * 255.).to_kind(Kind::Uint8).permute([1, 2, 0]).contiguous().view([-1]);
    let pixels = Vec::<u8>::try_from(&xs)?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .context("pixel buffer does not match the image size")
}

/// Tiles images in rows of `columns`, with a 2 pixel black border around
/// each image. All images are expected to share the size of the first one.
pub fn make_grid(images: &[RgbImage], columns: usize) -> Option<RgbImage> {
    let first = images.first()?;
    let (w, h) = first.dimensions();
    let columns = columns.clamp(1, images.len());
    let rows = (images.len() + columns - 1) / columns;
    let grid_w = columns as u32 * (w + GRID_PADDING) + GRID_PADDING;
    let grid_h = rows as u32 * (h + GRID_PADDING) + GRID_PADDING;
    let mut grid = RgbImage::new(grid_w, grid_h);
    for (idx, image) in images.iter().enumerate() {
        let x = (idx % columns) as u32 * (w + GRID_PADDING) + GRID_PADDING;
        let y = (idx / columns) as u32 * (h + GRID_PADDING) + GRID_PADDING;
        image::imageops::replace(&mut grid, image, x as i64, y as i64);
    }
    Some(grid)
}

pub fn save<P: AsRef<Path>>(image: &RgbImage, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    image.save(path).with_context(|| format!("error saving {:?}", path.to_string_lossy()))
}
