use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::Tensor;
use image::{DynamicImage, ImageFormat};
use tracing::warn;

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .context("error converting tensor to image buffer")?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Encodes an image as PNG in memory and returns the base64 text.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Cuts a token sequence down to `max_len` ids. The final id, the end of
/// sequence marker added by the tokenizer, is kept in the last position.
pub fn truncate_tokens(mut ids: Vec<u32>, max_len: usize) -> Vec<u32> {
    if ids.len() <= max_len {
        return ids;
    }
    warn!(tokens = ids.len(), max_len, "prompt truncated");
    match (ids.last().copied(), max_len) {
        (_, 0) | (None, _) => ids.clear(),
        (Some(eos), _) => {
            ids.truncate(max_len);
            ids[max_len - 1] = eos;
        }
    }
    ids
}

pub fn base64_png_to_image(b64: &str) -> Result<DynamicImage> {
    let bytes = BASE64_STANDARD
        .decode(b64)
        .context("image payload is not valid base64")?;
    image::load_from_memory_with_format(&bytes, ImageFormat::Png)
        .context("image payload is not a valid PNG")
}
