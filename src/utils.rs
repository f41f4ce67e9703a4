use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 255].
fn to_byte(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0) as u8
}

/// Convert a BCHW tensor in [-1, 1] with 1 or 3 channels to RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = base + y * width + x;
                let pixel = if channels == 1 {
                    let v = to_byte(values[idx]);
                    [v, v, v]
                } else {
                    [
                        to_byte(values[idx]),
                        to_byte(values[idx + hw]),
                        to_byte(values[idx + 2 * hw]),
                    ]
                };
                img.put_pixel(x as u32, y as u32, Rgb(pixel));
            }
        }
        images.push(img);
    }

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to concatenate"));
    }
    let height = images.iter().map(RgbImage::height).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .context("failed to concatenate image")?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Save real images (left column) next to generated ones (right column).
///
/// Generated images are resized to the real resolution when they differ.
pub fn save_comparison<B: Backend>(
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    path: &Path,
) -> Result<()> {
    let real = tensor_to_images(real)?;
    let fake = tensor_to_images(fake)?;
    let rows = real.len().min(fake.len());
    if rows == 0 {
        return Err(anyhow::anyhow!("no images to compare"));
    }

    let (width, height) = real[0].dimensions();
    let fake: Vec<RgbImage> = fake
        .into_iter()
        .map(|img| {
            if img.dimensions() == (width, height) {
                img
            } else {
                image::imageops::resize(&img, width, height, image::imageops::FilterType::Nearest)
            }
        })
        .collect();

    let columns = [
        merge_images(&real[..rows], rows, 1)?,
        merge_images(&fake[..rows], rows, 1)?,
    ];
    let output = concat_images_horiz(&columns)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    output
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}
