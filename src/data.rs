use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_pickle::{DeOptions, Deserializer, Error as PickleError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One image with all of its caption embeddings.
#[derive(Debug, Clone)]
pub struct TextImageExample {
    pub embeddings: Vec<Vec<f32>>,
    /// CHW pixels in [-1, 1].
    pub image: Vec<f32>,
    pub label: Option<i64>,
}

/// (caption_embeddings, image_bytes, label) tuple stored in the pickle stream.
#[derive(Debug, Deserialize)]
struct PickledExample(Vec<Vec<f32>>, Vec<u8>, Option<i64>);

/// Resolution and channel count images are decoded to.
#[derive(Debug, Clone, Copy)]
pub struct DataConfig {
    pub image_size: u32,
    pub channels: usize,
}

impl DataConfig {
    fn image_len(&self) -> usize {
        self.channels * (self.image_size as usize).pow(2)
    }
}

/// A batch of matching images, mismatched images and their captions.
#[derive(Clone, Debug)]
pub struct StackGanBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Images paired with another sample's captions.
    pub wrong_images: Tensor<B, 4>,
    /// [batch, captions, embedding_dim]
    pub captions: Tensor<B, 3>,
    pub labels: Vec<Option<i64>>,
}

/// Load a pickle stream of (caption_embeddings, image_bytes, label) tuples.
pub fn load_pickled_examples(path: &Path, config: &DataConfig) -> Result<Vec<TextImageExample>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut de = Deserializer::new(BufReader::new(file), DeOptions::default());
    let mut examples = Vec::new();

    loop {
        de.reset_memo();
        match PickledExample::deserialize(&mut de) {
            Ok(PickledExample(embeddings, bytes, label)) => {
                let image = decode_image(&bytes, config).with_context(|| {
                    format!("bad image in record {} of {}", examples.len(), path.display())
                })?;
                examples.push(TextImageExample {
                    embeddings,
                    image,
                    label,
                });
            }
            Err(PickleError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to decode pickle stream at {}: {err}",
                    path.display()
                ));
            }
        }
    }

    Ok(examples)
}

/// Decode raw image bytes into normalized CHW floats at the configured size.
pub fn decode_image(bytes: &[u8], config: &DataConfig) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("failed to decode image bytes")?;
    image_to_chw(&img, config)
}

/// Resize and convert an image to CHW floats in [-1, 1].
pub fn image_to_chw(img: &DynamicImage, config: &DataConfig) -> Result<Vec<f32>> {
    let size = config.image_size;
    match config.channels {
        1 => {
            let mut gray: GrayImage = img.to_luma8();
            if gray.dimensions() != (size, size) {
                gray = image::imageops::resize(&gray, size, size, FilterType::CatmullRom);
            }
            Ok(gray.pixels().map(|p| normalize(p.0[0])).collect())
        }
        3 => {
            let mut rgb: RgbImage = img.to_rgb8();
            if rgb.dimensions() != (size, size) {
                rgb = image::imageops::resize(&rgb, size, size, FilterType::CatmullRom);
            }
            let hw = (size * size) as usize;
            let mut out = vec![0.0f32; hw * 3];
            for (idx, pixel) in rgb.pixels().enumerate() {
                out[idx] = normalize(pixel.0[0]);
                out[hw + idx] = normalize(pixel.0[1]);
                out[2 * hw + idx] = normalize(pixel.0[2]);
            }
            Ok(out)
        }
        other => Err(anyhow::anyhow!(
            "the number of image channels must be 3 or 1, found {other}"
        )),
    }
}

fn normalize(value: u8) -> f32 {
    (value as f32 / 127.5) - 1.0
}

/// In-memory dataset whose examples share caption count, caption width and image size.
#[derive(Clone, Debug)]
pub struct TextImageDataset {
    examples: Vec<Arc<TextImageExample>>,
    num_captions: usize,
    embedding_dim: usize,
}

impl TextImageDataset {
    pub fn new(examples: Vec<TextImageExample>, config: &DataConfig) -> Result<Self> {
        let first = examples.first().context("dataset has no examples")?;
        let num_captions = first.embeddings.len();
        let embedding_dim = first.embeddings.first().map(Vec::len).unwrap_or(0);
        if num_captions == 0 || embedding_dim == 0 {
            anyhow::bail!("examples must carry at least one non-empty caption embedding");
        }

        for (idx, example) in examples.iter().enumerate() {
            if example.embeddings.len() != num_captions {
                anyhow::bail!(
                    "example {idx} has {} captions, expected {num_captions}",
                    example.embeddings.len()
                );
            }
            if let Some(caption) = example.embeddings.iter().find(|c| c.len() != embedding_dim) {
                anyhow::bail!(
                    "example {idx} has a caption of width {}, expected {embedding_dim}",
                    caption.len()
                );
            }
            if example.image.len() != config.image_len() {
                anyhow::bail!(
                    "example {idx} has {} pixels, expected {}",
                    example.image.len(),
                    config.image_len()
                );
            }
        }

        Ok(Self {
            examples: examples.into_iter().map(Arc::new).collect(),
            num_captions,
            embedding_dim,
        })
    }

    pub fn from_pickle(path: &Path, config: &DataConfig) -> Result<Self> {
        Self::new(load_pickled_examples(path, config)?, config)
    }

    pub fn num_captions(&self) -> usize {
        self.num_captions
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

impl Dataset<Arc<TextImageExample>> for TextImageDataset {
    fn get(&self, index: usize) -> Option<Arc<TextImageExample>> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

/// Stacks examples into a [`StackGanBatch`], pairing each image with a wrong one.
#[derive(Clone)]
pub struct TextImageBatcher {
    config: DataConfig,
    rng: Arc<Mutex<StdRng>>,
}

impl TextImageBatcher {
    pub fn new(config: DataConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Non-zero rotation of the batch, so no image is its own wrong image
    /// unless the batch has a single element.
    fn wrong_offset(&self, batch_size: usize) -> usize {
        if batch_size < 2 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(1..batch_size)
    }
}

impl<B: Backend> Batcher<B, Arc<TextImageExample>, StackGanBatch<B>> for TextImageBatcher {
    fn batch(&self, items: Vec<Arc<TextImageExample>>, device: &B::Device) -> StackGanBatch<B> {
        let batch_size = items.len();
        let size = self.config.image_size as usize;
        let channels = self.config.channels;
        let num_captions = items.first().map_or(0, |item| item.embeddings.len());
        let embedding_dim = items
            .first()
            .and_then(|item| item.embeddings.first())
            .map_or(0, Vec::len);

        let offset = self.wrong_offset(batch_size);
        let mut images = Vec::with_capacity(batch_size * self.config.image_len());
        let mut wrong_images = Vec::with_capacity(batch_size * self.config.image_len());
        let mut captions = Vec::with_capacity(batch_size * num_captions * embedding_dim);
        let mut labels = Vec::with_capacity(batch_size);

        for (idx, item) in items.iter().enumerate() {
            images.extend_from_slice(&item.image);
            wrong_images.extend_from_slice(&items[(idx + offset) % batch_size].image);
            for caption in &item.embeddings {
                captions.extend_from_slice(caption);
            }
            labels.push(item.label);
        }

        let shape = [batch_size, channels, size, size];
        StackGanBatch {
            images: Tensor::from_data(TensorData::new(images, shape), device),
            wrong_images: Tensor::from_data(TensorData::new(wrong_images, shape), device),
            captions: Tensor::from_data(
                TensorData::new(captions, [batch_size, num_captions, embedding_dim]),
                device,
            ),
            labels,
        }
    }
}

/// Wrap a dataset into a loader producing [`StackGanBatch`]es on `device`.
pub fn build_loader<B: Backend>(
    dataset: TextImageDataset,
    config: DataConfig,
    batch_size: usize,
    seed: u64,
    shuffle: bool,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, StackGanBatch<B>>> {
    let builder = DataLoaderBuilder::<B, Arc<TextImageExample>, StackGanBatch<B>>::new(
        TextImageBatcher::new(config, seed),
    )
    .batch_size(batch_size)
    .set_device(device.clone());
    let builder = if shuffle { builder.shuffle(seed) } else { builder };
    builder.build(dataset)
}
