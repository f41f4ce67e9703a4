use crate::error::StackGanError;
use crate::model::generator::check_image_channels;
use crate::model::layers::{tile_spatial, Activation, DownBlock, ResidualBlock};
use crate::model::Discriminate;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the image/embedding matching discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub image_channels: usize,
    pub image_size: usize,
    pub embedding_dim: usize,
    #[config(default = 64)]
    pub df_dim: usize,
    /// Width the embedding is projected to before joining the image features.
    #[config(default = 128)]
    pub embedding_projection_dim: usize,
    /// Stride-2 blocks between the stride-2 stem and the joint head.
    pub num_downsamples: usize,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Scores (image, embedding) pairs: one logit per image.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    stem: Conv2d<B>,
    down_blocks: Vec<DownBlock<B>>,
    residual: ResidualBlock<B>,
    embedding_projection: Linear<B>,
    joint_conv: Conv2d<B>,
    joint_norm: BatchNorm<B>,
    out_conv: Conv2d<B>,
}

impl DiscriminatorConfig {
    /// Side of the feature map the joint head works on.
    pub fn feature_size(&self) -> crate::Result<usize> {
        let divisor = 1usize << (self.num_downsamples + 1);
        if self.image_size == 0 || self.image_size % divisor != 0 {
            return Err(StackGanError::invalid_config(format!(
                "discriminator input size {} cannot be halved {} times",
                self.image_size,
                self.num_downsamples + 1
            )));
        }
        Ok(self.image_size / divisor)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<Discriminator<B>> {
        check_image_channels(self.image_channels)?;
        let feature_size = self.feature_size()?;
        let init = &self.initializer;

        let stem = Conv2dConfig::new([self.image_channels, self.df_dim], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(init.clone())
            .init(device);
        let mut channels = self.df_dim;
        let mut down_blocks = Vec::with_capacity(self.num_downsamples);
        for _ in 0..self.num_downsamples {
            let next = (channels * 2).min(self.df_dim * 8);
            down_blocks.push(DownBlock::new(
                channels,
                next,
                Activation::LeakyRelu,
                init,
                device,
            ));
            channels = next;
        }
        let residual = ResidualBlock::new(channels, Activation::LeakyRelu, init, device);

        let embedding_projection =
            LinearConfig::new(self.embedding_dim, self.embedding_projection_dim)
                .with_initializer(init.clone())
                .init(device);
        let joint_conv =
            Conv2dConfig::new([channels + self.embedding_projection_dim, channels], [1, 1])
                .with_initializer(init.clone())
                .init(device);
        let joint_norm = BatchNormConfig::new(channels).init(device);
        let out_conv = Conv2dConfig::new([channels, 1], [feature_size, feature_size])
            .with_stride([feature_size, feature_size])
            .with_initializer(init.clone())
            .init(device);

        Ok(Discriminator {
            stem,
            down_blocks,
            residual,
            embedding_projection,
            joint_conv,
            joint_norm,
            out_conv,
        })
    }
}

impl<B: Backend> Discriminator<B> {
    pub fn forward(&self, images: Tensor<B, 4>, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.stem.forward(images), 0.2);
        for down in &self.down_blocks {
            x = down.forward(x);
        }
        let x = self.residual.forward(x);

        let [batch, _, height, width] = x.dims();
        let projected = leaky_relu(self.embedding_projection.forward(embedding), 0.2);
        let x = Tensor::cat(vec![x, tile_spatial(projected, height, width)], 1);
        let x = leaky_relu(self.joint_norm.forward(self.joint_conv.forward(x)), 0.2);

        self.out_conv.forward(x).reshape([batch, 1])
    }
}

impl<B: Backend> Discriminate<B> for Discriminator<B> {
    fn discriminate(&self, images: Tensor<B, 4>, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(images, embedding)
    }
}
