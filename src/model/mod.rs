pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod loss;

use crate::error::StackGanError;
use burn::nn::Initializer;
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{
    GeneratorStage1, GeneratorStage1Config, GeneratorStage2, GeneratorStage2Config,
    Stage1Condition, Stage2Condition,
};
pub use layers::Conditioning;

/// Losses a generator contributes besides the adversarial term.
#[derive(Clone, Debug)]
pub struct AuxiliaryLosses<B: Backend> {
    /// KL regularizer, already weighted.
    pub kl: Tensor<B, 1>,
}

/// Everything a generator forward pass hands back to the trainer.
#[derive(Clone, Debug)]
pub struct GeneratorOutput<B: Backend> {
    pub images: Tensor<B, 4>,
    pub conditioning: Conditioning<B>,
    pub aux: AuxiliaryLosses<B>,
}

/// A network that turns a conditioning input into images.
pub trait Generate<B: Backend> {
    type Condition;

    /// `epsilon` is the standard-normal noise for conditioning augmentation.
    fn generate(&self, condition: Self::Condition, epsilon: Tensor<B, 2>) -> GeneratorOutput<B>;
}

/// A network that scores images against text embeddings.
pub trait Discriminate<B: Backend> {
    /// Returns one logit per image, shape [N, 1].
    fn discriminate(&self, images: Tensor<B, 4>, embedding: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// A generator/discriminator pair producing images of one resolution.
#[derive(Clone, Debug)]
pub struct ConditionalGan<G, D> {
    pub generator: G,
    pub discriminator: D,
    pub image_size: usize,
}

pub type StackGan1<B> = ConditionalGan<GeneratorStage1<B>, Discriminator<B>>;
pub type StackGan2<B> = ConditionalGan<GeneratorStage2<B>, Discriminator<B>>;

/// Hyperparameters shared by both stages.
#[derive(Config, Debug)]
pub struct StackGanConfig {
    #[config(default = 3)]
    pub image_channels: usize,
    #[config(default = 1024)]
    pub embedding_dim: usize,
    #[config(default = 128)]
    pub conditioning_dim: usize,
    #[config(default = 100)]
    pub noise_dim: usize,
    #[config(default = 128)]
    pub gf_dim: usize,
    #[config(default = 64)]
    pub df_dim: usize,
    #[config(default = 128)]
    pub embedding_projection_dim: usize,
    #[config(default = 64)]
    pub small_image_size: usize,
    #[config(default = 256)]
    pub large_image_size: usize,
    /// Side of the map the stage 1 projection is reshaped into.
    #[config(default = 4)]
    pub initial_size: usize,
    /// Side of the map the discriminator head sees.
    #[config(default = 4)]
    pub discriminator_feature_size: usize,
    #[config(default = 2)]
    pub stage2_downsamples: usize,
    #[config(default = 2)]
    pub stage2_residuals: usize,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

impl StackGanConfig {
    pub fn generator_stage1_config(&self) -> GeneratorStage1Config {
        GeneratorStage1Config::new(self.image_channels, self.small_image_size, self.embedding_dim)
            .with_conditioning_dim(self.conditioning_dim)
            .with_noise_dim(self.noise_dim)
            .with_gf_dim(self.gf_dim)
            .with_initial_size(self.initial_size)
            .with_initializer(self.initializer.clone())
    }

    pub fn generator_stage2_config(&self) -> GeneratorStage2Config {
        GeneratorStage2Config::new(
            self.image_channels,
            self.small_image_size,
            self.large_image_size,
            self.embedding_dim,
        )
        .with_conditioning_dim(self.conditioning_dim)
        .with_gf_dim(self.gf_dim)
        .with_num_downsamples(self.stage2_downsamples)
        .with_num_residual(self.stage2_residuals)
        .with_initializer(self.initializer.clone())
    }

    /// Discriminator for images of side `image_size`.
    ///
    /// The stem accounts for the first halving; the remaining ones are stride-2 blocks.
    pub fn discriminator_config(&self, image_size: usize) -> crate::Result<DiscriminatorConfig> {
        let num_downsamples = layers::doublings(self.discriminator_feature_size, image_size)
            .and_then(|halvings| halvings.checked_sub(1))
            .ok_or_else(|| {
                StackGanError::invalid_config(format!(
                    "discriminator feature size {} is not image size {image_size} halved at least once",
                    self.discriminator_feature_size
                ))
            })?;
        Ok(DiscriminatorConfig::new(
            self.image_channels,
            image_size,
            self.embedding_dim,
            num_downsamples,
        )
        .with_df_dim(self.df_dim)
        .with_embedding_projection_dim(self.embedding_projection_dim)
        .with_initializer(self.initializer.clone()))
    }

    pub fn init_stage1<B: Backend>(&self, device: &B::Device) -> crate::Result<StackGan1<B>> {
        Ok(ConditionalGan {
            generator: self.generator_stage1_config().init(device)?,
            discriminator: self.discriminator_config(self.small_image_size)?.init(device)?,
            image_size: self.small_image_size,
        })
    }

    pub fn init_stage2<B: Backend>(&self, device: &B::Device) -> crate::Result<StackGan2<B>> {
        Ok(ConditionalGan {
            generator: self.generator_stage2_config().init(device)?,
            discriminator: self.discriminator_config(self.large_image_size)?.init(device)?,
            image_size: self.large_image_size,
        })
    }

    /// Image side produced by `stage` (1 or 2).
    pub fn image_size(&self, stage: usize) -> crate::Result<usize> {
        match stage {
            1 => Ok(self.small_image_size),
            2 => Ok(self.large_image_size),
            other => Err(StackGanError::invalid_config(format!(
                "stage must be 1 or 2, found {other}"
            ))),
        }
    }
}
