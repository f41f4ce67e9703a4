use crate::error::StackGanError;
use crate::model::layers::{
    conv3x3, deconv4x4, doublings, tile_spatial, Activation, ConditioningAugmentation, DownBlock,
    ResidualBlock, UpBlock,
};
use crate::model::loss::{kl_loss, KL_COEFFICIENT};
use crate::model::{AuxiliaryLosses, Generate, GeneratorOutput};
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the low-resolution (stage 1) generator.
#[derive(Config, Debug)]
pub struct GeneratorStage1Config {
    pub image_channels: usize,
    pub image_size: usize,
    pub embedding_dim: usize,
    #[config(default = 128)]
    pub conditioning_dim: usize,
    #[config(default = 100)]
    pub noise_dim: usize,
    #[config(default = 128)]
    pub gf_dim: usize,
    /// Side of the feature map the dense projection is reshaped into.
    #[config(default = 4)]
    pub initial_size: usize,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Inputs of the stage 1 generator.
#[derive(Clone, Debug)]
pub struct Stage1Condition<B: Backend> {
    pub embedding: Tensor<B, 2>,
    pub noise: Tensor<B, 2>,
}

/// Stage 1 generator: (embedding, noise) -> low-resolution image.
#[derive(Module, Debug)]
pub struct GeneratorStage1<B: Backend> {
    conditioning: ConditioningAugmentation<B>,
    projection: Linear<B>,
    projection_norm: BatchNorm<B>,
    head_residual: ResidualBlock<B>,
    mid_residual: Option<ResidualBlock<B>>,
    up_blocks: Vec<UpBlock<B>>,
    to_image: Option<ConvTranspose2d<B>>,
    out_conv: Conv2d<B>,
    #[module(ignore)]
    base_channels: usize,
    #[module(ignore)]
    initial_size: usize,
    #[module(ignore)]
    noise_dim: usize,
    #[module(ignore)]
    image_size: usize,
}

pub(crate) fn check_image_channels(channels: usize) -> crate::Result<()> {
    if channels == 1 || channels == 3 {
        Ok(())
    } else {
        Err(StackGanError::invalid_config(format!(
            "the number of image channels must be 3 or 1, found {channels}"
        )))
    }
}

impl GeneratorStage1Config {
    /// Number of 2x upsampling steps from the projected map to the output image.
    pub fn num_upsamples(&self) -> crate::Result<usize> {
        doublings(self.initial_size, self.image_size).ok_or_else(|| {
            StackGanError::invalid_config(format!(
                "stage 1 image size {} is not {} times a power of two",
                self.image_size, self.initial_size
            ))
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<GeneratorStage1<B>> {
        check_image_channels(self.image_channels)?;
        let num_upsamples = self.num_upsamples()?;
        let init = &self.initializer;
        let base_channels = self.gf_dim * 8;

        let conditioning =
            ConditioningAugmentation::new(self.embedding_dim, self.conditioning_dim, init, device);
        let projection = LinearConfig::new(
            self.noise_dim + self.conditioning_dim,
            base_channels * self.initial_size * self.initial_size,
        )
        .with_initializer(init.clone())
        .init(device);
        let projection_norm = BatchNormConfig::new(base_channels).init(device);
        let head_residual = ResidualBlock::new(base_channels, Activation::Relu, init, device);

        // All but the last upsampling keep features; the last one emits image channels.
        let mut up_blocks = Vec::with_capacity(num_upsamples.saturating_sub(1));
        let mut channels = base_channels;
        for _ in 1..num_upsamples {
            let next = (channels / 2).max(1);
            up_blocks.push(UpBlock::new(channels, next, init, device));
            channels = next;
        }
        let mid_residual = up_blocks.first().map(|_| {
            ResidualBlock::new((base_channels / 2).max(1), Activation::Relu, init, device)
        });

        let (to_image, out_in_channels) = if num_upsamples > 0 {
            let deconv = deconv4x4(channels, self.image_channels, true, init, device);
            (Some(deconv), self.image_channels)
        } else {
            (None, channels)
        };
        let out_conv = conv3x3(out_in_channels, self.image_channels, init, device);

        Ok(GeneratorStage1 {
            conditioning,
            projection,
            projection_norm,
            head_residual,
            mid_residual,
            up_blocks,
            to_image,
            out_conv,
            base_channels,
            initial_size: self.initial_size,
            noise_dim: self.noise_dim,
            image_size: self.image_size,
        })
    }
}

impl<B: Backend> GeneratorStage1<B> {
    pub fn conditioning_dim(&self) -> usize {
        self.conditioning.conditioning_dim()
    }

    pub fn noise_dim(&self) -> usize {
        self.noise_dim
    }

    /// Side of the images this generator produces.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn forward(
        &self,
        embedding: Tensor<B, 2>,
        noise: Tensor<B, 2>,
        epsilon: Tensor<B, 2>,
    ) -> GeneratorOutput<B> {
        let conditioning = self.conditioning.forward(embedding, epsilon);
        let batch = noise.dims()[0];
        let x = Tensor::cat(vec![noise, conditioning.smoothed.clone()], 1);

        let x = self.projection.forward(x).reshape([
            batch,
            self.base_channels,
            self.initial_size,
            self.initial_size,
        ]);
        let x = relu(self.projection_norm.forward(x));
        let mut x = self.head_residual.forward(x);

        for (idx, up) in self.up_blocks.iter().enumerate() {
            x = up.forward(x);
            if idx == 0 {
                if let Some(residual) = &self.mid_residual {
                    x = residual.forward(x);
                }
            }
        }
        if let Some(to_image) = &self.to_image {
            x = to_image.forward(x);
        }
        let images = self.out_conv.forward(x).tanh();

        let kl = kl_loss(conditioning.mean.clone(), conditioning.log_sigma.clone())
            .mul_scalar(KL_COEFFICIENT);
        GeneratorOutput {
            images,
            conditioning,
            aux: AuxiliaryLosses { kl },
        }
    }
}

impl<B: Backend> Generate<B> for GeneratorStage1<B> {
    type Condition = Stage1Condition<B>;

    fn generate(&self, condition: Self::Condition, epsilon: Tensor<B, 2>) -> GeneratorOutput<B> {
        self.forward(condition.embedding, condition.noise, epsilon)
    }
}

/// Configuration for the high-resolution (stage 2) generator.
#[derive(Config, Debug)]
pub struct GeneratorStage2Config {
    pub image_channels: usize,
    /// Side of the stage 1 images fed in.
    pub input_size: usize,
    /// Side of the images produced.
    pub image_size: usize,
    pub embedding_dim: usize,
    #[config(default = 128)]
    pub conditioning_dim: usize,
    #[config(default = 128)]
    pub gf_dim: usize,
    #[config(default = 2)]
    pub num_downsamples: usize,
    #[config(default = 2)]
    pub num_residual: usize,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

/// Inputs of the stage 2 generator.
#[derive(Clone, Debug)]
pub struct Stage2Condition<B: Backend> {
    pub low_res: Tensor<B, 4>,
    pub embedding: Tensor<B, 2>,
}

/// Stage 2 generator: (stage 1 image, embedding) -> high-resolution image.
#[derive(Module, Debug)]
pub struct GeneratorStage2<B: Backend> {
    conditioning: ConditioningAugmentation<B>,
    in_conv: Conv2d<B>,
    down_blocks: Vec<DownBlock<B>>,
    joint_conv: Conv2d<B>,
    joint_norm: BatchNorm<B>,
    residuals: Vec<ResidualBlock<B>>,
    up_blocks: Vec<UpBlock<B>>,
    out_conv: Conv2d<B>,
    #[module(ignore)]
    input_size: usize,
}

impl GeneratorStage2Config {
    /// Number of 2x upsampling steps after the encoder.
    pub fn num_upsamples(&self) -> crate::Result<usize> {
        let divisor = 1usize << self.num_downsamples;
        if self.input_size % divisor != 0 {
            return Err(StackGanError::invalid_config(format!(
                "stage 2 input size {} cannot be halved {} times",
                self.input_size, self.num_downsamples
            )));
        }
        doublings(self.input_size / divisor, self.image_size).ok_or_else(|| {
            StackGanError::invalid_config(format!(
                "stage 2 image size {} is not reachable from an encoded size of {}",
                self.image_size,
                self.input_size / divisor
            ))
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<GeneratorStage2<B>> {
        check_image_channels(self.image_channels)?;
        let num_upsamples = self.num_upsamples()?;
        let init = &self.initializer;

        let conditioning =
            ConditioningAugmentation::new(self.embedding_dim, self.conditioning_dim, init, device);
        let in_conv = conv3x3(self.image_channels, self.gf_dim, init, device);

        let mut channels = self.gf_dim;
        let mut down_blocks = Vec::with_capacity(self.num_downsamples);
        for _ in 0..self.num_downsamples {
            let next = (channels * 2).min(self.gf_dim * 8);
            down_blocks.push(DownBlock::new(channels, next, Activation::Relu, init, device));
            channels = next;
        }

        let joint_conv = conv3x3(channels + self.conditioning_dim, channels, init, device);
        let joint_norm = BatchNormConfig::new(channels).init(device);
        let residuals = (0..self.num_residual)
            .map(|_| ResidualBlock::new(channels, Activation::Relu, init, device))
            .collect();

        let mut up_blocks = Vec::with_capacity(num_upsamples);
        for _ in 0..num_upsamples {
            let next = (channels / 2).max(1);
            up_blocks.push(UpBlock::new(channels, next, init, device));
            channels = next;
        }
        let out_conv = conv3x3(channels, self.image_channels, init, device);

        Ok(GeneratorStage2 {
            conditioning,
            in_conv,
            down_blocks,
            joint_conv,
            joint_norm,
            residuals,
            up_blocks,
            out_conv,
            input_size: self.input_size,
        })
    }
}

impl<B: Backend> GeneratorStage2<B> {
    pub fn conditioning_dim(&self) -> usize {
        self.conditioning.conditioning_dim()
    }

    /// Side of the low-resolution images this generator expects.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn forward(
        &self,
        low_res: Tensor<B, 4>,
        embedding: Tensor<B, 2>,
        epsilon: Tensor<B, 2>,
    ) -> GeneratorOutput<B> {
        let conditioning = self.conditioning.forward(embedding, epsilon);

        let mut x = relu(self.in_conv.forward(low_res));
        for down in &self.down_blocks {
            x = down.forward(x);
        }

        let [_, _, height, width] = x.dims();
        let tiled = tile_spatial(conditioning.smoothed.clone(), height, width);
        let x = Tensor::cat(vec![x, tiled], 1);
        let mut x = relu(self.joint_norm.forward(self.joint_conv.forward(x)));

        for residual in &self.residuals {
            x = residual.forward(x);
        }
        for up in &self.up_blocks {
            x = up.forward(x);
        }
        let images = self.out_conv.forward(x).tanh();

        let kl = kl_loss(conditioning.mean.clone(), conditioning.log_sigma.clone())
            .mul_scalar(KL_COEFFICIENT);
        GeneratorOutput {
            images,
            conditioning,
            aux: AuxiliaryLosses { kl },
        }
    }
}

impl<B: Backend> Generate<B> for GeneratorStage2<B> {
    type Condition = Stage2Condition<B>;

    fn generate(&self, condition: Self::Condition, epsilon: Tensor<B, 2>) -> GeneratorOutput<B> {
        self.forward(condition.low_res, condition.embedding, epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn stage1_config(channels: usize) -> GeneratorStage1Config {
        GeneratorStage1Config::new(channels, 16, 12)
            .with_conditioning_dim(4)
            .with_noise_dim(5)
            .with_gf_dim(4)
    }

    #[test]
    fn stage1_accepts_one_or_three_channels() {
        let device = Default::default();
        for channels in [1, 3] {
            assert!(stage1_config(channels).init::<TestBackend>(&device).is_ok());
        }
    }

    #[test]
    fn stage1_rejects_other_channel_counts() {
        let device = Default::default();
        for channels in [0, 2, 4] {
            let result = stage1_config(channels).init::<TestBackend>(&device);
            assert!(matches!(result, Err(StackGanError::InvalidConfig(_))));
        }
    }

    #[test]
    fn stage1_rejects_unreachable_image_size() {
        let device = Default::default();
        let result = GeneratorStage1Config::new(3, 20, 12).init::<TestBackend>(&device);
        assert!(matches!(result, Err(StackGanError::InvalidConfig(_))));
    }

    #[test]
    fn stage1_produces_bounded_images_at_target_size() {
        let device = Default::default();
        let generator = stage1_config(3).init::<TestBackend>(&device).unwrap();
        let output = generator.generate(
            Stage1Condition {
                embedding: Tensor::ones([2, 12], &device),
                noise: Tensor::ones([2, 5], &device),
            },
            Tensor::zeros([2, 4], &device),
        );

        assert_eq!(output.images.dims(), [2, 3, 16, 16]);
        assert_eq!(output.conditioning.mean.dims(), [2, 4]);
        assert_eq!(output.conditioning.log_sigma.dims(), [2, 4]);
        let pixels = output.images.into_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|p| (-1.0..=1.0).contains(p)));
    }

    #[test]
    fn zero_initialised_stage1_reports_zero_kl() {
        let device = Default::default();
        let generator = stage1_config(1)
            .with_initializer(Initializer::Zeros)
            .init::<TestBackend>(&device)
            .unwrap();
        let output = generator.forward(
            Tensor::ones([2, 12], &device),
            Tensor::ones([2, 5], &device),
            Tensor::ones([2, 4], &device),
        );
        assert_eq!(output.aux.kl.into_scalar().elem::<f64>(), 0.0);
    }

    #[test]
    fn stage2_refines_to_target_size() {
        let device = Default::default();
        let generator = GeneratorStage2Config::new(3, 8, 16, 12)
            .with_conditioning_dim(4)
            .with_gf_dim(4)
            .with_num_downsamples(1)
            .with_num_residual(1)
            .init::<TestBackend>(&device)
            .unwrap();
        let output = generator.generate(
            Stage2Condition {
                low_res: Tensor::zeros([2, 3, 8, 8], &device),
                embedding: Tensor::ones([2, 12], &device),
            },
            Tensor::zeros([2, 4], &device),
        );
        assert_eq!(output.images.dims(), [2, 3, 16, 16]);
    }

    #[test]
    fn stage2_rejects_bad_geometry_and_channels() {
        let device = Default::default();
        let odd = GeneratorStage2Config::new(3, 6, 16, 12).with_num_downsamples(2);
        assert!(matches!(
            odd.init::<TestBackend>(&device),
            Err(StackGanError::InvalidConfig(_))
        ));
        let channels = GeneratorStage2Config::new(2, 8, 16, 12);
        assert!(matches!(
            channels.init::<TestBackend>(&device),
            Err(StackGanError::InvalidConfig(_))
        ));
    }
}
