use crate::model::loss::sample_normal;
use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};
use serde::{Deserialize, Serialize};

/// Nonlinearity applied after normalization in a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    /// Leaky ReLU with negative slope 0.2.
    LeakyRelu,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => relu(x),
            Activation::LeakyRelu => leaky_relu(x, 0.2),
        }
    }
}

/// Smoothed embedding with the Gaussian it was sampled from.
#[derive(Clone, Debug)]
pub struct Conditioning<B: Backend> {
    pub smoothed: Tensor<B, 2>,
    pub mean: Tensor<B, 2>,
    pub log_sigma: Tensor<B, 2>,
}

/// Conditioning augmentation: embedding -> (mean, log_sigma) -> smoothed sample.
#[derive(Module, Debug)]
pub struct ConditioningAugmentation<B: Backend> {
    projection: Linear<B>,
    #[module(ignore)]
    conditioning_dim: usize,
}

impl<B: Backend> ConditioningAugmentation<B> {
    pub fn new(
        embedding_dim: usize,
        conditioning_dim: usize,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        let projection = LinearConfig::new(embedding_dim, conditioning_dim * 2)
            .with_initializer(initializer.clone())
            .init(device);
        Self {
            projection,
            conditioning_dim,
        }
    }

    pub fn conditioning_dim(&self) -> usize {
        self.conditioning_dim
    }

    /// Sample a smoothed embedding; `epsilon` is the standard-normal noise of shape [N, E].
    pub fn forward(&self, embedding: Tensor<B, 2>, epsilon: Tensor<B, 2>) -> Conditioning<B> {
        let x = leaky_relu(self.projection.forward(embedding), 0.2);
        let mean = x.clone().slice_dim(1, 0..self.conditioning_dim);
        let log_sigma = x.slice_dim(1, self.conditioning_dim..(2 * self.conditioning_dim));
        let smoothed = sample_normal(mean.clone(), log_sigma.clone(), epsilon);
        Conditioning {
            smoothed,
            mean,
            log_sigma,
        }
    }
}

/// Two 3x3 conv/BN layers added back onto the input, then activated.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    activation: Ignored<Activation>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        channels: usize,
        activation: Activation,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        Self {
            conv1: conv3x3(channels, channels, initializer, device),
            bn1: BatchNormConfig::new(channels).init(device),
            conv2: conv3x3(channels, channels, initializer, device),
            bn2: BatchNormConfig::new(channels).init(device),
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let res = self.bn1.forward(self.conv1.forward(x.clone()));
        let res = self.activation.apply(res);
        let res = self.bn2.forward(self.conv2.forward(res));
        self.activation.apply(x.add(res))
    }
}

/// Transposed-conv upsampling block: doubles the spatial size.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    deconv: ConvTranspose2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        Self {
            deconv: deconv4x4(in_channels, out_channels, false, initializer, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.bn.forward(self.deconv.forward(x)))
    }
}

/// Stride-2 conv block: halves the spatial size.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
    activation: Ignored<Activation>,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        activation: Activation,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(initializer.clone())
            .init(device);
        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.apply(self.bn.forward(self.conv.forward(x)))
    }
}

pub(crate) fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    initializer: &Initializer,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(initializer.clone())
        .init(device)
}

pub(crate) fn deconv4x4<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    initializer: &Initializer,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .with_initializer(initializer.clone())
        .init(device)
}

/// Number of doublings taking `from` to `to`, if `to == from * 2^k`.
pub(crate) fn doublings(from: usize, to: usize) -> Option<usize> {
    if from == 0 || to < from || to % from != 0 {
        return None;
    }
    let ratio = to / from;
    ratio.is_power_of_two().then(|| ratio.trailing_zeros() as usize)
}

/// Broadcast a [N, E] vector over a [N, E, H, W] map.
pub(crate) fn tile_spatial<B: Backend>(x: Tensor<B, 2>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, channels] = x.dims();
    x.reshape([batch, channels, 1, 1])
        .repeat_dim(2, height)
        .repeat_dim(3, width)
}
