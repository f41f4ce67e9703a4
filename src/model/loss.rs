use crate::error::ensure_same_shape;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;

/// Weight of the KL regularizer in the generator objective.
pub const KL_COEFFICIENT: f64 = 2.0;

/// Smoothing that turns burn's hard `1` label into `real_target`.
///
/// Burn smooths a label `t` to `t * (1 - a) + a / 2`, so `a = 2 * (1 - real_target)`.
pub fn label_smoothing(real_target: f64) -> Option<f32> {
    let alpha = 2.0 * (1.0 - real_target);
    (alpha > 0.0).then_some(alpha as f32)
}

/// Mean BCE-with-logits of `logits` against all-ones (`real`) or all-zeros labels.
pub fn binary_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    real: bool,
    smoothing: Option<f32>,
) -> Tensor<B, 1> {
    let device = logits.device();
    let loss = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .with_smoothing(smoothing)
        .init(&device);
    let targets = if real {
        Tensor::<B, 2, Int>::ones(logits.dims(), &device)
    } else {
        Tensor::<B, 2, Int>::zeros(logits.dims(), &device)
    };
    loss.forward(logits, targets)
}

/// KL divergence between N(mean, exp(log_sigma)^2) and N(0, 1), averaged over elements.
pub fn kl_loss<B: Backend>(mean: Tensor<B, 2>, log_sigma: Tensor<B, 2>) -> Tensor<B, 1> {
    let variance = log_sigma.clone().mul_scalar(2.0).exp();
    log_sigma
        .neg()
        .add(variance.sub_scalar(1.0).add(mean.square()).mul_scalar(0.5))
        .mean()
}

/// Reparameterization trick: `mean + exp(log_sigma) * epsilon`.
pub fn sample_normal<B: Backend>(
    mean: Tensor<B, 2>,
    log_sigma: Tensor<B, 2>,
    epsilon: Tensor<B, 2>,
) -> Tensor<B, 2> {
    mean.add(log_sigma.exp().mul(epsilon))
}

/// Generator objective split into its parts.
#[derive(Clone, Debug)]
pub struct GeneratorLosses<B: Backend> {
    pub adversarial: Tensor<B, 1>,
    pub kl: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Discriminator objective split into the real/wrong/fake triplet.
#[derive(Clone, Debug)]
pub struct DiscriminatorLosses<B: Backend> {
    pub real: Tensor<B, 1>,
    pub wrong: Tensor<B, 1>,
    pub fake: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Fake logits should look real; `weighted_kl` is already scaled by [`KL_COEFFICIENT`].
pub fn generator_loss<B: Backend>(
    fake_logits: Tensor<B, 2>,
    weighted_kl: Tensor<B, 1>,
) -> GeneratorLosses<B> {
    let adversarial = binary_cross_entropy(fake_logits, true, None);
    let total = adversarial.clone().add(weighted_kl.clone());
    GeneratorLosses {
        adversarial,
        kl: weighted_kl,
        total,
    }
}

/// `real + 0.5 * wrong + 0.5 * fake`, with `real_target` as the (possibly smoothed) real label.
pub fn discriminator_loss<B: Backend>(
    real_logits: Tensor<B, 2>,
    wrong_logits: Tensor<B, 2>,
    fake_logits: Tensor<B, 2>,
    real_target: f64,
) -> crate::Result<DiscriminatorLosses<B>> {
    ensure_same_shape(
        "real, wrong and fake predictions",
        &[real_logits.dims(), wrong_logits.dims(), fake_logits.dims()],
    )?;

    let real = binary_cross_entropy(real_logits, true, label_smoothing(real_target));
    let wrong = binary_cross_entropy(wrong_logits, false, None);
    let fake = binary_cross_entropy(fake_logits, false, None);
    let total = real
        .clone()
        .add(wrong.clone().mul_scalar(0.5))
        .add(fake.clone().mul_scalar(0.5));

    Ok(DiscriminatorLosses {
        real,
        wrong,
        fake,
        total,
    })
}
