use crate::error::{ensure_same_shape, Result};
use crate::model::loss::{discriminator_loss, generator_loss, DiscriminatorLosses};
use crate::model::{ConditionalGan, Discriminate, Generate};
use crate::scheduler::LearningRates;
use crate::training::EpochLosses;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// One Adam optimizer per network.
pub(crate) struct GanOptimizers<B, G, D>
where
    B: AutodiffBackend,
    G: AutodiffModule<B>,
    D: AutodiffModule<B>,
{
    generator: OptimizerAdaptor<Adam, G, B>,
    discriminator: OptimizerAdaptor<Adam, D, B>,
}

impl<B, G, D> GanOptimizers<B, G, D>
where
    B: AutodiffBackend,
    G: AutodiffModule<B>,
    D: AutodiffModule<B>,
{
    pub(crate) fn new() -> Self {
        let config = AdamConfig::new().with_beta_1(0.5);
        Self {
            generator: config.init(),
            discriminator: config.init(),
        }
    }
}

/// Images and conditioning for one step.
pub(crate) struct StepInputs<B: Backend, C> {
    pub condition: C,
    pub epsilon: Tensor<B, 2>,
    pub embedding: Tensor<B, 2>,
    pub images: Tensor<B, 4>,
    pub wrong_images: Tensor<B, 4>,
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn check_images<B: Backend>(real: &Tensor<B, 4>, wrong: &Tensor<B, 4>, fake: &Tensor<B, 4>) -> Result<()> {
    ensure_same_shape(
        "real, wrong and fake images",
        &[real.dims(), wrong.dims(), fake.dims()],
    )
}

fn triplet_losses<B: Backend, D: Discriminate<B>>(
    discriminator: &D,
    embedding: &Tensor<B, 2>,
    real: Tensor<B, 4>,
    wrong: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    real_target: f64,
) -> Result<(DiscriminatorLosses<B>, Tensor<B, 2>)> {
    let real_logits = discriminator.discriminate(real, embedding.clone());
    let wrong_logits = discriminator.discriminate(wrong, embedding.clone());
    let fake_logits = discriminator.discriminate(fake, embedding.clone());
    let losses = discriminator_loss(real_logits, wrong_logits, fake_logits.clone(), real_target)?;
    Ok((losses, fake_logits))
}

/// Both objectives are computed against the pre-update networks, then the
/// discriminator (on a detached fake) and the generator each take one Adam step.
pub(crate) fn train_step<B, G, D>(
    gan: ConditionalGan<G, D>,
    optimizers: &mut GanOptimizers<B, G, D>,
    learning_rates: LearningRates,
    inputs: StepInputs<B, G::Condition>,
    real_target: f64,
) -> Result<(ConditionalGan<G, D>, EpochLosses)>
where
    B: AutodiffBackend,
    G: Generate<B> + AutodiffModule<B>,
    D: Discriminate<B> + AutodiffModule<B>,
{
    let ConditionalGan {
        generator,
        discriminator,
        image_size,
    } = gan;
    let StepInputs {
        condition,
        epsilon,
        embedding,
        images,
        wrong_images,
    } = inputs;

    let output = generator.generate(condition, epsilon);
    check_images(&images, &wrong_images, &output.images)?;

    let (d_losses, _) = triplet_losses(
        &discriminator,
        &embedding,
        images,
        wrong_images,
        output.images.clone().detach(),
        real_target,
    )?;
    // The generator is scored by the same pre-update weights, held constant so
    // its graph stays apart from the discriminator's.
    let fake_logits = discriminator
        .clone()
        .no_grad()
        .discriminate(output.images, embedding);
    let g_losses = generator_loss(fake_logits, output.aux.kl);

    let discriminator_total = d_losses.total.clone();
    let grads = GradientsParams::from_grads(discriminator_total.backward(), &discriminator);
    let discriminator = optimizers
        .discriminator
        .step(learning_rates.discriminator, discriminator, grads);

    let generator_total = g_losses.total.clone();
    let grads = GradientsParams::from_grads(generator_total.backward(), &generator);
    let generator = optimizers
        .generator
        .step(learning_rates.generator, generator, grads);

    let losses = EpochLosses {
        generator_loss: scalar(g_losses.total),
        discriminator_loss: scalar(d_losses.total),
        kl_loss: scalar(g_losses.kl),
        discriminator_real_loss: scalar(d_losses.real),
        discriminator_wrong_loss: scalar(d_losses.wrong),
        discriminator_fake_loss: scalar(d_losses.fake),
    };
    Ok((
        ConditionalGan {
            generator,
            discriminator,
            image_size,
        },
        losses,
    ))
}

/// Forward-only evaluation; the fake logits feed both objectives.
pub(crate) fn valid_step<B, G, D>(
    generator: &G,
    discriminator: &D,
    inputs: StepInputs<B, G::Condition>,
    real_target: f64,
) -> Result<EpochLosses>
where
    B: Backend,
    G: Generate<B>,
    D: Discriminate<B>,
{
    let StepInputs {
        condition,
        epsilon,
        embedding,
        images,
        wrong_images,
    } = inputs;

    let output = generator.generate(condition, epsilon);
    check_images(&images, &wrong_images, &output.images)?;

    let (d_losses, fake_logits) = triplet_losses(
        discriminator,
        &embedding,
        images,
        wrong_images,
        output.images,
        real_target,
    )?;
    let g_losses = generator_loss(fake_logits, output.aux.kl);

    Ok(EpochLosses {
        generator_loss: scalar(g_losses.total),
        discriminator_loss: scalar(d_losses.total),
        kl_loss: scalar(g_losses.kl),
        discriminator_real_loss: scalar(d_losses.real),
        discriminator_wrong_loss: scalar(d_losses.wrong),
        discriminator_fake_loss: scalar(d_losses.fake),
    })
}
