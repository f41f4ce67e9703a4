use crate::checkpoint::{self, EpochSelector};
use crate::data::StackGanBatch;
use crate::error::{Result, StackGanError};
use crate::model::{
    Discriminator, GeneratorStage1, GeneratorStage2, StackGan2, Stage2Condition,
};
use crate::rng::RandomContext;
use crate::scheduler::LearningRates;
use crate::training::step::{self, GanOptimizers, StepInputs};
use crate::training::{
    select_embedding, CaptionSampling, EpochLosses, LossTotals, SamplePair, StageRunner,
    TrainLoader, TrainerConfig, ValidLoader,
};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Trains the high-resolution pair on top of a frozen stage 1 generator.
///
/// The stage 1 generator lives on the inner backend: it records no gradients,
/// its batch norms use running statistics, and no optimizer ever sees it.
pub struct Stage2Trainer<B: AutodiffBackend> {
    stage1: GeneratorStage1<B::InnerBackend>,
    gan: StackGan2<B>,
    optimizers: GanOptimizers<B, GeneratorStage2<B>, Discriminator<B>>,
    learning_rates: LearningRates,
    sampling: CaptionSampling,
    noise_size: usize,
    real_label: f64,
    valid_real_label: f64,
    rng: RandomContext,
}

/// Per-batch inputs on backend `T`, with the stage 1 image still on the inner backend.
struct Stage2Draw<T: Backend, I: Backend> {
    embedding: Tensor<T, 2>,
    low_res: Tensor<I, 4>,
    epsilon: Tensor<T, 2>,
    images: Tensor<T, 4>,
    wrong_images: Tensor<T, 4>,
}

impl<B: AutodiffBackend> Stage2Trainer<B> {
    /// Resuming stage 2 from its own checkpoints is not supported, so
    /// `pretrained` must be `None`.
    pub fn new(
        gan: StackGan2<B>,
        stage1: GeneratorStage1<B::InnerBackend>,
        config: &TrainerConfig,
        learning_rates: LearningRates,
        pretrained: Option<EpochSelector>,
    ) -> Result<Self> {
        if pretrained.is_some() {
            return Err(StackGanError::unsupported(
                "resuming stage 2 from a pretrained checkpoint",
            ));
        }
        config.validate()?;
        if config.noise_size != stage1.noise_dim() {
            return Err(StackGanError::invalid_config(format!(
                "noise size {} does not match the stage 1 noise width {}",
                config.noise_size,
                stage1.noise_dim()
            )));
        }
        if stage1.image_size() != gan.generator.input_size() {
            return Err(StackGanError::invalid_config(format!(
                "stage 1 produces {}px images but stage 2 expects {}px",
                stage1.image_size(),
                gan.generator.input_size()
            )));
        }

        Ok(Self {
            stage1,
            gan,
            optimizers: GanOptimizers::new(),
            learning_rates,
            sampling: config.caption_sampling(),
            noise_size: config.noise_size,
            real_label: config.real_label,
            valid_real_label: config.valid_real_label,
            rng: RandomContext::seeded(config.seed),
        })
    }

    pub fn gan(&self) -> &StackGan2<B> {
        &self.gan
    }

    pub fn stage1_generator(&self) -> &GeneratorStage1<B::InnerBackend> {
        &self.stage1
    }

    /// Draw caption, noise and epsilons, and run the frozen stage 1 generator.
    fn draw<T: Backend>(
        &mut self,
        batch: StackGanBatch<T>,
        conditioning_dim: usize,
        lower: impl Fn(Tensor<T, 2>) -> Tensor<B::InnerBackend, 2>,
    ) -> Stage2Draw<T, B::InnerBackend> {
        let device = batch.images.device();
        let [batch_size, ..] = batch.images.dims();
        let embedding = select_embedding(batch.captions, &self.sampling, &mut self.rng);

        let inner_embedding = lower(embedding.clone());
        let inner_device = inner_embedding.device();
        let noise = self
            .rng
            .standard_normal([batch_size, self.noise_size], &inner_device);
        let stage1_epsilon = self
            .rng
            .standard_normal([batch_size, self.stage1.conditioning_dim()], &inner_device);
        let low_res = self
            .stage1
            .forward(inner_embedding, noise, stage1_epsilon)
            .images;

        let epsilon = self
            .rng
            .standard_normal([batch_size, conditioning_dim], &device);
        Stage2Draw {
            embedding,
            low_res,
            epsilon,
            images: batch.images,
            wrong_images: batch.wrong_images,
        }
    }
}

impl<T: Backend, I: Backend> Stage2Draw<T, I> {
    fn into_inputs(
        self,
        lift: impl Fn(Tensor<I, 4>) -> Tensor<T, 4>,
    ) -> StepInputs<T, Stage2Condition<T>> {
        StepInputs {
            condition: Stage2Condition {
                low_res: lift(self.low_res),
                embedding: self.embedding.clone(),
            },
            epsilon: self.epsilon,
            embedding: self.embedding,
            images: self.images,
            wrong_images: self.wrong_images,
        }
    }
}

impl<B: AutodiffBackend> StageRunner for Stage2Trainer<B> {
    type Backend = B;

    fn train_epoch(&mut self, loader: &TrainLoader<B>, epoch: usize) -> Result<EpochLosses> {
        let mut totals = LossTotals::default();
        let conditioning_dim = self.gan.generator.conditioning_dim();

        for (iteration, batch) in loader.iter().enumerate() {
            let inputs = self
                .draw(batch, conditioning_dim, |embedding| embedding.inner())
                .into_inputs(|low_res| Tensor::from_inner(low_res));
            let (gan, losses) = step::train_step(
                self.gan.clone(),
                &mut self.optimizers,
                self.learning_rates,
                inputs,
                self.real_label,
            )?;
            self.gan = gan;
            debug!(
                epoch,
                iteration,
                generator_loss = losses.generator_loss,
                discriminator_loss = losses.discriminator_loss,
                "stage 2 batch"
            );
            totals.add(&losses);
        }
        totals.mean("training")
    }

    fn valid_epoch(&mut self, loader: &ValidLoader<B>, _epoch: usize) -> Result<EpochLosses> {
        let generator = self.gan.generator.valid();
        let discriminator = self.gan.discriminator.valid();
        let conditioning_dim = generator.conditioning_dim();
        let mut totals = LossTotals::default();

        for batch in loader.iter() {
            let inputs = self
                .draw(batch, conditioning_dim, |embedding| embedding)
                .into_inputs(|low_res| low_res);
            let losses =
                step::valid_step(&generator, &discriminator, inputs, self.valid_real_label)?;
            totals.add(&losses);
        }
        totals.mean("validation")
    }

    fn learning_rates(&self) -> LearningRates {
        self.learning_rates
    }

    fn learning_rates_mut(&mut self) -> &mut LearningRates {
        &mut self.learning_rates
    }

    fn save_checkpoint(&self, stage_dir: &Path, epoch: usize) -> Result<PathBuf> {
        checkpoint::save_gan::<B, _, _>(&self.gan, stage_dir, epoch)
    }

    fn resumed_epoch(&self) -> Option<usize> {
        None
    }

    fn sample(
        &mut self,
        batch: &StackGanBatch<B::InnerBackend>,
    ) -> Result<SamplePair<B::InnerBackend>> {
        let generator = self.gan.generator.valid();
        let inputs = self
            .draw(batch.clone(), generator.conditioning_dim(), |embedding| embedding)
            .into_inputs(|low_res| low_res);
        let output = generator.forward(
            inputs.condition.low_res,
            inputs.condition.embedding,
            inputs.epsilon,
        );
        Ok((inputs.images, output.images))
    }
}
