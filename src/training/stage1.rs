use crate::checkpoint::{self, EpochSelector};
use crate::data::StackGanBatch;
use crate::error::{Result, StackGanError};
use crate::model::{Discriminator, GeneratorStage1, StackGan1, Stage1Condition};
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
use tracing::{debug, info};

/// Trains the low-resolution generator/discriminator pair.
pub struct Stage1Trainer<B: AutodiffBackend> {
    gan: StackGan1<B>,
    optimizers: GanOptimizers<B, GeneratorStage1<B>, Discriminator<B>>,
    learning_rates: LearningRates,
    sampling: CaptionSampling,
    noise_size: usize,
    real_label: f64,
    valid_real_label: f64,
    rng: RandomContext,
    resumed_epoch: Option<usize>,
}

impl<B: AutodiffBackend> Stage1Trainer<B> {
    /// With `pretrained`, the pair is restored from the stage directory named
    /// by `config.save_location`.
    pub fn new(
        gan: StackGan1<B>,
        config: &TrainerConfig,
        learning_rates: LearningRates,
        pretrained: Option<EpochSelector>,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if config.noise_size != gan.generator.noise_dim() {
            return Err(StackGanError::invalid_config(format!(
                "noise size {} does not match the generator's noise width {}",
                config.noise_size,
                gan.generator.noise_dim()
            )));
        }

        let (gan, resumed_epoch) = match pretrained {
            Some(selector) => {
                let (gan, epoch) =
                    checkpoint::load_gan::<B, _, _>(gan, &config.stage_dir(), selector, device)?;
                info!(epoch, "restored stage 1 networks");
                (gan, Some(epoch))
            }
            None => (gan, None),
        };

        Ok(Self {
            gan,
            optimizers: GanOptimizers::new(),
            learning_rates,
            sampling: config.caption_sampling(),
            noise_size: config.noise_size,
            real_label: config.real_label,
            valid_real_label: config.valid_real_label,
            rng: RandomContext::seeded(config.seed),
            resumed_epoch,
        })
    }

    pub fn gan(&self) -> &StackGan1<B> {
        &self.gan
    }

    fn inputs<T: Backend>(
        &mut self,
        batch: StackGanBatch<T>,
        conditioning_dim: usize,
    ) -> StepInputs<T, Stage1Condition<T>> {
        let device = batch.images.device();
        let [batch_size, ..] = batch.images.dims();
        let embedding = select_embedding(batch.captions, &self.sampling, &mut self.rng);
        let noise = self
            .rng
            .standard_normal([batch_size, self.noise_size], &device);
        let epsilon = self
            .rng
            .standard_normal([batch_size, conditioning_dim], &device);
        StepInputs {
            condition: Stage1Condition {
                embedding: embedding.clone(),
                noise,
            },
            epsilon,
            embedding,
            images: batch.images,
            wrong_images: batch.wrong_images,
        }
    }
}

impl<B: AutodiffBackend> StageRunner for Stage1Trainer<B> {
    type Backend = B;

    fn train_epoch(&mut self, loader: &TrainLoader<B>, epoch: usize) -> Result<EpochLosses> {
        let mut totals = LossTotals::default();
        let conditioning_dim = self.gan.generator.conditioning_dim();

        for (iteration, batch) in loader.iter().enumerate() {
            let inputs = self.inputs(batch, conditioning_dim);
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
                "stage 1 batch"
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
            let inputs = self.inputs(batch, conditioning_dim);
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
        self.resumed_epoch
    }

    fn sample(
        &mut self,
        batch: &StackGanBatch<B::InnerBackend>,
    ) -> Result<SamplePair<B::InnerBackend>> {
        let generator = self.gan.generator.valid();
        let inputs = self.inputs(batch.clone(), generator.conditioning_dim());
        let output = generator.forward(
            inputs.condition.embedding,
            inputs.condition.noise,
            inputs.epsilon,
        );
        Ok((inputs.images, output.images))
    }
}
