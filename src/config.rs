use crate::data::DataConfig;
use crate::model::StackGanConfig;
use crate::scheduler::{LearningRateDecayConfig, LearningRates};
use crate::training::TrainerConfig;
use burn::prelude::*;

/// Everything needed to run one stage, loaded from `config.json`.
#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub model: StackGanConfig,
    pub trainer: TrainerConfig,
    pub lr_decay: LearningRateDecayConfig,
    /// Directory holding `train.pickle` and `valid.pickle`.
    pub data_dir: String,
    #[config(default = 600)]
    pub num_epochs: usize,
    #[config(default = 2e-4)]
    pub generator_lr: f64,
    #[config(default = 2e-4)]
    pub discriminator_lr: f64,
}

impl ExperimentConfig {
    pub fn learning_rates(&self) -> LearningRates {
        LearningRates {
            generator: self.generator_lr,
            discriminator: self.discriminator_lr,
        }
    }

    /// Image decoding settings for `stage`.
    pub fn data_config(&self, stage: usize) -> crate::Result<DataConfig> {
        Ok(DataConfig {
            image_size: self.model.image_size(stage)? as u32,
            channels: self.model.image_channels,
        })
    }
}
