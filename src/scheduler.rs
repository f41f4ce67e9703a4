use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Current learning rates of the two optimizers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub generator: f64,
    pub discriminator: f64,
}

/// Hook invoked by the trainer after each epoch's validation pass.
pub trait EpochCallback {
    fn on_epoch_end(&mut self, epoch: usize, learning_rates: &mut LearningRates);
}

/// Step decay applied to both learning rates.
#[derive(Config, Debug)]
pub struct LearningRateDecayConfig {
    #[config(default = 0.5)]
    pub decay_factor: f64,
    #[config(default = 100)]
    pub every_n: usize,
}

impl LearningRateDecayConfig {
    pub fn init(&self) -> LearningRateDecay {
        LearningRateDecay {
            decay_factor: self.decay_factor,
            every_n: self.every_n,
            last_decayed: None,
        }
    }
}

/// Multiplies both learning rates by `decay_factor` at every multiple of `every_n`.
#[derive(Clone, Debug)]
pub struct LearningRateDecay {
    decay_factor: f64,
    every_n: usize,
    last_decayed: Option<usize>,
}

impl EpochCallback for LearningRateDecay {
    fn on_epoch_end(&mut self, epoch: usize, learning_rates: &mut LearningRates) {
        if self.every_n == 0 || epoch == 0 || epoch % self.every_n != 0 {
            return;
        }
        if self.last_decayed == Some(epoch) {
            return;
        }
        learning_rates.generator *= self.decay_factor;
        learning_rates.discriminator *= self.decay_factor;
        self.last_decayed = Some(epoch);
        info!(
            epoch,
            generator_lr = learning_rates.generator,
            discriminator_lr = learning_rates.discriminator,
            "decayed learning rates"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rates(lr: f64) -> LearningRates {
        LearningRates {
            generator: lr,
            discriminator: lr,
        }
    }

    #[test]
    fn decays_only_on_multiples_of_the_period() {
        let mut decay = LearningRateDecayConfig::new().with_every_n(5).init();
        let mut lr = rates(1e-3);

        for epoch in 1..=4 {
            decay.on_epoch_end(epoch, &mut lr);
        }
        assert_eq!(lr, rates(1e-3));

        decay.on_epoch_end(5, &mut lr);
        assert_relative_eq!(lr.generator, 5e-4);
        assert_relative_eq!(lr.discriminator, 5e-4);

        for epoch in 6..=10 {
            decay.on_epoch_end(epoch, &mut lr);
        }
        assert_relative_eq!(lr.generator, 2.5e-4);
        assert_relative_eq!(lr.discriminator, 2.5e-4);
    }

    #[test]
    fn repeated_epoch_does_not_decay_twice() {
        let mut decay = LearningRateDecayConfig::new()
            .with_every_n(2)
            .with_decay_factor(0.1)
            .init();
        let mut lr = rates(1.0);
        decay.on_epoch_end(2, &mut lr);
        decay.on_epoch_end(2, &mut lr);
        assert_relative_eq!(lr.generator, 0.1);
    }

    #[test]
    fn zero_period_never_fires() {
        let mut decay = LearningRateDecayConfig::new().with_every_n(0).init();
        let mut lr = rates(1.0);
        for epoch in 0..10 {
            decay.on_epoch_end(epoch, &mut lr);
        }
        assert_eq!(lr, rates(1.0));
    }
}
