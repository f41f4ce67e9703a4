mod step;
pub mod stage1;
pub mod stage2;

pub use stage1::Stage1Trainer;
pub use stage2::Stage2Trainer;

use crate::data::StackGanBatch;
use crate::error::StackGanError;
use crate::rng::RandomContext;
use crate::scheduler::{EpochCallback, LearningRates};
use burn::data::dataloader::DataLoader;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const STATE_FILE: &str = "state.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

pub type TrainLoader<B> = Arc<dyn DataLoader<B, StackGanBatch<B>>>;
pub type ValidLoader<B> = Arc<
    dyn DataLoader<
        <B as AutodiffBackend>::InnerBackend,
        StackGanBatch<<B as AutodiffBackend>::InnerBackend>,
    >,
>;

/// Options common to both stage trainers.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    #[config(default = 64)]
    pub batch_size: usize,
    /// Stage directory receiving checkpoints, `state.json` and `metrics.jsonl`.
    #[config(default = "String::from(\"results\")")]
    pub save_location: String,
    #[config(default = 10)]
    pub save_every: usize,
    #[config(default = 1)]
    pub save_best_after: usize,
    #[config(default = 100)]
    pub noise_size: usize,
    /// Captions per image eligible for augmentation.
    #[config(default = 1)]
    pub num_embeddings: usize,
    /// Captions averaged into one embedding when augmenting.
    #[config(default = 4)]
    pub num_samples: usize,
    #[config(default = false)]
    pub augment: bool,
    /// Target for real images during training (one-sided label smoothing).
    #[config(default = 0.9)]
    pub real_label: f64,
    #[config(default = 1.0)]
    pub valid_real_label: f64,
    #[config(default = 1234)]
    pub seed: u64,
}

impl TrainerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(StackGanError::invalid_config("batch size must be positive"));
        }
        if self.save_every == 0 {
            return Err(StackGanError::invalid_config("save_every must be positive"));
        }
        if self.num_embeddings == 0 {
            return Err(StackGanError::invalid_config("num_embeddings must be positive"));
        }
        if self.augment && self.num_samples == 0 {
            return Err(StackGanError::invalid_config(
                "num_samples must be positive when augmenting captions",
            ));
        }
        for (name, label) in [
            ("real_label", self.real_label),
            ("valid_real_label", self.valid_real_label),
        ] {
            if !(0.5..=1.0).contains(&label) {
                return Err(StackGanError::invalid_config(format!(
                    "{name} must lie in [0.5, 1], found {label}"
                )));
            }
        }
        Ok(())
    }

    pub fn stage_dir(&self) -> PathBuf {
        PathBuf::from(&self.save_location)
    }

    pub fn caption_sampling(&self) -> CaptionSampling {
        CaptionSampling {
            augment: self.augment,
            num_embeddings: self.num_embeddings,
            num_samples: self.num_samples,
        }
    }
}

/// How one embedding is drawn from an image's captions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptionSampling {
    pub augment: bool,
    pub num_embeddings: usize,
    pub num_samples: usize,
}

/// Reduce `[N, captions, D]` caption embeddings to one `[N, D]` embedding.
///
/// Without augmentation the first caption is used. With augmentation the mean of
/// `num_samples` distinct captions drawn among the first `num_embeddings` is used.
pub fn select_embedding<B: Backend>(
    captions: Tensor<B, 3>,
    sampling: &CaptionSampling,
    rng: &mut RandomContext,
) -> Tensor<B, 2> {
    let [batch, num_captions, dim] = captions.dims();
    if !sampling.augment || num_captions <= 1 {
        return captions.slice_dim(1, 0..1).reshape([batch, dim]);
    }

    let eligible = sampling.num_embeddings.clamp(1, num_captions);
    let picks: Vec<i64> = rng
        .distinct_indices(eligible, sampling.num_samples)
        .into_iter()
        .map(|idx| idx as i64)
        .collect();
    let count = picks.len();
    let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(picks, [count]), &captions.device());
    captions
        .select(1, indices)
        .mean_dim(1)
        .reshape([batch, dim])
}

/// Lifecycle of a [`Trainer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerPhase {
    Initialized,
    TrainingEpoch,
    ValidatingEpoch,
    Checkpointed,
    Completed,
    Failed,
}

/// Mean losses of one pass over a loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub generator_loss: f64,
    pub discriminator_loss: f64,
    pub kl_loss: f64,
    pub discriminator_real_loss: f64,
    pub discriminator_wrong_loss: f64,
    pub discriminator_fake_loss: f64,
}

#[derive(Debug, Default)]
pub(crate) struct LossTotals {
    sum: EpochLosses,
    batches: usize,
}

impl LossTotals {
    pub(crate) fn add(&mut self, losses: &EpochLosses) {
        self.sum.generator_loss += losses.generator_loss;
        self.sum.discriminator_loss += losses.discriminator_loss;
        self.sum.kl_loss += losses.kl_loss;
        self.sum.discriminator_real_loss += losses.discriminator_real_loss;
        self.sum.discriminator_wrong_loss += losses.discriminator_wrong_loss;
        self.sum.discriminator_fake_loss += losses.discriminator_fake_loss;
        self.batches += 1;
    }

    pub(crate) fn mean(&self, pass: &'static str) -> crate::Result<EpochLosses> {
        if self.batches == 0 {
            return Err(StackGanError::EmptyEpoch(pass));
        }
        let n = self.batches as f64;
        Ok(EpochLosses {
            generator_loss: self.sum.generator_loss / n,
            discriminator_loss: self.sum.discriminator_loss / n,
            kl_loss: self.sum.kl_loss / n,
            discriminator_real_loss: self.sum.discriminator_real_loss / n,
            discriminator_wrong_loss: self.sum.discriminator_wrong_loss / n,
            discriminator_fake_loss: self.sum.discriminator_fake_loss / n,
        })
    }
}

/// What happened in one epoch, as written to `metrics.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochLosses,
    pub valid: EpochLosses,
    pub learning_rates: LearningRates,
    pub checkpointed: bool,
}

/// Resume bookkeeping persisted as `state.json` with every checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch (0 before the first one).
    pub epoch: usize,
    pub best_valid_loss: Option<f64>,
    pub learning_rates: LearningRates,
    pub history: Vec<EpochRecord>,
}

impl TrainingState {
    pub fn new(learning_rates: LearningRates) -> Self {
        Self {
            epoch: 0,
            best_valid_loss: None,
            learning_rates,
            history: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> crate::Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Append-only JSON-lines log of [`EpochRecord`]s.
#[derive(Clone, Debug)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, record: &EpochRecord) -> crate::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Drop records past `epoch`, left behind by a run that outlived its last checkpoint.
    pub fn retain_through(&self, epoch: usize) -> crate::Result<()> {
        if !self.path.is_file() {
            return Ok(());
        }
        let records = Self::read(&self.path)?;
        let mut kept = String::new();
        for record in records.iter().filter(|record| record.epoch <= epoch) {
            kept.push_str(&serde_json::to_string(record)?);
            kept.push('\n');
        }
        if records.len() != kept.lines().count() {
            warn!(epoch, "discarding metrics logged after the restored checkpoint");
        }
        fs::write(&self.path, kept)?;
        Ok(())
    }

    pub fn read(path: &Path) -> crate::Result<Vec<EpochRecord>> {
        let contents = fs::read_to_string(path)?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StackGanError::from))
            .collect()
    }
}

/// Real images next to generated ones, on the inner backend.
pub type SamplePair<B> = (Tensor<B, 4>, Tensor<B, 4>);

/// Per-stage training work driven by [`Trainer`].
pub trait StageRunner {
    type Backend: AutodiffBackend;

    /// One pass over the training loader with alternating updates.
    fn train_epoch(
        &mut self,
        loader: &TrainLoader<Self::Backend>,
        epoch: usize,
    ) -> crate::Result<EpochLosses>;

    /// One gradient-free pass over the validation loader.
    fn valid_epoch(
        &mut self,
        loader: &ValidLoader<Self::Backend>,
        epoch: usize,
    ) -> crate::Result<EpochLosses>;

    fn learning_rates(&self) -> LearningRates;

    fn learning_rates_mut(&mut self) -> &mut LearningRates;

    /// Write the trainable networks under `model_<epoch>`.
    fn save_checkpoint(&self, stage_dir: &Path, epoch: usize) -> crate::Result<PathBuf>;

    /// Epoch restored from a checkpoint at construction, if any.
    fn resumed_epoch(&self) -> Option<usize>;

    /// Generate images for `batch` without touching any weights.
    fn sample(
        &mut self,
        batch: &StackGanBatch<<Self::Backend as AutodiffBackend>::InnerBackend>,
    ) -> crate::Result<SamplePair<<Self::Backend as AutodiffBackend>::InnerBackend>>;
}

/// Drives a [`StageRunner`] through epochs, callbacks and checkpoints.
pub struct Trainer<R: StageRunner> {
    runner: R,
    config: TrainerConfig,
    callbacks: Vec<Box<dyn EpochCallback>>,
    state: TrainingState,
    phase: TrainerPhase,
}

impl<R: StageRunner> Trainer<R> {
    pub fn new(mut runner: R, config: TrainerConfig) -> crate::Result<Self> {
        config.validate()?;
        let state_path = config.stage_dir().join(STATE_FILE);

        let state = match runner.resumed_epoch() {
            Some(epoch) => {
                let state = match TrainingState::load(&state_path)? {
                    Some(saved) if saved.epoch == epoch => saved,
                    Some(saved) => {
                        warn!(
                            saved = saved.epoch,
                            restored = epoch,
                            "state file does not match the restored checkpoint, starting fresh bookkeeping"
                        );
                        TrainingState {
                            epoch,
                            ..TrainingState::new(runner.learning_rates())
                        }
                    }
                    None => TrainingState {
                        epoch,
                        ..TrainingState::new(runner.learning_rates())
                    },
                };
                *runner.learning_rates_mut() = state.learning_rates;
                info!(epoch, "resuming training");
                state
            }
            None => TrainingState::new(runner.learning_rates()),
        };

        Ok(Self {
            runner,
            config,
            callbacks: Vec::new(),
            state,
            phase: TrainerPhase::Initialized,
        })
    }

    pub fn with_callback(mut self, callback: impl EpochCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Train until `num_epochs` epochs (1-based, counting resumed ones) are done.
    ///
    /// Any error leaves the trainer in [`TrainerPhase::Failed`].
    pub fn fit(
        &mut self,
        train: &TrainLoader<R::Backend>,
        valid: &ValidLoader<R::Backend>,
        num_epochs: usize,
    ) -> crate::Result<&TrainingState> {
        match self.run_epochs(train, valid, num_epochs) {
            Ok(()) => {
                self.phase = TrainerPhase::Completed;
                Ok(&self.state)
            }
            Err(err) => {
                self.phase = TrainerPhase::Failed;
                error!(epoch = self.state.epoch + 1, "training failed: {err}");
                Err(err)
            }
        }
    }

    fn run_epochs(
        &mut self,
        train: &TrainLoader<R::Backend>,
        valid: &ValidLoader<R::Backend>,
        num_epochs: usize,
    ) -> crate::Result<()> {
        let stage_dir = self.config.stage_dir();
        fs::create_dir_all(&stage_dir)?;
        let metrics = MetricsLog::new(stage_dir.join(METRICS_FILE));
        metrics.retain_through(self.state.epoch)?;

        for epoch in (self.state.epoch + 1)..=num_epochs {
            self.phase = TrainerPhase::TrainingEpoch;
            let train_losses = self.runner.train_epoch(train, epoch)?;

            self.phase = TrainerPhase::ValidatingEpoch;
            let valid_losses = self.runner.valid_epoch(valid, epoch)?;

            for callback in self.callbacks.iter_mut() {
                callback.on_epoch_end(epoch, self.runner.learning_rates_mut());
            }

            let improved = epoch >= self.config.save_best_after
                && self
                    .state
                    .best_valid_loss
                    .map_or(true, |best| valid_losses.generator_loss < best);
            if improved {
                self.state.best_valid_loss = Some(valid_losses.generator_loss);
            }
            let checkpoint = improved || epoch % self.config.save_every == 0;

            let record = EpochRecord {
                epoch,
                train: train_losses,
                valid: valid_losses,
                learning_rates: self.runner.learning_rates(),
                checkpointed: checkpoint,
            };
            self.state.epoch = epoch;
            self.state.learning_rates = record.learning_rates;
            self.state.history.push(record.clone());
            metrics.append(&record)?;

            info!(
                epoch,
                train_generator_loss = train_losses.generator_loss,
                train_discriminator_loss = train_losses.discriminator_loss,
                valid_generator_loss = valid_losses.generator_loss,
                valid_discriminator_loss = valid_losses.discriminator_loss,
                kl_loss = train_losses.kl_loss,
                "epoch finished"
            );

            if checkpoint {
                let dir = self.runner.save_checkpoint(&stage_dir, epoch)?;
                self.state.save(&stage_dir.join(STATE_FILE))?;
                self.phase = TrainerPhase::Checkpointed;
                info!(epoch, improved, dir = %dir.display(), "saved checkpoint");
            }
        }
        Ok(())
    }

    /// Generate images for the first batch of `loader`, keeping at most `limit`.
    pub fn sample(
        &mut self,
        loader: &ValidLoader<R::Backend>,
        limit: usize,
    ) -> crate::Result<Option<SamplePair<<R::Backend as AutodiffBackend>::InnerBackend>>> {
        let Some(batch) = loader.iter().next() else {
            return Ok(None);
        };
        let (real, fake) = self.runner.sample(&batch)?;
        let keep = limit.min(real.dims()[0]);
        Ok(Some((
            real.slice_dim(0, 0..keep),
            fake.slice_dim(0, 0..keep),
        )))
    }
}
