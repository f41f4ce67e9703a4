#![recursion_limit = "256"]
use approx::assert_relative_eq;
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module, ModuleVisitor, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use stackgan_burn::checkpoint::{self, EpochSelector};
use stackgan_burn::data::{build_loader, DataConfig, TextImageDataset, TextImageExample};
use stackgan_burn::model::{GeneratorStage1, StackGanConfig};
use stackgan_burn::scheduler::{LearningRateDecayConfig, LearningRates};
use stackgan_burn::training::{
    MetricsLog, Stage1Trainer, Stage2Trainer, TrainLoader, Trainer, TrainerConfig, TrainerPhase,
    TrainingState, ValidLoader, METRICS_FILE, STATE_FILE,
};
use stackgan_burn::StackGanError;
use std::f64::consts::LN_2;
use std::path::Path;

type Inner = NdArray<f32>;
type TestBackend = Autodiff<Inner>;

const EMBEDDING_DIM: usize = 6;
const NOISE_DIM: usize = 4;

fn model_config(initializer: Initializer) -> StackGanConfig {
    StackGanConfig::new()
        .with_embedding_dim(EMBEDDING_DIM)
        .with_conditioning_dim(3)
        .with_noise_dim(NOISE_DIM)
        .with_gf_dim(4)
        .with_df_dim(2)
        .with_embedding_projection_dim(3)
        .with_small_image_size(8)
        .with_large_image_size(16)
        .with_stage2_downsamples(1)
        .with_stage2_residuals(1)
        .with_initializer(initializer)
}

fn trainer_config(stage_dir: &Path) -> TrainerConfig {
    TrainerConfig::new()
        .with_batch_size(2)
        .with_noise_size(NOISE_DIM)
        .with_save_every(1)
        .with_save_location(stage_dir.display().to_string())
        .with_seed(42)
}

fn learning_rates() -> LearningRates {
    LearningRates {
        generator: 2e-4,
        discriminator: 2e-4,
    }
}

fn dataset(count: usize, config: &DataConfig) -> TextImageDataset {
    let pixels = config.channels * (config.image_size as usize).pow(2);
    let examples = (0..count)
        .map(|idx| {
            let shade = idx as f32 / count as f32 - 0.5;
            TextImageExample {
                embeddings: vec![
                    vec![shade; EMBEDDING_DIM],
                    vec![-shade; EMBEDDING_DIM],
                ],
                image: (0..pixels)
                    .map(|p| (shade + p as f32 * 0.01).clamp(-1.0, 1.0))
                    .collect(),
                label: Some(idx as i64),
            }
        })
        .collect();
    TextImageDataset::new(examples, config).unwrap()
}

fn loaders(
    image_size: u32,
    count: usize,
) -> (TrainLoader<TestBackend>, ValidLoader<TestBackend>) {
    let device = Default::default();
    let config = DataConfig {
        image_size,
        channels: 3,
    };
    let train = build_loader::<TestBackend>(dataset(count, &config), config, 2, 7, true, &device);
    let valid = build_loader::<Inner>(dataset(count, &config), config, 2, 7, false, &device);
    (train, valid)
}

fn stage1_trainer(
    model: &StackGanConfig,
    config: &TrainerConfig,
    pretrained: Option<EpochSelector>,
) -> Trainer<Stage1Trainer<TestBackend>> {
    let device = Default::default();
    let gan = model.init_stage1::<TestBackend>(&device).unwrap();
    let runner = Stage1Trainer::new(gan, config, learning_rates(), pretrained, &device).unwrap();
    Trainer::new(runner, config.clone()).unwrap()
}

#[derive(Default)]
struct ParamCollector {
    values: Vec<Vec<f32>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.values
            .push(param.val().into_data().convert::<f32>().to_vec::<f32>().unwrap());
    }
}

fn params(generator: &GeneratorStage1<Inner>) -> Vec<Vec<f32>> {
    let mut collector = ParamCollector::default();
    generator.visit(&mut collector);
    collector.values
}

#[test]
fn untrained_discriminator_starts_at_chance() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config(&dir.path().join("stage-1"));
    let mut trainer = stage1_trainer(&model_config(Initializer::Zeros), &config, None);
    // A single batch per epoch, so the epoch mean is the first step.
    let (train, valid) = loaders(8, 2);

    let state = trainer.fit(&train, &valid, 1).unwrap();
    let first = state.history[0].train;
    assert_relative_eq!(first.discriminator_real_loss, LN_2, epsilon = 1e-5);
    assert_relative_eq!(first.discriminator_wrong_loss, LN_2, epsilon = 1e-5);
    assert_relative_eq!(first.discriminator_fake_loss, LN_2, epsilon = 1e-5);
    assert_relative_eq!(first.discriminator_loss, 2.0 * LN_2, epsilon = 1e-5);
    assert_relative_eq!(first.kl_loss, 0.0, epsilon = 1e-6);
    // Scored by the discriminator before its update, so the logits are still zero.
    assert_relative_eq!(first.generator_loss, LN_2, epsilon = 1e-6);
    assert!(state.history[0].valid.generator_loss.is_finite());
    assert_eq!(trainer.phase(), TrainerPhase::Completed);
}

#[test]
fn same_seed_gives_same_losses() {
    let run = || {
        let dir = tempfile::tempdir().unwrap();
        let config = trainer_config(&dir.path().join("stage-1"));
        let model = model_config(Initializer::Constant { value: 0.05 });
        let mut trainer = stage1_trainer(&model, &config, None);
        let (train, valid) = loaders(8, 4);
        trainer.fit(&train, &valid, 2).unwrap().history.clone()
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert_relative_eq!(a.train.generator_loss, b.train.generator_loss, epsilon = 1e-6);
        assert_relative_eq!(
            a.train.discriminator_loss,
            b.train.discriminator_loss,
            epsilon = 1e-6
        );
        assert_relative_eq!(a.valid.generator_loss, b.valid.generator_loss, epsilon = 1e-6);
    }
}

#[test]
fn checkpoints_state_and_metrics_support_resuming() {
    let dir = tempfile::tempdir().unwrap();
    let stage_dir = dir.path().join("stage-1");
    let config = trainer_config(&stage_dir);
    let model = model_config(Initializer::Constant { value: 0.05 });
    let (train, valid) = loaders(8, 4);

    let mut trainer = stage1_trainer(&model, &config, None);
    trainer.fit(&train, &valid, 2).unwrap();

    assert!(checkpoint::model_dir(&stage_dir, 1).is_dir());
    assert!(checkpoint::model_dir(&stage_dir, 2).is_dir());
    assert_eq!(checkpoint::latest_epoch(&stage_dir).unwrap(), 2);
    let saved = TrainingState::load(&stage_dir.join(STATE_FILE))
        .unwrap()
        .unwrap();
    assert_eq!(saved.epoch, 2);
    assert_eq!(saved.history.len(), 2);
    assert!(saved.history.iter().all(|record| record.checkpointed));

    let mut resumed = stage1_trainer(&model, &config, Some(EpochSelector::Latest));
    assert_eq!(resumed.state().epoch, 2);
    let state = resumed.fit(&train, &valid, 3).unwrap();
    assert_eq!(state.epoch, 3);
    assert_eq!(state.history.len(), 3);

    let records = MetricsLog::read(&stage_dir.join(METRICS_FILE)).unwrap();
    let epochs: Vec<usize> = records.iter().map(|record| record.epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3]);
}

#[test]
fn decay_callback_updates_recorded_learning_rates() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config(&dir.path().join("stage-1"));
    let mut trainer = stage1_trainer(&model_config(Initializer::Zeros), &config, None)
        .with_callback(LearningRateDecayConfig::new().with_every_n(1).init());
    let (train, valid) = loaders(8, 2);

    let state = trainer.fit(&train, &valid, 2).unwrap();
    assert_relative_eq!(state.history[0].learning_rates.generator, 1e-4);
    assert_relative_eq!(state.history[1].learning_rates.discriminator, 5e-5);
    assert_relative_eq!(state.learning_rates.generator, 5e-5);
}

#[test]
fn mismatched_image_size_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config(&dir.path().join("stage-1"));
    let mut trainer = stage1_trainer(&model_config(Initializer::Zeros), &config, None);
    // The generator produces 8px images.
    let (train, valid) = loaders(4, 2);

    let err = trainer.fit(&train, &valid, 1).unwrap_err();
    assert!(matches!(err, StackGanError::ShapeMismatch { .. }));
    assert_eq!(trainer.phase(), TrainerPhase::Failed);
}

#[test]
fn stage2_leaves_stage1_untouched() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let model = model_config(Initializer::Constant { value: 0.05 });
    let config = trainer_config(&dir.path().join("stage-2"));

    let stage1 = model.init_stage1::<Inner>(&device).unwrap().generator;
    let before = params(&stage1);
    let gan = model.init_stage2::<TestBackend>(&device).unwrap();
    let runner = Stage2Trainer::new(gan, stage1, &config, learning_rates(), None).unwrap();
    let mut trainer = Trainer::new(runner, config.clone()).unwrap();
    let (train, valid) = loaders(16, 2);

    let state = trainer.fit(&train, &valid, 1).unwrap();
    assert!(state.history[0].train.discriminator_loss.is_finite());
    assert_eq!(params(trainer.runner().stage1_generator()), before);

    let (real, fake) = trainer.sample(&valid, 1).unwrap().unwrap();
    assert_eq!(real.dims(), [1, 3, 16, 16]);
    assert_eq!(fake.dims(), [1, 3, 16, 16]);
}

#[test]
fn stage2_refuses_pretrained_resume() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let model = model_config(Initializer::Zeros);
    let config = trainer_config(&dir.path().join("stage-2"));

    let stage1 = model.init_stage1::<Inner>(&device).unwrap().generator;
    let gan = model.init_stage2::<TestBackend>(&device).unwrap();
    let result = Stage2Trainer::new(
        gan,
        stage1,
        &config,
        learning_rates(),
        Some(EpochSelector::Latest),
    );
    assert!(matches!(result, Err(StackGanError::Unsupported(_))));
}

#[test]
fn stage1_generator_reloads_for_stage2() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let stage_dir = dir.path().join("stage-1");
    let model = model_config(Initializer::Constant { value: 0.05 });
    let config = trainer_config(&stage_dir);

    let mut trainer = stage1_trainer(&model, &config, None);
    let (train, valid) = loaders(8, 2);
    trainer.fit(&train, &valid, 1).unwrap();

    let (generator, epoch) =
        checkpoint::load_stage1_generator::<Inner>(&model, &stage_dir, EpochSelector::Latest, &device)
            .unwrap();
    assert_eq!(epoch, 1);
    assert_eq!(
        params(&generator),
        params(&trainer.runner().gan().generator.valid())
    );
}

#[test]
fn best_validation_epochs_are_checkpointed_between_periods() {
    let dir = tempfile::tempdir().unwrap();
    let stage_dir = dir.path().join("stage-1");
    let config = trainer_config(&stage_dir)
        .with_save_every(100)
        .with_save_best_after(2);
    let model = model_config(Initializer::Constant { value: 0.05 });
    let mut trainer = stage1_trainer(&model, &config, None);
    let (train, valid) = loaders(8, 4);

    let state = trainer.fit(&train, &valid, 4).unwrap().clone();
    assert!(!checkpoint::model_dir(&stage_dir, 1).exists());
    assert!(!state.history[0].checkpointed);
    // The first eligible epoch always sets the best loss.
    assert!(state.history[1].checkpointed);

    let mut best = f64::INFINITY;
    for record in &state.history[1..] {
        let improved = record.valid.generator_loss < best;
        if improved {
            best = record.valid.generator_loss;
        }
        assert_eq!(record.checkpointed, improved, "epoch {}", record.epoch);
        assert_eq!(
            checkpoint::model_dir(&stage_dir, record.epoch).is_dir(),
            improved,
            "epoch {}",
            record.epoch
        );
    }
    assert_eq!(state.best_valid_loss, Some(best));
    let saved = TrainingState::load(&stage_dir.join(STATE_FILE))
        .unwrap()
        .unwrap();
    assert_eq!(saved.best_valid_loss, Some(best));
}

#[test]
fn resuming_discards_metrics_logged_after_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let stage_dir = dir.path().join("stage-1");
    let config = trainer_config(&stage_dir)
        .with_save_every(2)
        .with_save_best_after(100);
    let model = model_config(Initializer::Constant { value: 0.05 });
    let (train, valid) = loaders(8, 2);

    let mut trainer = stage1_trainer(&model, &config, None);
    trainer.fit(&train, &valid, 3).unwrap();
    assert_eq!(checkpoint::latest_epoch(&stage_dir).unwrap(), 2);

    let mut resumed = stage1_trainer(&model, &config, Some(EpochSelector::Latest));
    assert_eq!(resumed.state().epoch, 2);
    resumed.fit(&train, &valid, 4).unwrap();

    let epochs: Vec<usize> = MetricsLog::read(&stage_dir.join(METRICS_FILE))
        .unwrap()
        .iter()
        .map(|record| record.epoch)
        .collect();
    assert_eq!(epochs, vec![1, 2, 3, 4]);
}
