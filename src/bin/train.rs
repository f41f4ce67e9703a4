#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::prelude::Backend as _;
use clap::Parser;
use stackgan_burn::checkpoint::{self, EpochSelector};
use stackgan_burn::config::ExperimentConfig;
use stackgan_burn::data::{build_loader, DataConfig, TextImageDataset};
use stackgan_burn::training::{
    Stage1Trainer, Stage2Trainer, StageRunner, TrainLoader, Trainer, ValidLoader,
};
use stackgan_burn::utils::save_comparison;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "wgpu")]
type Backend = burn::backend::Wgpu<f32, i32>;
#[cfg(not(feature = "wgpu"))]
type Backend = burn::backend::NdArray<f32>;
type TrainBackend = Autodiff<Backend>;

#[derive(Parser, Debug)]
#[command(about = "Train StackGAN with Burn")]
struct Args {
    /// Name of the model, used for saving and loading.
    name: String,
    /// Which stage to train.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    stage: u8,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long, default_value = "results")]
    results_root: PathBuf,
    /// Overrides `num_epochs` from the config file.
    #[arg(short = 'e', long)]
    num_epochs: Option<usize>,
    /// Resume from a saved checkpoint of this stage.
    #[arg(long)]
    use_pretrained: bool,
    /// Checkpointed epoch to load; -1 loads the most recent.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    epoch_num: i64,
    /// Save a real-vs-generated comparison after training.
    #[arg(long)]
    visualise: bool,
    #[arg(short = 'i', long, default_value_t = 16)]
    images_to_generate: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let stage = args.stage as usize;
    let pretrained = checkpoint::resume_selector(stage, args.use_pretrained, args.epoch_num)?;

    let mut config = ExperimentConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(num_epochs) = args.num_epochs {
        config.num_epochs = num_epochs;
    }

    let stage_dir = checkpoint::stage_dir(&args.results_root, &args.name, stage);
    std::fs::create_dir_all(&stage_dir)
        .with_context(|| format!("failed to create {}", stage_dir.display()))?;
    config.trainer.save_location = stage_dir.display().to_string();
    config.save(stage_dir.join("config.json"))?;

    let device = <Backend as burn::tensor::backend::Backend>::Device::default();
    TrainBackend::seed(&device, config.trainer.seed);

    let data_config = config.data_config(stage)?;
    let data_dir = resolve_data_dir(&args.config, &config.data_dir);
    let (train, valid) = load_loaders(&config, data_config, &data_dir, &device)?;

    let learning_rates = config.learning_rates();
    match stage {
        1 => {
            let gan = config.model.init_stage1::<TrainBackend>(&device)?;
            let runner =
                Stage1Trainer::new(gan, &config.trainer, learning_rates, pretrained, &device)?;
            run(runner, &config, &train, &valid, &args, &stage_dir)
        }
        _ => {
            let stage1_dir = checkpoint::stage_dir(&args.results_root, &args.name, 1);
            let (stage1, stage1_epoch) = checkpoint::load_stage1_generator::<Backend>(
                &config.model,
                &stage1_dir,
                EpochSelector::from_epoch_num(args.epoch_num)?,
                &device,
            )?;
            info!(epoch = stage1_epoch, dir = %stage1_dir.display(), "loaded stage 1 generator");

            let gan = config.model.init_stage2::<TrainBackend>(&device)?;
            let runner =
                Stage2Trainer::new(gan, stage1, &config.trainer, learning_rates, pretrained)?;
            run(runner, &config, &train, &valid, &args, &stage_dir)
        }
    }
}

fn run<R: StageRunner<Backend = TrainBackend>>(
    runner: R,
    config: &ExperimentConfig,
    train: &TrainLoader<TrainBackend>,
    valid: &ValidLoader<TrainBackend>,
    args: &Args,
    stage_dir: &Path,
) -> Result<()> {
    let mut trainer =
        Trainer::new(runner, config.trainer.clone())?.with_callback(config.lr_decay.init());
    let state = trainer.fit(train, valid, config.num_epochs)?;
    info!(
        epoch = state.epoch,
        best_valid_loss = ?state.best_valid_loss,
        "training complete"
    );

    if args.visualise {
        let epoch = trainer.state().epoch;
        match trainer.sample(valid, args.images_to_generate)? {
            Some((real, fake)) => {
                let path = stage_dir
                    .join("samples")
                    .join(format!("comparison_{epoch}.png"));
                save_comparison(real, fake, &path)?;
                info!(path = %path.display(), "saved comparison");
            }
            None => info!("validation set is empty, nothing to visualise"),
        }
    }
    Ok(())
}

fn load_loaders(
    config: &ExperimentConfig,
    data_config: DataConfig,
    data_dir: &Path,
    device: &<Backend as burn::tensor::backend::Backend>::Device,
) -> Result<(TrainLoader<TrainBackend>, ValidLoader<TrainBackend>)> {
    let train_path = data_dir.join("train.pickle");
    let valid_path = data_dir.join("valid.pickle");
    let train_set = TextImageDataset::from_pickle(&train_path, &data_config)
        .with_context(|| format!("failed to load {}", train_path.display()))?;
    let valid_set = TextImageDataset::from_pickle(&valid_path, &data_config)
        .with_context(|| format!("failed to load {}", valid_path.display()))?;

    for set in [&train_set, &valid_set] {
        if set.embedding_dim() != config.model.embedding_dim {
            anyhow::bail!(
                "caption embeddings have width {}, the model expects {}",
                set.embedding_dim(),
                config.model.embedding_dim
            );
        }
    }
    info!(
        train = burn::data::dataset::Dataset::len(&train_set),
        valid = burn::data::dataset::Dataset::len(&valid_set),
        "loaded examples"
    );

    let seed = config.trainer.seed;
    let batch_size = config.trainer.batch_size;
    let train = build_loader::<TrainBackend>(train_set, data_config, batch_size, seed, true, device);
    let valid = build_loader::<Backend>(valid_set, data_config, batch_size, seed, false, device);
    Ok((train, valid))
}

/// Resolve `data_dir` relative to the directory holding the config file.
fn resolve_data_dir(config_path: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        config_path
            .parent()
            .map(|parent| parent.join(&candidate))
            .unwrap_or(candidate)
    } else {
        candidate
    }
}
