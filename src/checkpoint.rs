use crate::error::{Result, StackGanError};
use crate::model::{ConditionalGan, GeneratorStage1, StackGanConfig};
use burn::module::Module;
use burn::prelude::*;
use burn::record::{FileRecorder, FullPrecisionSettings, NamedMpkFileRecorder};
use std::fs;
use std::path::{Path, PathBuf};

const GENERATOR: &str = "generator";
const DISCRIMINATOR: &str = "discriminator";

/// Which saved epoch to restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochSelector {
    Latest,
    Epoch(usize),
}

impl EpochSelector {
    /// `-1` selects the most recent epoch; positive values select that epoch.
    pub fn from_epoch_num(epoch_num: i64) -> Result<Self> {
        match epoch_num {
            -1 => Ok(Self::Latest),
            n if n >= 1 => Ok(Self::Epoch(n as usize)),
            n => Err(StackGanError::invalid_config(format!(
                "epoch number must be -1 or a positive epoch, found {n}"
            ))),
        }
    }
}

/// Checkpoint to resume `stage` from, if `use_pretrained` is set.
///
/// Stage 2 cannot resume from its own checkpoints.
pub fn resume_selector(
    stage: usize,
    use_pretrained: bool,
    epoch_num: i64,
) -> Result<Option<EpochSelector>> {
    if !use_pretrained {
        return Ok(None);
    }
    if stage == 2 {
        return Err(StackGanError::unsupported(
            "resuming stage 2 from a pretrained checkpoint",
        ));
    }
    EpochSelector::from_epoch_num(epoch_num).map(Some)
}

/// `<results_root>/<name>/stage-<n>`: holds `model_<epoch>/{generator,discriminator}`
/// snapshots next to the run's `state.json`, `metrics.jsonl` and `config.json`.
pub fn stage_dir(results_root: &Path, name: &str, stage: usize) -> PathBuf {
    results_root.join(name).join(format!("stage-{stage}"))
}

pub fn model_dir(stage_dir: &Path, epoch: usize) -> PathBuf {
    stage_dir.join(format!("model_{epoch}"))
}

fn generator_path(model_dir: &Path) -> PathBuf {
    model_dir.join(GENERATOR).join(GENERATOR)
}

fn discriminator_path(model_dir: &Path) -> PathBuf {
    model_dir.join(DISCRIMINATOR).join(DISCRIMINATOR)
}

/// Highest epoch among the `*model*` subdirectories of `stage_dir`.
///
/// The epoch is the first run of digits in the directory name.
pub fn latest_epoch(stage_dir: &Path) -> Result<usize> {
    let pattern = format!(
        "{}/*model*",
        glob::Pattern::escape(&stage_dir.display().to_string())
    );
    let paths = glob::glob(&pattern).map_err(|err| StackGanError::invalid_config(err.to_string()))?;

    paths
        .filter_map(std::result::Result::ok)
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(first_integer)
        })
        .max()
        .ok_or_else(|| StackGanError::NoCheckpoints(stage_dir.to_path_buf()))
}

fn first_integer(name: &str) -> Option<usize> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits: String = name[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Turn a selector into a concrete epoch that exists on disk.
pub fn resolve_epoch(stage_dir: &Path, selector: EpochSelector) -> Result<usize> {
    match selector {
        EpochSelector::Latest => latest_epoch(stage_dir),
        EpochSelector::Epoch(epoch) => {
            let dir = model_dir(stage_dir, epoch);
            if dir.is_dir() {
                Ok(epoch)
            } else {
                Err(StackGanError::MissingCheckpoint(dir))
            }
        }
    }
}

/// Parameters are stored at full precision so a reload restores them exactly.
type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

fn recorder_file<B: Backend>(path: &Path) -> PathBuf {
    path.with_extension(<CheckpointRecorder as FileRecorder<B>>::file_extension())
}

pub fn save_module<B: Backend, M: Module<B>>(module: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    module
        .clone()
        .save_file(path.to_path_buf(), &CheckpointRecorder::new())
        .map_err(|err| StackGanError::Recorder {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    let file = recorder_file::<B>(path);
    if !file.is_file() {
        return Err(StackGanError::MissingCheckpoint(file));
    }
    module
        .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)
        .map_err(|err| StackGanError::Recorder {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Write both networks of `gan` under `model_<epoch>` and return that directory.
pub fn save_gan<B, G, D>(gan: &ConditionalGan<G, D>, stage_dir: &Path, epoch: usize) -> Result<PathBuf>
where
    B: Backend,
    G: Module<B>,
    D: Module<B>,
{
    let dir = model_dir(stage_dir, epoch);
    save_module::<B, G>(&gan.generator, &generator_path(&dir))?;
    save_module::<B, D>(&gan.discriminator, &discriminator_path(&dir))?;
    Ok(dir)
}

/// Restore both networks of `gan` from the epoch picked by `selector`.
pub fn load_gan<B, G, D>(
    gan: ConditionalGan<G, D>,
    stage_dir: &Path,
    selector: EpochSelector,
    device: &B::Device,
) -> Result<(ConditionalGan<G, D>, usize)>
where
    B: Backend,
    G: Module<B>,
    D: Module<B>,
{
    let epoch = resolve_epoch(stage_dir, selector)?;
    let dir = model_dir(stage_dir, epoch);
    let ConditionalGan {
        generator,
        discriminator,
        image_size,
    } = gan;
    let generator = load_module::<B, G>(generator, &generator_path(&dir), device)?;
    let discriminator = load_module::<B, D>(discriminator, &discriminator_path(&dir), device)?;
    Ok((
        ConditionalGan {
            generator,
            discriminator,
            image_size,
        },
        epoch,
    ))
}

/// Build a stage 1 generator and fill it from the stage 1 directory.
pub fn load_stage1_generator<B: Backend>(
    config: &StackGanConfig,
    stage1_dir: &Path,
    selector: EpochSelector,
    device: &B::Device,
) -> Result<(GeneratorStage1<B>, usize)> {
    let epoch = resolve_epoch(stage1_dir, selector)?;
    let generator = config.generator_stage1_config().init::<B>(device)?;
    let generator = load_module::<B, GeneratorStage1<B>>(
        generator,
        &generator_path(&model_dir(stage1_dir, epoch)),
        device,
    )?;
    Ok((generator, epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::Initializer;
    use tempfile::tempdir;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> StackGanConfig {
        StackGanConfig::new()
            .with_embedding_dim(4)
            .with_conditioning_dim(2)
            .with_noise_dim(3)
            .with_gf_dim(1)
            .with_df_dim(2)
            .with_embedding_projection_dim(2)
            .with_small_image_size(8)
            .with_large_image_size(16)
            .with_stage2_downsamples(1)
            .with_stage2_residuals(1)
    }

    #[test]
    fn latest_epoch_uses_numeric_order() {
        let dir = tempdir().unwrap();
        for epoch in [1, 3, 10] {
            fs::create_dir_all(model_dir(dir.path(), epoch)).unwrap();
        }
        fs::write(dir.path().join("model_99.txt"), b"not a checkpoint").unwrap();
        fs::create_dir_all(dir.path().join("samples")).unwrap();

        assert_eq!(latest_epoch(dir.path()).unwrap(), 10);
        assert_eq!(resolve_epoch(dir.path(), EpochSelector::Latest).unwrap(), 10);
        assert_eq!(resolve_epoch(dir.path(), EpochSelector::Epoch(3)).unwrap(), 3);
    }

    #[test]
    fn empty_stage_dir_has_no_checkpoints() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            latest_epoch(dir.path()),
            Err(StackGanError::NoCheckpoints(_))
        ));
        assert!(matches!(
            latest_epoch(&dir.path().join("missing")),
            Err(StackGanError::NoCheckpoints(_))
        ));
    }

    #[test]
    fn explicit_epoch_must_exist() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(model_dir(dir.path(), 2)).unwrap();
        assert!(matches!(
            resolve_epoch(dir.path(), EpochSelector::Epoch(5)),
            Err(StackGanError::MissingCheckpoint(_))
        ));
    }

    #[test]
    fn epoch_num_parsing() {
        assert_eq!(EpochSelector::from_epoch_num(-1).unwrap(), EpochSelector::Latest);
        assert_eq!(EpochSelector::from_epoch_num(7).unwrap(), EpochSelector::Epoch(7));
        assert!(EpochSelector::from_epoch_num(0).is_err());
        assert!(EpochSelector::from_epoch_num(-3).is_err());
    }

    #[test]
    fn resume_selection_depends_on_stage() {
        assert_eq!(resume_selector(1, false, 5).unwrap(), None);
        assert_eq!(resume_selector(2, false, -1).unwrap(), None);
        assert_eq!(
            resume_selector(1, true, -1).unwrap(),
            Some(EpochSelector::Latest)
        );
        assert_eq!(
            resume_selector(1, true, 3).unwrap(),
            Some(EpochSelector::Epoch(3))
        );
        assert!(matches!(
            resume_selector(2, true, -1),
            Err(StackGanError::Unsupported(_))
        ));
        assert!(resume_selector(1, true, 0).is_err());
    }

    #[test]
    fn reloaded_generator_matches_saved_one_exactly() {
        let device = Default::default();
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let gan = config.init_stage1::<TestBackend>(&device).unwrap();
        save_gan::<TestBackend, _, _>(&gan, dir.path(), 1).unwrap();

        let (restored, _) =
            load_stage1_generator::<TestBackend>(&config, dir.path(), EpochSelector::Latest, &device)
                .unwrap();
        let run = |generator: &GeneratorStage1<TestBackend>| {
            generator
                .forward(
                    Tensor::ones([2, 4], &device),
                    Tensor::ones([2, 3], &device),
                    Tensor::ones([2, 2], &device),
                )
                .images
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(run(&restored), run(&gan.generator));
    }

    #[test]
    fn saved_gan_restores_into_fresh_networks() {
        let device = Default::default();
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let gan = config.init_stage1::<TestBackend>(&device).unwrap();

        let saved = save_gan::<TestBackend, _, _>(&gan, dir.path(), 4).unwrap();
        assert_eq!(saved, dir.path().join("model_4"));
        assert!(saved.join("generator").is_dir());
        assert!(saved.join("discriminator").is_dir());

        let fresh = config
            .clone()
            .with_initializer(Initializer::Zeros)
            .init_stage1::<TestBackend>(&device)
            .unwrap();
        let (restored, epoch) =
            load_gan::<TestBackend, _, _>(fresh, dir.path(), EpochSelector::Latest, &device)
                .unwrap();
        assert_eq!(epoch, 4);
        assert_eq!(restored.image_size, 8);

        let (generator, epoch) =
            load_stage1_generator::<TestBackend>(&config, dir.path(), EpochSelector::Epoch(4), &device)
                .unwrap();
        assert_eq!(epoch, 4);
        assert_eq!(generator.num_params(), gan.generator.num_params());
    }

    #[test]
    fn loading_absent_files_reports_missing_checkpoint() {
        let device = Default::default();
        let dir = tempdir().unwrap();
        fs::create_dir_all(model_dir(dir.path(), 1)).unwrap();
        let gan = tiny_config().init_stage1::<TestBackend>(&device).unwrap();
        let result = load_gan::<TestBackend, _, _>(gan, dir.path(), EpochSelector::Latest, &device);
        assert!(matches!(result, Err(StackGanError::MissingCheckpoint(_))));
    }
}
