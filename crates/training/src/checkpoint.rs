//! Output locations and weight checkpoints.

use crate::error::{TrainError, TrainResult};
use crate::settings::{ModelKind, TrainSettings};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};

/// Every file a training run writes, derived from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub root: PathBuf,
    /// Weights of the best epoch so far.
    pub checkpoint: PathBuf,
    /// Model config next to the weights, so the checkpoint can be rebuilt.
    pub model_config: PathBuf,
    pub metrics: PathBuf,
    pub timeline: PathBuf,
    pub predictions: PathBuf,
}

impl OutputLayout {
    pub fn new(settings: &TrainSettings, threads: usize) -> Self {
        let root = settings.out_path.clone();
        let mode = settings.upsample_mode().as_str();
        let suffix = match settings.model {
            ModelKind::Unet2d => "",
            ModelKind::Unet3d => "_3d",
        };
        let stem = format!("unet_model_{mode}{suffix}");
        OutputLayout {
            checkpoint: root.join(format!("{stem}.bin")),
            model_config: root.join(format!("{stem}.json")),
            metrics: root
                .join(format!("batch{}", settings.batch_size))
                .join(format!("{mode}_unet_threads{threads}"))
                .join("metrics.jsonl"),
            timeline: root.join(format!("timeline_unet_threads{threads}.jsonl")),
            predictions: root.join(format!("msks_pred_{mode}.npy")),
            root,
        }
    }

    pub fn create_dirs(&self) -> TrainResult<()> {
        for dir in [Some(self.root.as_path()), self.metrics.parent()]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        }
        Ok(())
    }
}

/// Tracks the lowest mean training loss seen so far.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMonitor {
    best: Option<f32>,
    best_epoch: usize,
    epochs: usize,
}

impl CheckpointMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one epoch's loss and reports whether a checkpoint should be
    /// written. The first epoch always counts, so there is one to reload.
    pub fn improved(&mut self, loss: f32) -> bool {
        let epoch = self.epochs;
        self.epochs += 1;
        let better = match self.best {
            None => true,
            Some(best) => loss < best || (best.is_nan() && !loss.is_nan()),
        };
        if better {
            self.best = Some(loss);
            self.best_epoch = epoch;
        }
        better
    }

    /// Best loss so far, infinite before the first epoch.
    pub fn best(&self) -> f32 {
        self.best.unwrap_or(f32::INFINITY)
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// Burn's file recorder always writes `.bin`, whatever extension was given.
fn recorder_path(path: &Path) -> PathBuf {
    path.with_extension("bin")
}

pub fn save_checkpoint<B: Backend, M: Module<B>>(model: &M, path: &Path) -> TrainResult<()> {
    let path = recorder_path(path);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(&path, &recorder)
        .map_err(|e| TrainError::Checkpoint {
            path: path.clone(),
            message: format!("failed to save: {e}"),
        })
}

/// Loads weights into `model`, which must have the checkpoint's architecture.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> TrainResult<M> {
    let path = recorder_path(path);
    if !path.exists() {
        return Err(TrainError::Checkpoint {
            path,
            message: "file not found".to_string(),
        });
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(&path, &recorder, device)
        .map_err(|e| TrainError::Checkpoint {
            path: path.clone(),
            message: format!("failed to load: {e}"),
        })
}

pub fn save_model_config<C: burn::config::Config>(config: &C, path: &Path) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    config.save(path).map_err(|e| TrainError::io(path, e))
}

/// Reads a saved model config; `None` when the file does not exist.
pub fn load_model_config<C: burn::config::Config>(path: &Path) -> TrainResult<Option<C>> {
    if !path.exists() {
        return Ok(None);
    }
    C::load(path)
        .map(Some)
        .map_err(|e| TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("unreadable model config: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use models::{SegmentationNet, UNet2dConfig};

    type B = NdArray<f32>;

    #[test]
    fn layout_names_follow_mode_and_model() {
        let settings = TrainSettings {
            out_path: PathBuf::from("out"),
            batch_size: 16,
            ..Default::default()
        };
        let layout = OutputLayout::new(&settings, 4);
        assert_eq!(layout.checkpoint, PathBuf::from("out/unet_model_transposed.bin"));
        assert_eq!(
            layout.metrics,
            PathBuf::from("out/batch16/transposed_unet_threads4/metrics.jsonl")
        );
        assert_eq!(layout.timeline, PathBuf::from("out/timeline_unet_threads4.jsonl"));
        assert_eq!(layout.predictions, PathBuf::from("out/msks_pred_transposed.npy"));

        let settings = TrainSettings {
            model: ModelKind::Unet3d,
            use_upsampling: true,
            ..settings
        };
        let layout = OutputLayout::new(&settings, 1);
        assert_eq!(layout.checkpoint, PathBuf::from("out/unet_model_upsampling_3d.bin"));
        assert_eq!(layout.model_config, PathBuf::from("out/unet_model_upsampling_3d.json"));
    }

    #[test]
    fn checkpoint_restores_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let cfg = UNet2dConfig::new().with_base_filters(2);
        let model = cfg.init::<B>(&device);
        let path = dir.path().join("unet_model_transposed.bin");
        save_checkpoint(&model, &path).unwrap();
        save_model_config(&cfg, &dir.path().join("unet_model_transposed.json")).unwrap();

        let restored_cfg: UNet2dConfig =
            load_model_config(&dir.path().join("unet_model_transposed.json"))
                .unwrap()
                .unwrap();
        let restored = load_checkpoint(restored_cfg.init::<B>(&device), &path, &device).unwrap();

        let input = burn::tensor::Tensor::<B, 4>::ones([1, 1, 16, 16], &device);
        let a = model.segment(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = restored.segment(input).into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let device = Default::default();
        let model = UNet2dConfig::new().with_base_filters(2).init::<B>(&device);
        let err = load_checkpoint(model, Path::new("/nonexistent/w.bin"), &device);
        assert!(matches!(err, Err(TrainError::Checkpoint { .. })));
    }

    #[test]
    fn checkpoint_extension_is_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let cfg = UNet2dConfig::new().with_base_filters(2);
        save_checkpoint(&cfg.init::<B>(&device), &dir.path().join("weights.bin")).unwrap();

        let ckpt = dir.path().join("weights.ckpt");
        assert!(load_checkpoint(cfg.init::<B>(&device), &ckpt, &device).is_ok());

        let missing = dir.path().join("other.ckpt");
        match load_checkpoint(cfg.init::<B>(&device), &missing, &device) {
            Err(TrainError::Checkpoint { path, .. }) => {
                assert_eq!(path, dir.path().join("other.bin"))
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("loaded a checkpoint that was never written"),
        }
    }

    #[test]
    fn monitor_saves_only_on_improvement() {
        let mut monitor = CheckpointMonitor::new();
        let saved: Vec<bool> = [0.5, 0.7, 0.4].into_iter().map(|l| monitor.improved(l)).collect();
        assert_eq!(saved, vec![true, false, true]);
        assert_eq!(monitor.best_epoch(), 2);
        assert!((monitor.best() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn first_epoch_always_saves() {
        let mut monitor = CheckpointMonitor::new();
        assert!(monitor.best().is_infinite());
        assert!(monitor.improved(f32::NAN));
        assert!(monitor.improved(0.9));
        assert!(!monitor.improved(f32::NAN));
        assert_eq!(monitor.best_epoch(), 1);
    }
}
