//! Training settings: built-in defaults, overlaid by a TOML file, overlaid by
//! command-line flags.

use crate::error::{TrainError, TrainResult};
use crate::loss::{LossKind, DEFAULT_DICE_WEIGHT};
use clap::ValueEnum;
use models::{UNet2dConfig, UNet3dConfig, UpsampleMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_NAME: &str = "unet-train.toml";
pub const CONFIG_ENV: &str = "UNET_TRAIN_CONFIG";
/// Adam decay matching a `1e-5 * sum(w^2)` kernel penalty on every 3D convolution.
pub const DEFAULT_3D_WEIGHT_DECAY: f32 = 2e-5;

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Unet2d,
    Unet3d,
}

impl ModelKind {
    pub fn spatial_dims(&self) -> usize {
        match self {
            ModelKind::Unet2d => 2,
            ModelKind::Unet3d => 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrainSettings {
    pub data_path: PathBuf,
    pub data_file: String,
    pub out_path: PathBuf,
    pub model: ModelKind,
    /// Nearest-neighbour upsampling instead of transposed convolutions.
    pub use_upsampling: bool,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub patch_height: usize,
    pub patch_width: usize,
    /// 3D only; the full volume depth when unset.
    pub patch_depth: Option<usize>,
    pub num_input_channels: usize,
    pub num_output_channels: usize,
    pub base_filters: usize,
    pub dropout: f64,
    pub batch_norm: bool,
    pub loss: LossKind,
    pub dice_weight: f32,
    /// Unset means none for 2D and [`DEFAULT_3D_WEIGHT_DECAY`] for 3D; 0 disables it.
    pub weight_decay: Option<f32>,
    pub seed: Option<u64>,
    pub augment: bool,
    pub num_threads: Option<usize>,
    pub trace: bool,
    pub print_model: bool,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            data_file: "processed_data.npz".to_string(),
            out_path: PathBuf::from("saved_model"),
            model: ModelKind::Unet2d,
            use_upsampling: false,
            batch_size: 128,
            epochs: 10,
            learning_rate: 1e-4,
            patch_height: 128,
            patch_width: 128,
            patch_depth: None,
            num_input_channels: 1,
            num_output_channels: 1,
            base_filters: 32,
            dropout: 0.2,
            batch_norm: false,
            loss: LossKind::Dice,
            dice_weight: DEFAULT_DICE_WEIGHT,
            weight_decay: None,
            seed: None,
            augment: true,
            num_threads: None,
            trace: false,
            print_model: false,
        }
    }
}

impl TrainSettings {
    /// Settings from `explicit`, else `$UNET_TRAIN_CONFIG`, else
    /// `unet-train.toml` in the working directory, else defaults.
    ///
    /// A file named explicitly (argument or env) must exist; the implicit
    /// default file is optional.
    pub fn resolve(explicit: Option<&Path>) -> TrainResult<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Self::from_path(&cli_support::expand_path(&path));
            }
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.exists() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        let settings: TrainSettings =
            toml::from_str(&raw).map_err(|source| TrainError::SettingsFile {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "loaded training settings");
        Ok(settings)
    }

    pub fn validate(&self) -> TrainResult<()> {
        let fail = |msg: String| Err(TrainError::Settings(msg));
        if self.batch_size == 0 {
            return fail("batch_size must be > 0".into());
        }
        if self.epochs == 0 {
            return fail("epochs must be > 0".into());
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return fail(format!("learning_rate must be > 0, got {}", self.learning_rate));
        }
        if self.patch_height == 0 || self.patch_width == 0 || self.patch_depth == Some(0) {
            return fail("patch extents must be > 0".into());
        }
        if self.num_input_channels == 0 || self.num_output_channels == 0 {
            return fail("channel counts must be > 0".into());
        }
        if self.base_filters == 0 {
            return fail("base_filters must be > 0".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.weight_decay.is_some_and(|v| v.is_nan() || v < 0.0) {
            return fail("weight_decay must be >= 0".into());
        }
        if !(0.0..=1.0).contains(&self.dice_weight) {
            return fail(format!("dice_weight must be in [0, 1], got {}", self.dice_weight));
        }
        if self.model == ModelKind::Unet2d && self.patch_depth.is_some() {
            tracing::warn!("patch_depth is ignored for unet2d");
        }
        Ok(())
    }

    pub fn effective_weight_decay(&self) -> Option<f32> {
        let decay = match (self.weight_decay, self.model) {
            (Some(v), _) => v,
            (None, ModelKind::Unet3d) => DEFAULT_3D_WEIGHT_DECAY,
            (None, ModelKind::Unet2d) => return None,
        };
        (decay > 0.0).then_some(decay)
    }

    pub fn upsample_mode(&self) -> UpsampleMode {
        UpsampleMode::from_flag(self.use_upsampling)
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.data_path.join(&self.data_file)
    }

    /// Patch extent per spatial axis for data of the given spatial shape.
    pub fn patch_shape(&self, spatial: &[usize]) -> Vec<usize> {
        match self.model {
            ModelKind::Unet2d => vec![self.patch_height, self.patch_width],
            ModelKind::Unet3d => {
                let depth = self
                    .patch_depth
                    .unwrap_or_else(|| spatial.first().copied().unwrap_or(0));
                vec![depth, self.patch_height, self.patch_width]
            }
        }
    }

    pub fn unet2d_config(&self) -> UNet2dConfig {
        UNet2dConfig::new()
            .with_in_channels(self.num_input_channels)
            .with_num_classes(self.num_output_channels)
            .with_base_filters(self.base_filters)
            .with_dropout(self.dropout)
            .with_batch_norm(self.batch_norm)
            .with_upsample(self.upsample_mode())
    }

    pub fn unet3d_config(&self) -> UNet3dConfig {
        UNet3dConfig::new()
            .with_in_channels(self.num_input_channels)
            .with_num_classes(self.num_output_channels)
            .with_base_filters(self.base_filters)
            .with_dropout(self.dropout)
            .with_upsample(self.upsample_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings: TrainSettings = toml::from_str(
            r#"
            model = "unet3d"
            batch_size = 4
            use_upsampling = true
            loss = "dice_bce"
            "#,
        )
        .unwrap();
        assert_eq!(settings.model, ModelKind::Unet3d);
        assert_eq!(settings.batch_size, 4);
        assert_eq!(settings.loss, LossKind::DiceBce);
        assert_eq!(settings.epochs, 10);
        assert_eq!(settings.upsample_mode(), UpsampleMode::Nearest);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<TrainSettings>("batchsize = 4").is_err());
    }

    #[test]
    fn explicit_config_must_exist() {
        let err = TrainSettings::resolve(Some(Path::new("/nonexistent/unet.toml")));
        assert!(matches!(err, Err(TrainError::Io { .. })));
    }

    #[test]
    fn explicit_config_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "epochs = 3\nlearning_rate = 0.01\n").unwrap();
        let settings = TrainSettings::resolve(Some(&path)).unwrap();
        assert_eq!(settings.epochs, 3);
        assert!((settings.learning_rate - 0.01).abs() < 1e-12);
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut settings = TrainSettings::default();
        assert!(settings.validate().is_ok());
        settings.dice_weight = 1.5;
        assert!(settings.validate().is_err());
        settings = TrainSettings {
            batch_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn volume_patch_defaults_to_full_depth() {
        let settings = TrainSettings {
            model: ModelKind::Unet3d,
            patch_height: 32,
            patch_width: 32,
            ..Default::default()
        };
        assert_eq!(settings.patch_shape(&[16, 64, 64]), vec![16, 32, 32]);
        let settings = TrainSettings {
            patch_depth: Some(8),
            ..settings
        };
        assert_eq!(settings.patch_shape(&[16, 64, 64]), vec![8, 32, 32]);
    }

    #[test]
    fn volume_model_defaults_to_weight_decay() {
        let settings = TrainSettings::default();
        assert_eq!(settings.effective_weight_decay(), None);
        let settings = TrainSettings {
            model: ModelKind::Unet3d,
            ..settings
        };
        assert_eq!(settings.effective_weight_decay(), Some(DEFAULT_3D_WEIGHT_DECAY));
        let settings = TrainSettings {
            weight_decay: Some(0.0),
            ..settings
        };
        assert_eq!(settings.effective_weight_decay(), None);
    }

    #[test]
    fn model_configs_follow_settings() {
        let settings = TrainSettings {
            base_filters: 4,
            num_input_channels: 2,
            batch_norm: true,
            ..Default::default()
        };
        let cfg = settings.unet2d_config();
        assert_eq!(cfg.base_filters, 4);
        assert_eq!(cfg.in_channels, 2);
        assert!(cfg.batch_norm);
        assert_eq!(settings.unet3d_config().in_channels, 2);
    }
}
