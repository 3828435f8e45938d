use burn_dataset::BurnDatasetError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] BurnDatasetError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("failed to parse {path}: {source}")]
    SettingsFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("tensor data error: {0}")]
    Tensor(String),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }
}
