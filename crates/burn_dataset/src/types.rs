//! Core types, error definitions, and data structures for burn_dataset.

use ndarray::{ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BurnDatasetError>;

#[derive(Debug, Error)]
pub enum BurnDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("npz read error at {path}: {source}")]
    NpzRead {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpzError,
    },
    #[error("npz write error at {path}: {source}")]
    NpzWrite {
        path: PathBuf,
        #[source]
        source: ndarray_npy::WriteNpzError,
    },
    #[error("npy write error at {path}: {source}")]
    NpyWrite {
        path: PathBuf,
        #[source]
        source: ndarray_npy::WriteNpyError,
    },
    #[error("array `{name}` not found in {path} (available: {available:?})")]
    MissingArray {
        path: PathBuf,
        name: String,
        available: Vec<String>,
    },
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("{0}")]
    Other(String),
}

/// Images and masks in channels-first layout: `[samples, channels, spatial...]`.
#[derive(Debug, Clone)]
pub struct SegmentationSet {
    pub images: ArrayD<f32>,
    pub masks: ArrayD<f32>,
}

impl SegmentationSet {
    /// Pairs images with masks, checking sample count and spatial extent agree.
    pub fn new(images: ArrayD<f32>, masks: ArrayD<f32>) -> DatasetResult<Self> {
        if images.ndim() < 3 {
            return Err(BurnDatasetError::Shape(format!(
                "expected [samples, channels, spatial...], got {:?}",
                images.shape()
            )));
        }
        if images.ndim() != masks.ndim() {
            return Err(BurnDatasetError::Shape(format!(
                "images rank {} differs from masks rank {}",
                images.ndim(),
                masks.ndim()
            )));
        }
        if images.shape()[0] != masks.shape()[0] {
            return Err(BurnDatasetError::Shape(format!(
                "{} images but {} masks",
                images.shape()[0],
                masks.shape()[0]
            )));
        }
        if images.shape()[2..] != masks.shape()[2..] {
            return Err(BurnDatasetError::Shape(format!(
                "image extent {:?} differs from mask extent {:?}",
                &images.shape()[2..],
                &masks.shape()[2..]
            )));
        }
        Ok(Self { images, masks })
    }

    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spatial_shape(&self) -> &[usize] {
        &self.images.shape()[2..]
    }

    pub fn image_channels(&self) -> usize {
        self.images.shape()[1]
    }

    pub fn mask_channels(&self) -> usize {
        self.masks.shape()[1]
    }

    /// Copies the samples in `range` into a new set.
    pub fn slice_samples(&self, range: Range<usize>) -> SegmentationSet {
        let slice = Slice::from(range);
        SegmentationSet {
            images: self.images.slice_axis(Axis(0), slice).to_owned(),
            masks: self.masks.slice_axis(Axis(0), slice).to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: SegmentationSet,
    pub test: SegmentationSet,
}

/// One batch of patches, channels-first: `[batch, channels, patch...]`.
#[derive(Debug, Clone)]
pub struct PatchBatch {
    pub images: ArrayD<f32>,
    pub masks: ArrayD<f32>,
}

impl PatchBatch {
    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub samples: usize,
    pub spatial_shape: Vec<usize>,
    pub image_channels: usize,
    pub mask_channels: usize,
    /// Samples whose mask has no foreground voxel.
    pub empty_masks: usize,
    /// Mask voxels that are neither 0 nor 1.
    pub non_binary_voxels: usize,
    pub foreground_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Pass,
    Warn,
    Fail,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Pass => "pass",
            ValidationOutcome::Warn => "warn",
            ValidationOutcome::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationThresholds {
    pub max_empty: Option<usize>,
    pub max_empty_ratio: Option<f32>,
    pub max_non_binary: Option<usize>,
}

impl ValidationThresholds {
    pub fn from_env() -> Self {
        fn parse_usize(key: &str) -> Option<usize> {
            std::env::var(key).ok()?.parse().ok()
        }
        fn parse_ratio(key: &str) -> Option<f32> {
            std::env::var(key).ok()?.parse().ok()
        }
        ValidationThresholds {
            max_empty: parse_usize("BURN_DATASET_MAX_EMPTY"),
            max_empty_ratio: parse_ratio("BURN_DATASET_MAX_EMPTY_RATIO"),
            max_non_binary: parse_usize("BURN_DATASET_MAX_NON_BINARY"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub reasons: Vec<String>,
    pub summary: DatasetSummary,
}
