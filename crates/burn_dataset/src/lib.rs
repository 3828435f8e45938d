//! Dataset loading, validation, and patch batching for segmentation training.
//!
//! This crate provides utilities for:
//! - Loading train/test splits from `.npz` archives
//! - Random patch sampling with flip/rotate augmentation
//! - Sequential batching for validation and prediction
//! - Mask quality checks with configurable thresholds

pub mod aug;
pub mod batch;
pub mod npz;
pub mod types;
pub mod validation;

pub use aug::{AugmentationPolicy, PatchTransform};
pub use batch::{iter_batches, PatchSampler, SamplerConfig, SamplerStats, SequentialBatches};
pub use npz::{load_splits, write_predictions, write_splits, LoadOptions};
pub use types::*;
pub use validation::{summarize, summarize_with_thresholds, validate_summary};
