//! Dataset validation and quality checks.

use crate::types::{
    DatasetSummary, SegmentationSet, ValidationOutcome, ValidationReport, ValidationThresholds,
};
use ndarray::Axis;

/// Mask voxels further than this from 0 and 1 count as non-binary.
const BINARY_TOLERANCE: f32 = 1e-6;

fn apply_thresholds(
    label: &str,
    count: usize,
    ratio: f32,
    max_count: Option<usize>,
    max_ratio: Option<f32>,
    outcome: &mut ValidationOutcome,
    reasons: &mut Vec<String>,
) {
    if let Some(max) = max_count {
        if count > max {
            *outcome = ValidationOutcome::Fail;
            reasons.push(format!("{label}: {count} exceeds max {max}"));
        }
    }
    if let Some(max_r) = max_ratio {
        if ratio > max_r {
            *outcome = ValidationOutcome::Fail;
            reasons.push(format!(
                "{label}: ratio {:.3} exceeds max {:.3}",
                ratio, max_r
            ));
        }
    }
    if count > 0 {
        if *outcome == ValidationOutcome::Pass {
            *outcome = ValidationOutcome::Warn;
        }
        reasons.push(format!("{label}: {count} observed"));
    }
}

/// Counts empty masks and non-binary mask voxels.
pub fn summarize(set: &SegmentationSet) -> DatasetSummary {
    let mut empty_masks = 0usize;
    let mut non_binary_voxels = 0usize;
    let mut foreground = 0f64;

    for mask in set.masks.axis_iter(Axis(0)) {
        let mut any = false;
        for &v in mask.iter() {
            if v > 0.5 {
                any = true;
            }
            if v.abs() > BINARY_TOLERANCE && (v - 1.0).abs() > BINARY_TOLERANCE {
                non_binary_voxels += 1;
            }
            foreground += v as f64;
        }
        if !any {
            empty_masks += 1;
        }
    }

    let voxels = set.masks.len().max(1) as f64;
    DatasetSummary {
        samples: set.len(),
        spatial_shape: set.spatial_shape().to_vec(),
        image_channels: set.image_channels(),
        mask_channels: set.mask_channels(),
        empty_masks,
        non_binary_voxels,
        foreground_ratio: foreground / voxels,
    }
}

pub fn validate_summary(
    summary: DatasetSummary,
    thresholds: &ValidationThresholds,
) -> ValidationReport {
    let mut outcome = ValidationOutcome::Pass;
    let mut reasons = Vec::new();

    let samples = summary.samples.max(1) as f32;
    apply_thresholds(
        "empty masks",
        summary.empty_masks,
        summary.empty_masks as f32 / samples,
        thresholds.max_empty,
        thresholds.max_empty_ratio,
        &mut outcome,
        &mut reasons,
    );

    let voxels = (summary.samples
        * summary.mask_channels
        * summary.spatial_shape.iter().product::<usize>())
    .max(1) as f32;
    apply_thresholds(
        "non-binary mask voxels",
        summary.non_binary_voxels,
        summary.non_binary_voxels as f32 / voxels,
        thresholds.max_non_binary,
        None,
        &mut outcome,
        &mut reasons,
    );

    if summary.samples == 0 {
        outcome = ValidationOutcome::Fail;
        reasons.push("no samples".to_string());
    }

    ValidationReport {
        outcome,
        reasons,
        summary,
    }
}

pub fn summarize_with_thresholds(
    set: &SegmentationSet,
    thresholds: &ValidationThresholds,
) -> ValidationReport {
    validate_summary(summarize(set), thresholds)
}
