//! Whole-image evaluation on a held-out split.

use crate::dataset::{array_to_tensor, tensor_to_array};
use crate::error::{TrainError, TrainResult};
use crate::loss::LossKind;
use crate::metrics::{BatchMetrics, EpochMetrics, MetricAccumulator};
use burn::tensor::backend::Backend;
use burn_dataset::{iter_batches, SegmentationSet};
use models::SegmentationNet;
use ndarray::{ArrayD, Axis};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metrics: EpochMetrics,
    /// Channels-first probabilities, when requested.
    pub predictions: Option<ArrayD<f32>>,
    pub elapsed_secs: f64,
    pub images_per_sec: f64,
}

/// Runs `model` over `set` in order. The model should be on a backend
/// without gradient tracking so dropout stays off.
pub fn evaluate<B, M, const D: usize>(
    model: &M,
    set: &SegmentationSet,
    batch_size: usize,
    loss: LossKind,
    dice_weight: f32,
    keep_predictions: bool,
    device: &B::Device,
) -> TrainResult<Evaluation>
where
    B: Backend,
    M: SegmentationNet<B, D>,
{
    if set.is_empty() {
        return Err(TrainError::Shape("cannot evaluate an empty split".to_string()));
    }
    check_divisible(set.spatial_shape(), model.size_divisor())?;

    let start = Instant::now();
    let mut acc = MetricAccumulator::new();
    let mut chunks = Vec::new();
    for batch in iter_batches(set, batch_size) {
        let images = array_to_tensor::<B, D>(&batch.images, device)?;
        let masks = array_to_tensor::<B, D>(&batch.masks, device)?;
        let preds = model.segment(images);
        let batch_loss = loss.compute(masks.clone(), preds.clone(), dice_weight);
        let metrics = BatchMetrics::compute(batch_loss, masks, preds.clone())?;
        acc.push(&metrics, batch.len());
        if keep_predictions {
            chunks.push(tensor_to_array(preds)?);
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    let predictions = if keep_predictions {
        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        Some(
            ndarray::concatenate(Axis(0), &views)
                .map_err(|e| TrainError::Shape(e.to_string()))?,
        )
    } else {
        None
    };

    Ok(Evaluation {
        metrics: acc.finish(),
        predictions,
        elapsed_secs: elapsed,
        images_per_sec: set.len() as f64 / elapsed.max(f64::EPSILON),
    })
}

/// Every spatial extent must survive the encoder's 2x poolings.
pub fn check_divisible(spatial: &[usize], divisor: usize) -> TrainResult<()> {
    if let Some(bad) = spatial.iter().find(|&&s| s % divisor != 0) {
        return Err(TrainError::Shape(format!(
            "spatial extent {bad} in {spatial:?} is not divisible by {divisor}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use models::UNet2dConfig;
    use ndarray::IxDyn;

    type B = NdArray<f32>;

    fn set(samples: usize, size: usize) -> SegmentationSet {
        let images = ArrayD::<f32>::ones(IxDyn(&[samples, 1, size, size]));
        let masks = ArrayD::<f32>::zeros(IxDyn(&[samples, 1, size, size]));
        SegmentationSet::new(images, masks).unwrap()
    }

    #[test]
    fn predictions_cover_every_sample() {
        let device = Default::default();
        let model = UNet2dConfig::new().with_base_filters(2).init::<B>(&device);
        let eval = evaluate(&model, &set(3, 16), 2, LossKind::Dice, 0.7, true, &device).unwrap();
        let preds = eval.predictions.unwrap();
        assert_eq!(preds.shape(), &[3, 1, 16, 16]);
        assert!(preds.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_eq!(eval.metrics.samples, 3);
        assert!(eval.images_per_sec > 0.0);
    }

    #[test]
    fn indivisible_extent_is_rejected() {
        let device = Default::default();
        let model = UNet2dConfig::new().with_base_filters(2).init::<B>(&device);
        let err = evaluate(&model, &set(1, 20), 1, LossKind::Dice, 0.7, false, &device);
        assert!(matches!(err, Err(TrainError::Shape(_))));
    }
}
