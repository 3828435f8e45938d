use crate::error::{TrainError, TrainResult};
use crate::loss::{binary_accuracy, dice_coef, sensitivity, specificity, SMOOTH};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Metrics for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub dice: f32,
    pub sensitivity: f32,
    pub specificity: f32,
}

impl BatchMetrics {
    /// Computes the coefficients on detached tensors; `loss` is passed in
    /// since the objective is chosen by the caller.
    pub fn compute<B: Backend, const D: usize>(
        loss: Tensor<B, 1>,
        target: Tensor<B, D>,
        pred: Tensor<B, D>,
    ) -> TrainResult<Self> {
        let target = target.detach();
        let pred = pred.detach();
        Ok(BatchMetrics {
            loss: scalar(loss.detach())?,
            accuracy: scalar(binary_accuracy(target.clone(), pred.clone()))?,
            dice: scalar(dice_coef(target.clone(), pred.clone(), SMOOTH))?,
            sensitivity: scalar(sensitivity(target.clone(), pred.clone(), SMOOTH))?,
            specificity: scalar(specificity(target, pred, SMOOTH))?,
        })
    }
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> TrainResult<f32> {
    let values = t
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| TrainError::Tensor(format!("{e:?}")))?;
    values
        .first()
        .copied()
        .ok_or_else(|| TrainError::Tensor("empty scalar tensor".to_string()))
}

/// Epoch-level means, weighted by batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub dice: f32,
    pub sensitivity: f32,
    pub specificity: f32,
    pub samples: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: [f64; 5],
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: &BatchMetrics, batch_size: usize) {
        let w = batch_size as f64;
        let values = [
            batch.loss,
            batch.accuracy,
            batch.dice,
            batch.sensitivity,
            batch.specificity,
        ];
        for (sum, v) in self.sums.iter_mut().zip(values) {
            *sum += v as f64 * w;
        }
        self.samples += batch_size;
    }

    pub fn finish(&self) -> EpochMetrics {
        let n = self.samples.max(1) as f64;
        let mean = |i: usize| (self.sums[i] / n) as f32;
        EpochMetrics {
            loss: mean(0),
            accuracy: mean(1),
            dice: mean(2),
            sensitivity: mean(3),
            specificity: mean(4),
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_weights_by_batch_size() {
        let mut acc = MetricAccumulator::new();
        acc.push(
            &BatchMetrics {
                loss: 1.0,
                dice: 0.0,
                ..Default::default()
            },
            3,
        );
        acc.push(
            &BatchMetrics {
                loss: 0.0,
                dice: 1.0,
                ..Default::default()
            },
            1,
        );
        let epoch = acc.finish();
        assert_eq!(epoch.samples, 4);
        assert!((epoch.loss - 0.75).abs() < 1e-6);
        assert!((epoch.dice - 0.25).abs() < 1e-6);
    }

    #[test]
    fn empty_accumulator_reports_zeros() {
        let epoch = MetricAccumulator::new().finish();
        assert_eq!(epoch, EpochMetrics::default());
    }
}
