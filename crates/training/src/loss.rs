//! Overlap-based losses and coefficients for binary segmentation.
//!
//! Sums run over every non-batch axis of each sample, then average over the
//! batch. Inputs are `[batch, channels, spatial...]` probabilities/targets.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Laplace smoothing shared by the coefficients below.
pub const SMOOTH: f32 = 1.0;
/// Clamp for predictions inside the logarithms of the BCE term.
pub const BCE_EPSILON: f32 = 1e-7;
pub const DEFAULT_DICE_WEIGHT: f32 = 0.7;

/// Per-sample sums `(Σ t·p, Σ t, Σ p)`, each `[batch, 1]`.
fn per_sample_sums<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    let t: Tensor<B, 2> = target.flatten(1, D - 1);
    let p: Tensor<B, 2> = pred.flatten(1, D - 1);
    let inter = (t.clone() * p.clone()).sum_dim(1);
    (inter, t.sum_dim(1), p.sum_dim(1))
}

/// Sørensen–Dice coefficient, averaged over the batch.
pub fn dice_coef<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
    smooth: f32,
) -> Tensor<B, 1> {
    let (inter, t, p) = per_sample_sums(target, pred);
    let coef = inter.mul_scalar(2.0).add_scalar(smooth) / (t + p).add_scalar(smooth);
    coef.mean()
}

/// `-ln(2 * mean(Σtp + s)) + ln(mean(Σt + Σp + s))`.
///
/// The log form keeps gradients usable when overlap is tiny.
pub fn dice_loss<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
    smooth: f32,
) -> Tensor<B, 1> {
    let (inter, t, p) = per_sample_sums(target, pred);
    let numerator = inter.add_scalar(smooth).mean().mul_scalar(2.0);
    let denominator = (t + p).add_scalar(smooth).mean();
    denominator.log() - numerator.log()
}

/// Mean binary cross entropy over every element.
pub fn bce<B: Backend, const D: usize>(target: Tensor<B, D>, pred: Tensor<B, D>) -> Tensor<B, 1> {
    let p = pred.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
    let pos = target.clone() * p.clone().log();
    let neg = target.neg().add_scalar(1.0) * p.neg().add_scalar(1.0).log();
    (pos + neg).neg().mean()
}

/// `weight * dice_loss + (1 - weight) * bce`.
pub fn combined_dice_bce<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
    weight: f32,
) -> Tensor<B, 1> {
    let dice = dice_loss(target.clone(), pred.clone(), SMOOTH);
    dice.mul_scalar(weight) + bce(target, pred).mul_scalar(1.0 - weight)
}

/// `mean((Σtp + s) / (Σt + s))`: share of true foreground that was found.
pub fn sensitivity<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
    smooth: f32,
) -> Tensor<B, 1> {
    let (inter, t, _) = per_sample_sums(target, pred);
    (inter.add_scalar(smooth) / t.add_scalar(smooth)).mean()
}

/// `mean((Σtp + s) / (Σp + s))`: share of predicted foreground that is real.
pub fn specificity<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
    smooth: f32,
) -> Tensor<B, 1> {
    let (inter, _, p) = per_sample_sums(target, pred);
    (inter.add_scalar(smooth) / p.add_scalar(smooth)).mean()
}

/// Fraction of voxels where thresholded prediction and target agree.
pub fn binary_accuracy<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    pred: Tensor<B, D>,
) -> Tensor<B, 1> {
    let p = pred.greater_elem(0.5);
    let t = target.greater_elem(0.5);
    p.equal(t).float().mean()
}

/// Training objective.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Dice,
    Bce,
    DiceBce,
}

impl LossKind {
    pub fn compute<B: Backend, const D: usize>(
        &self,
        target: Tensor<B, D>,
        pred: Tensor<B, D>,
        dice_weight: f32,
    ) -> Tensor<B, 1> {
        match self {
            LossKind::Dice => dice_loss(target, pred, SMOOTH),
            LossKind::Bce => bce(target, pred),
            LossKind::DiceBce => combined_dice_bce(target, pred, dice_weight),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::Dice => "dice",
            LossKind::Bce => "bce",
            LossKind::DiceBce => "dice_bce",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn perfect_overlap_gives_unit_dice() {
        let t = tensor(vec![1.0, 0.0, 1.0, 0.0], [1, 1, 2, 2]);
        let coef = scalar(dice_coef(t.clone(), t.clone(), SMOOTH));
        assert!((coef - 1.0).abs() < 1e-6);
        // -ln(2 * 3) + ln(5)
        let loss = scalar(dice_loss(t.clone(), t, SMOOTH));
        assert!((loss - (5.0f32.ln() - 6.0f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn disjoint_masks_have_smoothed_dice() {
        let t = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        let p = tensor(vec![0.0, 0.0, 1.0, 1.0], [1, 1, 2, 2]);
        // (0 + 1) / (4 + 1)
        assert!((scalar(dice_coef(t, p, SMOOTH)) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn dice_averages_over_samples() {
        let t = tensor(vec![1.0, 1.0, 1.0, 1.0], [2, 1, 1, 2]);
        let p = tensor(vec![1.0, 1.0, 0.0, 0.0], [2, 1, 1, 2]);
        // sample 0: 5/5, sample 1: 1/3
        let expected = (1.0 + 1.0 / 3.0) / 2.0;
        assert!((scalar(dice_coef(t, p, SMOOTH)) - expected).abs() < 1e-6);
    }

    #[test]
    fn bce_is_finite_at_saturated_predictions() {
        let t = tensor(vec![1.0, 0.0, 1.0, 0.0], [1, 1, 2, 2]);
        let p = tensor(vec![0.0, 1.0, 1.0, 0.0], [1, 1, 2, 2]);
        let value = scalar(bce(t, p));
        assert!(value.is_finite());
        assert!(value > 1.0);
    }

    #[test]
    fn combined_loss_interpolates() {
        let t = tensor(vec![1.0, 0.0, 1.0, 0.0], [1, 1, 2, 2]);
        let p = tensor(vec![0.8, 0.3, 0.6, 0.1], [1, 1, 2, 2]);
        let dice = scalar(dice_loss(t.clone(), p.clone(), SMOOTH));
        let ce = scalar(bce(t.clone(), p.clone()));
        let mixed = scalar(combined_dice_bce(t.clone(), p.clone(), 0.7));
        assert!((mixed - (0.7 * dice + 0.3 * ce)).abs() < 1e-5);
        assert!((scalar(LossKind::Bce.compute(t, p, 0.7)) - ce).abs() < 1e-6);
    }

    #[test]
    fn sensitivity_and_specificity_split_errors() {
        let t = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        let p = tensor(vec![1.0, 0.0, 0.0, 0.0], [1, 1, 2, 2]);
        // (1 + 1) / (2 + 1) and (1 + 1) / (1 + 1)
        assert!((scalar(sensitivity(t.clone(), p.clone(), SMOOTH)) - 2.0 / 3.0).abs() < 1e-6);
        assert!((scalar(specificity(t, p, SMOOTH)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn accuracy_thresholds_at_half() {
        let t = tensor(vec![1.0, 0.0, 1.0, 0.0], [1, 1, 2, 2]);
        let p = tensor(vec![0.9, 0.2, 0.4, 0.6], [1, 1, 2, 2]);
        assert!((scalar(binary_accuracy(t, p)) - 0.5).abs() < 1e-6);
    }
}
