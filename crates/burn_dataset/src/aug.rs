//! Patch augmentation: random flips and quarter turns applied identically to
//! an image patch and its mask.

use ndarray::{ArrayD, ArrayViewD, Axis};
use rand::Rng;

/// Probability policy for the random transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentationPolicy {
    /// Chance of flipping along one spatial axis.
    pub flip_prob: f64,
    /// Chance of a 90 degree rotation, drawn only after a flip happened.
    pub rotate_prob: f64,
}

impl Default for AugmentationPolicy {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            rotate_prob: 0.5,
        }
    }
}

impl AugmentationPolicy {
    pub fn disabled() -> Self {
        Self {
            flip_prob: 0.0,
            rotate_prob: 0.0,
        }
    }

    /// Draws a transform for a patch with the given spatial extent.
    ///
    /// Rotation happens in the plane of the last two spatial axes and is
    /// skipped when that plane is not square.
    pub fn draw(&self, patch: &[usize], rng: &mut impl Rng) -> PatchTransform {
        if self.flip_prob <= 0.0 || patch.is_empty() {
            return PatchTransform::Identity;
        }
        if rng.random::<f64>() >= self.flip_prob {
            return PatchTransform::Identity;
        }
        let axis = rng.random_range(0..patch.len());
        let square_plane = patch.len() >= 2 && patch[patch.len() - 2] == patch[patch.len() - 1];
        if self.rotate_prob > 0.0 && rng.random::<f64>() < self.rotate_prob && square_plane {
            PatchTransform::FlipRotate { axis }
        } else {
            PatchTransform::Flip { axis }
        }
    }
}

/// Transform applied to one patch. Axes index spatial dimensions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTransform {
    Identity,
    Flip { axis: usize },
    FlipRotate { axis: usize },
}

impl PatchTransform {
    pub fn flipped(&self) -> bool {
        !matches!(self, PatchTransform::Identity)
    }

    pub fn rotated(&self) -> bool {
        matches!(self, PatchTransform::FlipRotate { .. })
    }

    /// Applies the transform to a `[channels, spatial...]` view and returns a
    /// standard-layout copy.
    pub fn apply(&self, patch: ArrayViewD<'_, f32>) -> ArrayD<f32> {
        let mut view = patch;
        match *self {
            PatchTransform::Identity => {}
            PatchTransform::Flip { axis } => flip(&mut view, axis),
            PatchTransform::FlipRotate { axis } => {
                flip(&mut view, axis);
                rot90(&mut view);
            }
        }
        view.as_standard_layout().into_owned()
    }
}

fn flip(view: &mut ArrayViewD<'_, f32>, spatial_axis: usize) {
    view.invert_axis(Axis(spatial_axis + 1));
}

/// Counter-clockwise quarter turn in the plane of the last two axes: reverse
/// the second axis of the plane, then swap the pair.
fn rot90(view: &mut ArrayViewD<'_, f32>) {
    let rank = view.ndim();
    let (a, b) = (rank - 2, rank - 1);
    view.invert_axis(Axis(b));
    view.swap_axes(a, b);
}
