//! Burn U-Net modules for biomedical image segmentation.
//!
//! - `UNet2d`: four-level encoder/decoder over `[batch, channels, height, width]`.
//! - `UNet3d`: three-level volumetric variant over `[batch, channels, depth, height, width]`.
//!
//! Both end in a 1x1 convolution followed by a sigmoid, so outputs are
//! per-voxel foreground probabilities. Losses, metrics and training live in
//! the `training` crate; these are plain Burn modules.

pub mod blocks;
pub mod unet2d;
pub mod unet3d;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

pub use blocks::UpsampleMode;
pub use unet2d::{UNet2d, UNet2dConfig, UNET2D_DEPTH};
pub use unet3d::{UNet3d, UNet3dConfig, UNET3D_DEPTH};

/// A segmentation network over rank-`D` tensors (`[batch, channels, spatial...]`).
pub trait SegmentationNet<B: Backend, const D: usize> {
    /// Per-voxel probabilities with the input's spatial shape.
    fn segment(&self, input: Tensor<B, D>) -> Tensor<B, D>;

    /// Number of 2x pooling steps; spatial sizes must be divisible by `2^depth`.
    fn depth(&self) -> usize;

    fn size_divisor(&self) -> usize {
        1 << self.depth()
    }
}

pub mod prelude {
    pub use super::{
        SegmentationNet, UNet2d, UNet2dConfig, UNet3d, UNet3dConfig, UpsampleMode,
    };
}
