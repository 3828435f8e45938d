use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{
    he_uniform, max_pool_3d, ConvBlock3d, ConvBlock3dConfig, Upsample3d, UpsampleMode,
};
use crate::SegmentationNet;

pub const UNET3D_DEPTH: usize = 3;

#[derive(Config, Debug)]
pub struct UNet3dConfig {
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 1)]
    pub num_classes: usize,
    #[config(default = 32)]
    pub base_filters: usize,
    /// Channel-wise dropout rate used in the two deepest levels.
    #[config(default = 0.2)]
    pub dropout: f64,
    #[config(default = "UpsampleMode::Transposed")]
    pub upsample: UpsampleMode,
}

/// Three-level volumetric U-Net. Each level widens inside the block
/// (`f -> 2f`), so both upsampling modes yield the same channel counts.
///
/// # Shapes
///
/// - input: `[batch, in_channels, depth, height, width]`, spatial axes divisible by 8
/// - output: `[batch, num_classes, depth, height, width]`
#[derive(Module, Debug)]
pub struct UNet3d<B: Backend> {
    enc1: ConvBlock3d<B>,
    enc2: ConvBlock3d<B>,
    enc3: ConvBlock3d<B>,
    bottom: ConvBlock3d<B>,
    up3: Upsample3d<B>,
    dec3: ConvBlock3d<B>,
    up2: Upsample3d<B>,
    dec2: ConvBlock3d<B>,
    up1: Upsample3d<B>,
    dec1: ConvBlock3d<B>,
    head: Conv3d<B>,
}

impl UNet3dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet3d<B> {
        let f = self.base_filters.max(1);
        let dropout = Some(self.dropout).filter(|p| *p > 0.0);
        let block = |input: usize, mid: usize, output: usize, dropout: Option<f64>| {
            ConvBlock3dConfig::new(input, mid, output)
                .with_dropout(dropout)
                .init(device)
        };
        let up = |channels: usize| Upsample3d::new(self.upsample, channels, channels, device);

        UNet3d {
            enc1: block(self.in_channels, f, 2 * f, None),
            enc2: block(2 * f, 2 * f, 4 * f, None),
            enc3: block(4 * f, 4 * f, 8 * f, dropout),
            bottom: block(8 * f, 8 * f, 16 * f, dropout),
            up3: up(16 * f),
            dec3: block(16 * f + 8 * f, 8 * f, 8 * f, None),
            up2: up(8 * f),
            dec2: block(8 * f + 4 * f, 4 * f, 4 * f, None),
            up1: up(4 * f),
            dec1: block(4 * f + 2 * f, 2 * f, 2 * f, None),
            head: Conv3dConfig::new([2 * f, self.num_classes], [1, 1, 1])
                .with_initializer(he_uniform())
                .init(device),
        }
    }
}

impl<B: Backend> UNet3d<B> {
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x1 = self.enc1.forward(input);
        let x2 = self.enc2.forward(max_pool_3d(x1.clone()));
        let x3 = self.enc3.forward(max_pool_3d(x2.clone()));
        let x4 = self.bottom.forward(max_pool_3d(x3.clone()));

        let x = self.dec3.forward(Tensor::cat(vec![self.up3.forward(x4), x3], 1));
        let x = self.dec2.forward(Tensor::cat(vec![self.up2.forward(x), x2], 1));
        let x = self.dec1.forward(Tensor::cat(vec![self.up1.forward(x), x1], 1));
        sigmoid(self.head.forward(x))
    }
}

impl<B: Backend> SegmentationNet<B, 5> for UNet3d<B> {
    fn segment(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        self.forward(input)
    }

    fn depth(&self) -> usize {
        UNET3D_DEPTH
    }
}
