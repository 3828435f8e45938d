use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{he_uniform, ConvBlock2d, ConvBlock2dConfig, Upsample2d, UpsampleMode};
use crate::SegmentationNet;

/// Number of 2x2 pooling steps between input and bottleneck.
pub const UNET2D_DEPTH: usize = 4;

#[derive(Config, Debug)]
pub struct UNet2dConfig {
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 1)]
    pub num_classes: usize,
    /// Filters in the first encoder level; doubled at each level below.
    #[config(default = 32)]
    pub base_filters: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
    #[config(default = false)]
    pub batch_norm: bool,
    #[config(default = "UpsampleMode::Transposed")]
    pub upsample: UpsampleMode,
}

/// Four-level 2D U-Net producing per-pixel probabilities.
///
/// # Shapes
///
/// - input: `[batch, in_channels, height, width]`, height and width divisible by 16
/// - output: `[batch, num_classes, height, width]`
#[derive(Module, Debug)]
pub struct UNet2d<B: Backend> {
    enc1: ConvBlock2d<B>,
    enc2: ConvBlock2d<B>,
    enc3: ConvBlock2d<B>,
    enc4: ConvBlock2d<B>,
    bottom: ConvBlock2d<B>,
    pool: MaxPool2d,
    up4: Upsample2d<B>,
    dec4: ConvBlock2d<B>,
    up3: Upsample2d<B>,
    dec3: ConvBlock2d<B>,
    up2: Upsample2d<B>,
    dec2: ConvBlock2d<B>,
    up1: Upsample2d<B>,
    dec1: ConvBlock2d<B>,
    head: Conv2d<B>,
}

impl UNet2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet2d<B> {
        let f = self.base_filters.max(1);
        let block = |input: usize, output: usize, dropout: Option<f64>| {
            ConvBlock2dConfig::new(input, output, output)
                .with_dropout(dropout)
                .with_batch_norm(self.batch_norm)
                .init(device)
        };
        let dropout = Some(self.dropout).filter(|p| *p > 0.0);

        // Transposed convolutions halve the channel count, nearest upsampling keeps it.
        let up = |input: usize, output: usize| Upsample2d::new(self.upsample, input, output, device);
        let up_out = |input: usize, output: usize| match self.upsample {
            UpsampleMode::Transposed => output,
            UpsampleMode::Nearest => input,
        };

        UNet2d {
            enc1: block(self.in_channels, f, None),
            enc2: block(f, 2 * f, None),
            enc3: block(2 * f, 4 * f, dropout),
            enc4: block(4 * f, 8 * f, dropout),
            bottom: block(8 * f, 16 * f, None),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            up4: up(16 * f, 8 * f),
            dec4: block(up_out(16 * f, 8 * f) + 8 * f, 8 * f, None),
            up3: up(8 * f, 4 * f),
            dec3: block(up_out(8 * f, 4 * f) + 4 * f, 4 * f, None),
            up2: up(4 * f, 2 * f),
            dec2: block(up_out(4 * f, 2 * f) + 2 * f, 2 * f, None),
            up1: up(2 * f, f),
            dec1: block(up_out(2 * f, f) + f, f, None),
            head: Conv2dConfig::new([f, self.num_classes], [1, 1])
                .with_initializer(he_uniform())
                .init(device),
        }
    }
}

impl<B: Backend> UNet2d<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x1 = self.enc1.forward(input);
        let x2 = self.enc2.forward(self.pool.forward(x1.clone()));
        let x3 = self.enc3.forward(self.pool.forward(x2.clone()));
        let x4 = self.enc4.forward(self.pool.forward(x3.clone()));
        let x5 = self.bottom.forward(self.pool.forward(x4.clone()));

        let x = self.dec4.forward(Tensor::cat(vec![self.up4.forward(x5), x4], 1));
        let x = self.dec3.forward(Tensor::cat(vec![self.up3.forward(x), x3], 1));
        let x = self.dec2.forward(Tensor::cat(vec![self.up2.forward(x), x2], 1));
        let x = self.dec1.forward(Tensor::cat(vec![self.up1.forward(x), x1], 1));
        sigmoid(self.head.forward(x))
    }
}

impl<B: Backend> SegmentationNet<B, 4> for UNet2d<B> {
    fn segment(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(input)
    }

    fn depth(&self) -> usize {
        UNET2D_DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny(upsample: UpsampleMode) -> UNet2d<TestBackend> {
        UNet2dConfig::new()
            .with_base_filters(2)
            .with_upsample(upsample)
            .init(&Default::default())
    }

    #[test]
    fn transposed_output_matches_input_extent() {
        let model = tiny(UpsampleMode::Transposed);
        let out = model.forward(Tensor::ones([2, 1, 16, 32], &Default::default()));
        assert_eq!(out.dims(), [2, 1, 16, 32]);
    }

    #[test]
    fn nearest_output_is_a_probability_map() {
        let model = tiny(UpsampleMode::Nearest);
        let out = model.forward(Tensor::random(
            [1, 1, 16, 16],
            burn::tensor::Distribution::Default,
            &Default::default(),
        ));
        assert_eq!(out.dims(), [1, 1, 16, 16]);
        let values = out.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn upsample_modes_differ_in_parameter_count() {
        let transposed = tiny(UpsampleMode::Transposed).num_params();
        let nearest = tiny(UpsampleMode::Nearest).num_params();
        assert_ne!(transposed, nearest);
    }

    #[test]
    fn multi_class_head() {
        let model: UNet2d<TestBackend> = UNet2dConfig::new()
            .with_base_filters(2)
            .with_in_channels(3)
            .with_num_classes(2)
            .with_batch_norm(true)
            .init(&Default::default());
        let out = model.forward(Tensor::zeros([1, 3, 16, 16], &Default::default()));
        assert_eq!(out.dims(), [1, 2, 16, 16]);
    }
}
