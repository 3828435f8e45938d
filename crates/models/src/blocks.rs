//! Building blocks shared by the 2D and 3D U-Nets.
//!
//! burn ships 2D pooling/upsampling modules but nothing for volumes, so the 3D
//! variants here are composed from reshapes over the spatial axes.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{
    Conv2d, Conv2dConfig, Conv3d, Conv3dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    ConvTranspose3d, ConvTranspose3dConfig,
};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, PaddingConfig2d,
    PaddingConfig3d, Relu,
};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

const CONV_KERNEL_2D: [usize; 2] = [3, 3];
const CONV_KERNEL_3D: [usize; 3] = [3, 3, 3];
const UP_KERNEL_2D: [usize; 2] = [2, 2];
const UP_KERNEL_3D: [usize; 3] = [2, 2, 2];

/// He-uniform: bound = sqrt(6 / fan_in).
pub(crate) fn he_uniform() -> Initializer {
    Initializer::KaimingUniform {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: false,
    }
}

/// How the decoder doubles spatial resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsampleMode {
    /// Learned stride-2 transposed convolution.
    Transposed,
    /// Nearest-neighbour repeat, no parameters.
    Nearest,
}

impl UpsampleMode {
    pub fn from_flag(use_upsampling: bool) -> Self {
        if use_upsampling {
            UpsampleMode::Nearest
        } else {
            UpsampleMode::Transposed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpsampleMode::Transposed => "transposed",
            UpsampleMode::Nearest => "upsampling",
        }
    }
}

/// Two 3x3 convolutions with ReLU, optional batch norm after each conv and
/// optional dropout between them.
#[derive(Debug, Module)]
pub struct ConvBlock2d<B: Backend> {
    conv_a: Conv2d<B>,
    norm_a: Option<BatchNorm<B, 2>>,
    dropout: Option<Dropout>,
    conv_b: Conv2d<B>,
    norm_b: Option<BatchNorm<B, 2>>,
    activation: Relu,
}

#[derive(Debug, Config)]
pub struct ConvBlock2dConfig {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub dropout: Option<f64>,
    #[config(default = false)]
    pub batch_norm: bool,
}

impl ConvBlock2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock2d<B> {
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, CONV_KERNEL_2D)
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(he_uniform())
                .init(device)
        };
        let norm = |features: usize| {
            self.batch_norm
                .then(|| BatchNormConfig::new(features).init(device))
        };

        ConvBlock2d {
            conv_a: conv([self.in_channels, self.mid_channels]),
            norm_a: norm(self.mid_channels),
            dropout: self.dropout.map(|p| DropoutConfig::new(p).init()),
            conv_b: conv([self.mid_channels, self.out_channels]),
            norm_b: norm(self.out_channels),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> ConvBlock2d<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.activation.forward(self.conv_a.forward(input));
        if let Some(norm) = &self.norm_a {
            x = norm.forward(x);
        }
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(x);
        }
        x = self.activation.forward(self.conv_b.forward(x));
        match &self.norm_b {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }
}

/// Volumetric counterpart of [`ConvBlock2d`]: conv -> batch norm -> ReLU, twice,
/// with optional channel-wise dropout after the first activation.
#[derive(Debug, Module)]
pub struct ConvBlock3d<B: Backend> {
    conv_a: Conv3d<B>,
    norm_a: BatchNorm<B, 3>,
    dropout: Option<SpatialDropout>,
    conv_b: Conv3d<B>,
    norm_b: BatchNorm<B, 3>,
    activation: Relu,
}

#[derive(Debug, Config)]
pub struct ConvBlock3dConfig {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub dropout: Option<f64>,
}

impl ConvBlock3dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock3d<B> {
        let conv = |channels: [usize; 2]| {
            Conv3dConfig::new(channels, CONV_KERNEL_3D)
                .with_padding(PaddingConfig3d::Same)
                .with_initializer(he_uniform())
                .init(device)
        };

        ConvBlock3d {
            conv_a: conv([self.in_channels, self.mid_channels]),
            norm_a: BatchNormConfig::new(self.mid_channels).init(device),
            dropout: self.dropout.map(SpatialDropout::new),
            conv_b: conv([self.mid_channels, self.out_channels]),
            norm_b: BatchNormConfig::new(self.out_channels).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> ConvBlock3d<B> {
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv_a.forward(input);
        let mut x = self.activation.forward(self.norm_a.forward(x));
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(x);
        }
        let x = self.conv_b.forward(x);
        self.activation.forward(self.norm_b.forward(x))
    }
}

/// Drops entire feature maps instead of single activations.
///
/// Only active while the backend records gradients, like [`Dropout`].
#[derive(Module, Clone, Debug)]
pub struct SpatialDropout {
    prob: f64,
}

impl SpatialDropout {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    /// # Shapes
    ///
    /// - input: `[batch_size, channels, ...]`
    /// - output: same as input
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob <= 0.0 {
            return input;
        }
        let dims = input.dims();
        let mut mask_shape = [1usize; D];
        mask_shape[0] = dims[0];
        mask_shape[1] = dims[1];

        let keep = 1.0 - self.prob;
        let mask = Tensor::<B, D>::random(mask_shape, Distribution::Bernoulli(keep), &input.device());
        input * mask.div_scalar(keep)
    }
}

/// Decoder upsampling for images.
#[derive(Debug, Module)]
pub struct Upsample2d<B: Backend> {
    conv: Option<ConvTranspose2d<B>>,
}

impl<B: Backend> Upsample2d<B> {
    /// `out_channels` is ignored in nearest mode, which keeps the channel count.
    pub fn new(mode: UpsampleMode, in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = match mode {
            UpsampleMode::Transposed => Some(
                ConvTranspose2dConfig::new([in_channels, out_channels], UP_KERNEL_2D)
                    .with_stride(UP_KERNEL_2D)
                    .init(device),
            ),
            UpsampleMode::Nearest => None,
        };
        Self { conv }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.conv {
            Some(conv) => conv.forward(input),
            None => upsample_nearest_2d(input),
        }
    }
}

/// Decoder upsampling for volumes.
#[derive(Debug, Module)]
pub struct Upsample3d<B: Backend> {
    conv: Option<ConvTranspose3d<B>>,
}

impl<B: Backend> Upsample3d<B> {
    pub fn new(mode: UpsampleMode, in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = match mode {
            UpsampleMode::Transposed => Some(
                ConvTranspose3dConfig::new([in_channels, out_channels], UP_KERNEL_3D)
                    .with_stride(UP_KERNEL_3D)
                    .init(device),
            ),
            UpsampleMode::Nearest => None,
        };
        Self { conv }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        match &self.conv {
            Some(conv) => conv.forward(input),
            None => upsample_nearest_3d(input),
        }
    }
}

/// Doubles height and width by repeating every pixel.
pub fn upsample_nearest_2d<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = input.dims();
    input
        .reshape([n, c, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .reshape([n, c, h * 2, w * 2])
}

/// Doubles depth, height and width by repeating every voxel.
pub fn upsample_nearest_3d<B: Backend>(input: Tensor<B, 5>) -> Tensor<B, 5> {
    let [n, c, d, h, w] = input.dims();
    input
        .reshape([n, c, d, 1, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .repeat_dim(7, 2)
        .reshape([n, c, d * 2, h * 2, w * 2])
}

/// 2x2x2 max pooling with stride 2. Odd trailing planes are dropped.
pub fn max_pool_3d<B: Backend>(input: Tensor<B, 5>) -> Tensor<B, 5> {
    let [n, c, d, h, w] = input.dims();
    let (d2, h2, w2) = (d / 2, h / 2, w / 2);
    let input = if d % 2 != 0 || h % 2 != 0 || w % 2 != 0 {
        input.slice([0..n, 0..c, 0..d2 * 2, 0..h2 * 2, 0..w2 * 2])
    } else {
        input
    };
    input
        .reshape([n, c, d2, 2, h2, 2, w2, 2])
        .max_dim(7)
        .max_dim(5)
        .max_dim(3)
        .reshape([n, c, d2, h2, w2])
}
