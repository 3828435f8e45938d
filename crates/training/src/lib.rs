#![recursion_limit = "256"]

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod jsonl;
pub mod loss;
pub mod metrics;
pub mod settings;
pub mod util;

pub use checkpoint::OutputLayout;
pub use dataset::{array_to_tensor, tensor_to_array};
pub use error::{TrainError, TrainResult};
pub use evaluate::{evaluate, Evaluation};
pub use loss::LossKind;
pub use metrics::{BatchMetrics, EpochMetrics, MetricAccumulator};
pub use models::{UNet2d, UNet2dConfig, UNet3d, UNet3dConfig, UpsampleMode};
pub use settings::{ModelKind, TrainSettings};
pub use util::{run_eval, run_train, EvalArgs, TrainArgs, TrainReport};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
