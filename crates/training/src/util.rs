use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn_dataset::{
    load_splits, summarize_with_thresholds, write_predictions, DatasetSplits, LoadOptions,
    PatchSampler, SamplerConfig, SegmentationSet, ValidationOutcome, ValidationThresholds,
};
use cli_support::{configure_thread_pool, init_tracing, BackendKind, RuntimeArgs, RuntimeOpts};
use models::{SegmentationNet, UNet2d, UNet2dConfig, UNet3d, UNet3dConfig};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::checkpoint::{
    load_checkpoint, load_model_config, save_checkpoint, save_model_config, CheckpointMonitor,
    OutputLayout,
};
use crate::dataset::collate;
use crate::evaluate::{check_divisible, evaluate, Evaluation};
use crate::jsonl::JsonlSink;
use crate::loss::LossKind;
use crate::metrics::{BatchMetrics, EpochMetrics, MetricAccumulator};
use crate::settings::{ModelKind, TrainSettings};
use crate::TrainBackend;
use clap::Parser;

type ADBackend = Autodiff<TrainBackend>;
type Device = <TrainBackend as Backend>::Device;

#[derive(Parser, Debug, Clone)]
#[command(name = "train", about = "Train a 2D or 3D U-Net on an npz segmentation archive")]
pub struct TrainArgs {
    /// TOML settings file (falls back to $UNET_TRAIN_CONFIG, then unet-train.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub model: Option<ModelKind>,
    /// Directory holding the archive.
    #[arg(long)]
    pub data_path: Option<PathBuf>,
    /// Archive file name inside --data-path.
    #[arg(long)]
    pub data_file: Option<String>,
    /// Output directory for checkpoints, metrics and predictions.
    #[arg(long)]
    pub out_path: Option<PathBuf>,
    /// Use nearest-neighbour upsampling instead of transposed convolutions.
    #[arg(long)]
    pub use_upsampling: bool,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub patch_height: Option<usize>,
    #[arg(long)]
    pub patch_width: Option<usize>,
    /// Volume patch depth (3D only).
    #[arg(long)]
    pub patch_depth: Option<usize>,
    #[arg(long)]
    pub num_input_channels: Option<usize>,
    #[arg(long)]
    pub num_output_channels: Option<usize>,
    #[arg(long)]
    pub base_filters: Option<usize>,
    #[arg(long)]
    pub dropout: Option<f64>,
    /// Batch norm after each 2D convolution.
    #[arg(long)]
    pub batch_norm: bool,
    #[arg(long, value_enum)]
    pub loss: Option<LossKind>,
    /// Dice share of the dice-bce objective.
    #[arg(long)]
    pub dice_weight: Option<f32>,
    #[arg(long)]
    pub weight_decay: Option<f32>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Disable random flips/rotations.
    #[arg(long)]
    pub no_augment: bool,
    /// Write per-step timings to the timeline file.
    #[arg(long)]
    pub trace: bool,
    /// Log the model structure before training.
    #[arg(long)]
    pub print_model: bool,
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl TrainArgs {
    /// Overlays the flags that were given onto `settings`.
    pub fn apply(&self, settings: &mut TrainSettings) {
        if let Some(v) = self.model {
            settings.model = v;
        }
        if let Some(v) = &self.data_path {
            settings.data_path = v.clone();
        }
        if let Some(v) = &self.data_file {
            settings.data_file = v.clone();
        }
        if let Some(v) = &self.out_path {
            settings.out_path = v.clone();
        }
        settings.use_upsampling |= self.use_upsampling;
        settings.batch_norm |= self.batch_norm;
        settings.trace |= self.trace;
        settings.print_model |= self.print_model;
        if self.no_augment {
            settings.augment = false;
        }
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field {
                    settings.$field = v;
                })*
            };
        }
        overlay!(
            batch_size,
            epochs,
            learning_rate,
            patch_height,
            patch_width,
            num_input_channels,
            num_output_channels,
            base_filters,
            dropout,
            loss,
            dice_weight
        );
        if self.patch_depth.is_some() {
            settings.patch_depth = self.patch_depth;
        }
        if self.weight_decay.is_some() {
            settings.weight_decay = self.weight_decay;
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        if self.runtime.num_threads.is_some() {
            settings.num_threads = self.runtime.num_threads;
        }
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub checkpoint: PathBuf,
    pub best_loss: f32,
    pub best_epoch: usize,
    pub epochs: usize,
    pub test: EpochMetrics,
    pub predictions: PathBuf,
    pub images_per_sec: f64,
    pub elapsed_secs: f64,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainReport> {
    let runtime = RuntimeOpts::from(&args.runtime);
    init_tracing(runtime.verbose);

    let mut settings = TrainSettings::resolve(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;
    validate_backend_choice(runtime.backend)?;

    let threads = configure_thread_pool(settings.num_threads);
    let layout = OutputLayout::new(&settings, threads);
    layout.create_dirs()?;
    tracing::info!(
        model = ?settings.model,
        backend = runtime.backend.as_str(),
        upsample = settings.upsample_mode().as_str(),
        batch_size = settings.batch_size,
        epochs = settings.epochs,
        lr = settings.learning_rate,
        loss = settings.loss.as_str(),
        threads,
        "starting training"
    );

    let splits = load_checked_splits(&settings)?;
    let started = Instant::now();
    let device = Device::default();
    let report = match settings.model {
        ModelKind::Unet2d => {
            let config = settings.unet2d_config();
            save_model_config(&config, &layout.model_config)?;
            train_network::<UNet2d<ADBackend>, 4>(&settings, &splits, &layout, &device, |d| {
                config.init(d)
            })?
        }
        ModelKind::Unet3d => {
            let config = settings.unet3d_config();
            save_model_config(&config, &layout.model_config)?;
            train_network::<UNet3d<ADBackend>, 5>(&settings, &splits, &layout, &device, |d| {
                config.init(d)
            })?
        }
    };
    let report = TrainReport {
        elapsed_secs: started.elapsed().as_secs_f64(),
        ..report
    };
    tracing::info!(
        elapsed_secs = %format!("{:.1}", report.elapsed_secs),
        checkpoint = %report.checkpoint.display(),
        "training finished"
    );
    Ok(report)
}

fn load_checked_splits(settings: &TrainSettings) -> anyhow::Result<DatasetSplits> {
    let path = settings.data_file_path();
    let opts = LoadOptions {
        spatial_dims: settings.model.spatial_dims(),
        num_input_channels: Some(settings.num_input_channels),
    };
    let splits = load_splits(&path, &opts)?;
    tracing::info!(
        path = %path.display(),
        train = ?splits.train.images.shape(),
        test = ?splits.test.images.shape(),
        "loaded dataset"
    );

    let thresholds = ValidationThresholds::from_env();
    for (name, set) in [("train", &splits.train), ("test", &splits.test)] {
        let report = summarize_with_thresholds(set, &thresholds);
        tracing::debug!(split = name, outcome = report.outcome.as_str(), "dataset validation");
        match report.outcome {
            ValidationOutcome::Pass => {}
            ValidationOutcome::Warn => {
                tracing::warn!(split = name, reasons = ?report.reasons, "dataset validation warning")
            }
            ValidationOutcome::Fail => anyhow::bail!(
                "{name} split failed validation: {}",
                report.reasons.join("; ")
            ),
        }
        if set.mask_channels() != settings.num_output_channels {
            anyhow::bail!(
                "{name} masks have {} channels, model predicts {}",
                set.mask_channels(),
                settings.num_output_channels
            );
        }
    }
    Ok(splits)
}

fn train_network<M, const D: usize>(
    settings: &TrainSettings,
    splits: &DatasetSplits,
    layout: &OutputLayout,
    device: &Device,
    build: impl Fn(&Device) -> M,
) -> anyhow::Result<TrainReport>
where
    M: AutodiffModule<ADBackend> + SegmentationNet<ADBackend, D> + std::fmt::Display,
    M::InnerModule: SegmentationNet<TrainBackend, D>,
{
    let mut model = build(device);
    if settings.print_model {
        tracing::info!("model:\n{model}");
    }
    tracing::info!(params = model.num_params(), "model ready");

    let patch = settings.patch_shape(splits.train.spatial_shape());
    check_divisible(&patch, model.size_divisor())?;
    check_divisible(splits.test.spatial_shape(), model.size_divisor())?;

    let mut sampler = PatchSampler::new(
        &splits.train,
        SamplerConfig {
            batch_size: settings.batch_size,
            patch,
            augment: settings.augment,
            seed: settings.seed,
        },
    )?;

    let mut optim = AdamConfig::new()
        .with_weight_decay(settings.effective_weight_decay().map(WeightDecayConfig::new))
        .init();
    let mut metrics_log = JsonlSink::open(&layout.metrics)?;
    tracing::info!(path = %metrics_log.path().display(), "writing epoch metrics");
    let mut timeline = if settings.trace {
        Some(JsonlSink::open(&layout.timeline)?)
    } else {
        None
    };

    let steps_per_epoch = (splits.train.len() / settings.batch_size).max(1);
    let mut monitor = CheckpointMonitor::new();

    for epoch in 0..settings.epochs {
        let epoch_start = Instant::now();
        let mut acc = MetricAccumulator::new();
        for step in 0..steps_per_epoch {
            let step_start = Instant::now();
            let batch = sampler.next_batch();
            let sample_ms = step_start.elapsed().as_secs_f64() * 1e3;

            let batch = collate::<ADBackend, D>(&batch, device)?;
            let batch_size = batch.batch_size();
            let preds = model.segment(batch.images);
            let loss = settings
                .loss
                .compute(batch.masks.clone(), preds.clone(), settings.dice_weight);
            let metrics = BatchMetrics::compute(loss.clone(), batch.masks, preds)?;
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(settings.learning_rate, model, grads);
            acc.push(&metrics, batch_size);

            if let Some(sink) = timeline.as_mut() {
                sink.append(&json!({
                    "epoch": epoch,
                    "step": step,
                    "batch_size": batch_size,
                    "sample_ms": sample_ms,
                    "step_ms": step_start.elapsed().as_secs_f64() * 1e3,
                    "loss": metrics.loss,
                }))?;
            }
            tracing::debug!(epoch, step, loss = metrics.loss, "step");
        }
        let train = acc.finish();

        let valid = evaluate(
            &model.valid(),
            &splits.test,
            settings.batch_size,
            settings.loss,
            settings.dice_weight,
            false,
            device,
        )?;

        let previous = monitor.best();
        let improved = monitor.improved(train.loss);
        if improved {
            tracing::info!(
                epoch,
                from = previous,
                to = train.loss,
                path = %layout.checkpoint.display(),
                "loss improved, saving checkpoint"
            );
            save_checkpoint(&model, &layout.checkpoint)?;
        }

        metrics_log.append(&json!({
            "epoch": epoch,
            "train": train,
            "test": valid.metrics,
            "improved": improved,
            "epoch_secs": epoch_start.elapsed().as_secs_f64(),
        }))?;
        metrics_log.flush()?;
        tracing::info!(
            epoch,
            loss = %format!("{:.4}", train.loss),
            dice = %format!("{:.4}", train.dice),
            test_loss = %format!("{:.4}", valid.metrics.loss),
            test_dice = %format!("{:.4}", valid.metrics.dice),
            "epoch done"
        );
    }
    if let Some(sink) = timeline.as_mut() {
        sink.flush()?;
    }

    // Reload the best weights for the final predictions.
    let best = load_checkpoint(build(device), &layout.checkpoint, device)?.valid();
    let eval = evaluate(
        &best,
        &splits.test,
        settings.batch_size,
        settings.loss,
        settings.dice_weight,
        true,
        device,
    )?;
    let predictions = save_predictions(&eval, &layout.predictions)?;
    log_evaluation(&eval, &splits.test);

    Ok(TrainReport {
        checkpoint: layout.checkpoint.clone(),
        best_loss: monitor.best(),
        best_epoch: monitor.best_epoch(),
        epochs: settings.epochs,
        test: eval.metrics,
        predictions,
        images_per_sec: eval.images_per_sec,
        elapsed_secs: 0.0,
    })
}

fn save_predictions(eval: &Evaluation, path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(preds) = &eval.predictions {
        write_predictions(path, preds)?;
        tracing::info!(path = %path.display(), "saved predictions");
    }
    Ok(path.to_path_buf())
}

fn log_evaluation(eval: &Evaluation, set: &SegmentationSet) {
    tracing::info!(
        samples = set.len(),
        loss = %format!("{:.4}", eval.metrics.loss),
        accuracy = %format!("{:.4}", eval.metrics.accuracy),
        dice = %format!("{:.4}", eval.metrics.dice),
        sensitivity = %format!("{:.4}", eval.metrics.sensitivity),
        specificity = %format!("{:.4}", eval.metrics.specificity),
        "test evaluation"
    );
    tracing::info!(
        images_per_sec = %format!("{:.2}", eval.images_per_sec),
        elapsed_secs = %format!("{:.3}", eval.elapsed_secs),
        "inference throughput"
    );
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

#[derive(Parser, Debug, Clone)]
#[command(name = "eval", about = "Evaluate a saved U-Net checkpoint on the test split")]
pub struct EvalArgs {
    /// TOML settings file used for training.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub model: Option<ModelKind>,
    #[arg(long)]
    pub data_path: Option<PathBuf>,
    #[arg(long)]
    pub data_file: Option<String>,
    #[arg(long)]
    pub out_path: Option<PathBuf>,
    #[arg(long)]
    pub use_upsampling: bool,
    /// Checkpoint path (defaults to the training output name).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Also write predictions next to the checkpoint.
    #[arg(long)]
    pub write_predictions: bool,
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl EvalArgs {
    fn apply(&self, settings: &mut TrainSettings) {
        if let Some(v) = self.model {
            settings.model = v;
        }
        if let Some(v) = &self.data_path {
            settings.data_path = v.clone();
        }
        if let Some(v) = &self.data_file {
            settings.data_file = v.clone();
        }
        if let Some(v) = &self.out_path {
            settings.out_path = v.clone();
        }
        if let Some(v) = self.batch_size {
            settings.batch_size = v;
        }
        settings.use_upsampling |= self.use_upsampling;
        if self.runtime.num_threads.is_some() {
            settings.num_threads = self.runtime.num_threads;
        }
    }
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<EpochMetrics> {
    let runtime = RuntimeOpts::from(&args.runtime);
    init_tracing(runtime.verbose);

    let mut settings = TrainSettings::resolve(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;
    validate_backend_choice(runtime.backend)?;

    let threads = configure_thread_pool(settings.num_threads);
    let layout = OutputLayout::new(&settings, threads);
    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| layout.checkpoint.clone());
    let splits = load_checked_splits(&settings)?;
    let device = Device::default();

    let eval = match settings.model {
        ModelKind::Unet2d => {
            let config = load_model_config::<UNet2dConfig>(&layout.model_config)?
                .unwrap_or_else(|| settings.unet2d_config());
            let model = load_checkpoint(config.init::<TrainBackend>(&device), &checkpoint, &device)?;
            evaluate(
                &model,
                &splits.test,
                settings.batch_size,
                settings.loss,
                settings.dice_weight,
                args.write_predictions,
                &device,
            )?
        }
        ModelKind::Unet3d => {
            let config = load_model_config::<UNet3dConfig>(&layout.model_config)?
                .unwrap_or_else(|| settings.unet3d_config());
            let model = load_checkpoint(config.init::<TrainBackend>(&device), &checkpoint, &device)?;
            evaluate(
                &model,
                &splits.test,
                settings.batch_size,
                settings.loss,
                settings.dice_weight,
                args.write_predictions,
                &device,
            )?
        }
    };
    if args.write_predictions {
        save_predictions(&eval, &layout.predictions)?;
    }
    log_evaluation(&eval, &splits.test);
    Ok(eval.metrics)
}
