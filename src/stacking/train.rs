//! Stacking-model training for one held-out fold.
//!
//! Each fold runs a small state machine:
//!
//! ```text
//! Idle -> TrainEpoch -> ValidateEpoch -> CheckpointIfImproved -> TrainEpoch | Done
//! ```
//!
//! Training batches are drawn from the in-memory stack tensors in a per-epoch
//! shuffled order; validation batches are taken in order on the non-autodiff
//! backend.

use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Int;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

use super::architectures::{StackModel, StackModelConfig};
use super::builder::{FoldSplit, StackDataset};
use super::checkpoint::{CheckpointKeeper, Precision};
use super::error::Result;
use super::loss_utils;
use super::metrics::MetricMonitor;
use super::mixing::{FMix, Mixup};
use super::settings::RunOptions;

pub const LOSS: &str = "Loss";
pub const ACCURACY: &str = "Accuracy";

/// Learning rate per epoch (epochs count from 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    Constant { lr: f64 },
    /// Cosine annealing from `max` to `min`, restarting every `period` epochs.
    CosineWarmRestarts { max: f64, min: f64, period: usize },
}

impl LrSchedule {
    pub fn from_options(options: &RunOptions) -> Self {
        match options.restart_period {
            Some(period) if period > 0 => Self::CosineWarmRestarts {
                max: options.lr,
                min: options.lr_min,
                period,
            },
            _ => Self::Constant { lr: options.lr },
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::CosineWarmRestarts { max, min, period } => {
                let t = (epoch.saturating_sub(1) % period) as f64;
                min + 0.5 * (max - min) * (1.0 + (std::f64::consts::PI * t / period as f64).cos())
            }
        }
    }
}

/// How a training batch is regularized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMixing {
    /// Label-smoothed cross-entropy on the raw batch.
    Smoothing,
    Mixup,
    /// Region mixing, used once `epoch` passes the configured start.
    FMix,
}

impl BatchMixing {
    pub fn for_epoch(options: &RunOptions, epoch: usize) -> Self {
        if options.fmix && epoch > options.fmix_start_epoch {
            Self::FMix
        } else if options.mixup {
            Self::Mixup
        } else {
            Self::Smoothing
        }
    }
}

/// Mixing samplers built once per fold from the run options.
#[derive(Debug, Clone)]
pub struct Regularizers {
    mixup: Mixup,
    fmix: FMix,
    smoothing: f64,
}

impl Regularizers {
    pub fn new(options: &RunOptions) -> Result<Self> {
        Ok(Self {
            mixup: Mixup::new(options.mixup_alpha, options.smooth_label, options.num_classes)?,
            fmix: FMix::new(options.fmix_alpha, options.fmix_decay_power)?,
            smoothing: options.smooth_label,
        })
    }
}

/// Per-epoch summary kept in the fold report.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FoldReport {
    pub fold: usize,
    /// Best validation accuracy seen, or the initial threshold if never beaten.
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    pub checkpoints: Vec<PathBuf>,
    pub epochs: Vec<EpochSummary>,
}

enum LoopState {
    Idle,
    TrainEpoch {
        epoch: usize,
    },
    ValidateEpoch {
        epoch: usize,
        lr: f64,
        train: MetricMonitor,
    },
    CheckpointIfImproved {
        epoch: usize,
        lr: f64,
        train: MetricMonitor,
        valid: MetricMonitor,
    },
    Done,
}

/// Order of training rows for `epoch`.
///
/// Each epoch reads its own ChaCha stream of the run seed, so the order only
/// depends on `(seed, epoch)`.
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    shuffled(len, &mut epoch_rng(seed, epoch))
}

fn shuffled(len: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

fn epoch_rng(seed: u64, epoch: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(epoch as u64);
    rng
}

fn to_autodiff<B: AutodiffBackend>(
    (inputs, targets): (Tensor<B::InnerBackend, 4>, Tensor<B::InnerBackend, 1, Int>),
) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
    (Tensor::from_inner(inputs), Tensor::from_inner(targets))
}

/// One pass over `data` in training mode.
///
/// The loss is divided by the gradient accumulation factor and the optimizer
/// steps after every batch.
pub fn train_epoch<B, O>(
    model: StackModel<B>,
    optimizer: &mut O,
    data: &StackDataset<B::InnerBackend>,
    epoch: usize,
    lr: f64,
    regularizers: &Regularizers,
    options: &RunOptions,
) -> (StackModel<B>, MetricMonitor)
where
    B: AutodiffBackend,
    O: Optimizer<StackModel<B>, B>,
{
    let mut model = model.train();
    let mut monitor = MetricMonitor::new();
    let mut rng = epoch_rng(options.seed, epoch);
    let mixing = BatchMixing::for_epoch(options, epoch);
    let accumulation = options.gradient_accumulation_steps.max(1) as f32;

    let order = shuffled(data.len(), &mut rng);

    for chunk in order.chunks(options.batch_size.max(1)) {
        let (inputs, targets) = to_autodiff::<B>(data.batch(chunk));

        let (loss, accuracy) = match mixing {
            BatchMixing::FMix => {
                let mix = regularizers.fmix.apply(inputs, targets, &mut rng);
                let output = model.forward(mix.inputs.clone());
                let accuracy = loss_utils::accuracy(output.clone(), mix.targets_a.clone());
                (mix.loss(output), accuracy)
            }
            BatchMixing::Mixup => {
                let mixed = regularizers.mixup.apply(inputs, targets, &mut rng);
                let output = model.forward(mixed.inputs);
                let accuracy = loss_utils::soft_accuracy(output.clone(), mixed.soft_targets.clone());
                (loss_utils::soft_target_cross_entropy(output, mixed.soft_targets), accuracy)
            }
            BatchMixing::Smoothing => {
                let output = model.forward(inputs);
                let accuracy = loss_utils::accuracy(output.clone(), targets.clone());
                (
                    loss_utils::label_smoothing_cross_entropy(output, targets, regularizers.smoothing),
                    accuracy,
                )
            }
        };
        let loss = loss / accumulation;

        monitor.update(LOSS, loss_utils::loss_value(&loss, "training") as f64);
        monitor.update(ACCURACY, accuracy);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(lr, model, grads);
    }

    tracing::debug!(epoch, ?mixing, "Train.      {monitor}");
    (model, monitor)
}

/// One pass over `data` in evaluation mode with plain cross-entropy.
pub fn validate_epoch<B: Backend>(
    model: &StackModel<B>,
    data: &StackDataset<B>,
    batch_size: usize,
) -> MetricMonitor {
    let mut monitor = MetricMonitor::new();
    let order: Vec<usize> = (0..data.len()).collect();
    for chunk in order.chunks(batch_size.max(1)) {
        let (inputs, targets) = data.batch(chunk);
        let output = model.forward(inputs);
        let loss = loss_utils::cross_entropy(output.clone(), targets.clone());
        monitor.update(LOSS, loss_utils::loss_value(&loss, "validation") as f64);
        monitor.update(ACCURACY, loss_utils::accuracy(output, targets));
    }
    monitor
}

/// Train a stacking model on `split`, checkpointing each improvement.
pub fn run_fold<B: AutodiffBackend>(
    split: &FoldSplit<B::InnerBackend>,
    options: &RunOptions,
    weights_dir: &Path,
    device: &B::Device,
) -> Result<FoldReport> {
    let [_, num_models, num_tta, num_classes] = split.train.inputs.dims();
    let model = StackModelConfig::new(num_models, num_tta, num_classes)
        .with_hidden_size(options.hidden_size)
        .with_dropout(options.dropout)
        .init::<B>(device)?;
    let optimizer = AdamWConfig::new()
        .with_weight_decay(options.weight_decay)
        .init::<B, StackModel<B>>();
    run_fold_with(model, optimizer, split, options, weights_dir)
}

/// [`run_fold`] with a caller-provided model and optimizer.
pub fn run_fold_with<B, O>(
    model: StackModel<B>,
    mut optimizer: O,
    split: &FoldSplit<B::InnerBackend>,
    options: &RunOptions,
    weights_dir: &Path,
) -> Result<FoldReport>
where
    B: AutodiffBackend,
    O: Optimizer<StackModel<B>, B>,
{
    let fold = split.fold;
    let regularizers = Regularizers::new(options)?;
    let schedule = LrSchedule::from_options(options);
    let mut keeper = CheckpointKeeper::new(
        weights_dir,
        &options.model,
        fold,
        Precision::from_fp16(options.fp16),
        options.initial_best_accuracy,
    );
    keeper.clear_stale()?;
    let mut epochs = Vec::with_capacity(options.epochs);
    let mut model = model;
    let mut state = LoopState::Idle;

    loop {
        state = match state {
            LoopState::Idle => {
                tracing::info!(
                    fold,
                    train = split.train.len(),
                    valid = split.valid.len(),
                    epochs = options.epochs,
                    "training stacking model"
                );
                if options.epochs == 0 {
                    LoopState::Done
                } else {
                    LoopState::TrainEpoch { epoch: 1 }
                }
            }
            LoopState::TrainEpoch { epoch } => {
                let lr = schedule.lr_at(epoch);
                let (trained, train) =
                    train_epoch(model, &mut optimizer, &split.train, epoch, lr, &regularizers, options);
                model = trained;
                LoopState::ValidateEpoch { epoch, lr, train }
            }
            LoopState::ValidateEpoch { epoch, lr, train } => {
                let eval_model = model.valid().eval();
                let valid = validate_epoch(&eval_model, &split.valid, options.batch_size);
                tracing::info!(fold, epoch, "Epoch: {epoch}. Train.      {train}");
                tracing::info!(fold, epoch, "Epoch: {epoch}. Validation. {valid}");
                LoopState::CheckpointIfImproved {
                    epoch,
                    lr,
                    train,
                    valid,
                }
            }
            LoopState::CheckpointIfImproved {
                epoch,
                lr,
                train,
                valid,
            } => {
                let checkpoint = keeper.observe::<B, StackModel<B>, O>(
                    epoch,
                    valid.avg(LOSS) as f32,
                    valid.avg(ACCURACY),
                    &model,
                    &optimizer,
                )?;
                epochs.push(EpochSummary {
                    epoch,
                    lr,
                    train_loss: train.avg(LOSS),
                    train_accuracy: train.avg(ACCURACY),
                    valid_loss: valid.avg(LOSS),
                    valid_accuracy: valid.avg(ACCURACY),
                    checkpoint,
                });
                if epoch >= options.epochs {
                    LoopState::Done
                } else {
                    LoopState::TrainEpoch { epoch: epoch + 1 }
                }
            }
            LoopState::Done => break,
        };
    }

    tracing::info!(
        fold,
        best_accuracy = keeper.best_accuracy(),
        best_epoch = ?keeper.best_epoch(),
        checkpoints = keeper.written().len(),
        "fold finished"
    );
    Ok(FoldReport {
        fold,
        best_accuracy: keeper.best_accuracy(),
        best_epoch: keeper.best_epoch(),
        checkpoints: keeper.written().to_vec(),
        epochs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let options = RunOptions::default();
        let schedule = LrSchedule::from_options(&options);
        assert_eq!(schedule.lr_at(1), 1e-3);
        assert_eq!(schedule.lr_at(77), 1e-3);
    }

    #[test]
    fn test_cosine_restarts() {
        let options = RunOptions {
            restart_period: Some(10),
            lr: 1.0,
            lr_min: 0.0,
            ..RunOptions::default()
        };
        let schedule = LrSchedule::from_options(&options);
        assert_eq!(schedule.lr_at(1), 1.0);
        assert!((schedule.lr_at(6) - 0.5).abs() < 1e-12);
        assert_eq!(schedule.lr_at(11), 1.0);
        assert!(schedule.lr_at(10) < schedule.lr_at(9));
    }

    #[test]
    fn test_mixing_selection() {
        let mut options = RunOptions::default();
        assert_eq!(BatchMixing::for_epoch(&options, 50), BatchMixing::Mixup);

        options.fmix = true;
        assert_eq!(BatchMixing::for_epoch(&options, 10), BatchMixing::Mixup);
        assert_eq!(BatchMixing::for_epoch(&options, 11), BatchMixing::FMix);

        options.fmix = false;
        options.mixup = false;
        assert_eq!(BatchMixing::for_epoch(&options, 1), BatchMixing::Smoothing);
    }

    #[test]
    fn test_epoch_order_depends_on_seed_and_epoch() {
        let a = epoch_order(50, 42, 1);
        assert_eq!(a, epoch_order(50, 42, 1));
        assert_ne!(a, epoch_order(50, 42, 2));
        assert_ne!(a, epoch_order(50, 43, 1));

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }
}
