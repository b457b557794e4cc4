//! Batch mixing regularizers: mixup with smoothed soft targets, and FMix
//! region mixing with Fourier-sampled binary masks.

use burn::prelude::*;
use burn::tensor::Int;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution, StandardNormal};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use super::error::{Result, StackError};
use super::loss_utils::{cross_entropy, smoothed_one_hot};
use super::tta::reverse_dim;

fn beta(alpha: f64) -> Result<Beta<f64>> {
    Beta::new(alpha, alpha)
        .map_err(|err| StackError::config(format!("invalid mixing alpha {alpha}: {err}")))
}

#[derive(Debug, Clone)]
pub struct MixedBatch<B: Backend> {
    pub inputs: Tensor<B, 4>,
    /// `[batch, classes]`, rows sum to one.
    pub soft_targets: Tensor<B, 2>,
    pub lam: f64,
}

/// Batch-level mixup: every sample is blended with its mirror in the batch
/// (`x[i]` with `x[n - 1 - i]`) using one ratio drawn from `Beta(alpha, alpha)`.
#[derive(Debug, Clone)]
pub struct Mixup {
    beta: Beta<f64>,
    smoothing: f64,
    num_classes: usize,
}

impl Mixup {
    pub fn new(alpha: f64, smoothing: f64, num_classes: usize) -> Result<Self> {
        Ok(Self {
            beta: beta(alpha)?,
            smoothing,
            num_classes,
        })
    }

    pub fn apply<B: Backend, R: Rng + ?Sized>(
        &self,
        inputs: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        rng: &mut R,
    ) -> MixedBatch<B> {
        let lam = self.beta.sample(rng);
        self.apply_with_ratio(inputs, targets, lam)
    }

    pub fn apply_with_ratio<B: Backend>(
        &self,
        inputs: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        lam: f64,
    ) -> MixedBatch<B> {
        let mirrored = reverse_dim(inputs.clone(), 0);
        let inputs = inputs * lam as f32 + mirrored * (1.0 - lam) as f32;

        let y1 = smoothed_one_hot(targets.clone(), self.num_classes, self.smoothing);
        let y2 = smoothed_one_hot(reverse_dim(targets, 0), self.num_classes, self.smoothing);
        let soft_targets = y1 * lam as f32 + y2 * (1.0 - lam) as f32;

        MixedBatch {
            inputs,
            soft_targets,
            lam,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionMix<B: Backend> {
    pub inputs: Tensor<B, 4>,
    pub targets_a: Tensor<B, 1, Int>,
    pub targets_b: Tensor<B, 1, Int>,
    pub lam: f64,
}

impl<B: Backend> RegionMix<B> {
    /// `lam * CE(out, y_a) + (1 - lam) * CE(out, y_b)`
    pub fn loss(&self, logits: Tensor<B, 2>) -> Tensor<B, 1> {
        let a = cross_entropy(logits.clone(), self.targets_a.clone());
        let b = cross_entropy(logits, self.targets_b.clone());
        a * self.lam as f32 + b * (1.0 - self.lam) as f32
    }
}

/// FMix over the last two input dimensions.
///
/// A random spectrum is scaled by `1 / f^decay_power`, inverse transformed,
/// and the top `lam` fraction of the resulting low-frequency noise becomes
/// the region taken from the first sample; the rest comes from a randomly
/// permuted partner.
#[derive(Debug, Clone)]
pub struct FMix {
    beta: Beta<f64>,
    decay_power: f64,
}

/// Signed sample frequencies of an `n`-point transform, as numpy's `fftfreq`.
fn fft_freq(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let k = if i < n.div_ceil(2) { i as f64 } else { i as f64 - n as f64 };
            k / n as f64
        })
        .collect()
}

fn inverse_fft_2d(data: &mut [Complex<f64>], height: usize, width: usize) {
    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft_inverse(width);
    for row in data.chunks_exact_mut(width) {
        row_fft.process(row);
    }
    let col_fft = planner.plan_fft_inverse(height);
    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for y in 0..height {
            column[y] = data[y * width + x];
        }
        col_fft.process(&mut column);
        for y in 0..height {
            data[y * width + x] = column[y];
        }
    }
}

impl FMix {
    pub fn new(alpha: f64, decay_power: f64) -> Result<Self> {
        Ok(Self {
            beta: beta(alpha)?,
            decay_power,
        })
    }

    /// Low-frequency grey mask over a `height x width` plane, in [0, 1].
    pub fn sample_grey_mask<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> Vec<f64> {
        let fy = fft_freq(height);
        let fx = fft_freq(width);
        let floor = 1.0 / height.max(width) as f64;

        let mut spectrum: Vec<Complex<f64>> = Vec::with_capacity(height * width);
        for y in &fy {
            for x in &fx {
                let freq = (x * x + y * y).sqrt().max(floor);
                let scale = 1.0 / freq.powf(self.decay_power);
                let re: f64 = StandardNormal.sample(rng);
                let im: f64 = StandardNormal.sample(rng);
                spectrum.push(Complex::new(re * scale, im * scale));
            }
        }
        inverse_fft_2d(&mut spectrum, height, width);

        let real: Vec<f64> = spectrum.iter().map(|c| c.re).collect();
        let min = real.iter().copied().fold(f64::INFINITY, f64::min);
        let max = real.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(f64::EPSILON);
        real.iter().map(|v| (v - min) / range).collect()
    }

    /// Binary mask with the `lam` fraction of highest grey values set to 1.
    ///
    /// The cell count `lam * size` is rounded down or up with equal odds.
    pub fn binarize<R: Rng + ?Sized>(grey: &[f64], lam: f64, rng: &mut R) -> Vec<f32> {
        let exact = lam * grey.len() as f64;
        let count = if rng.gen_bool(0.5) { exact.floor() } else { exact.ceil() } as usize;

        let mut order: Vec<usize> = (0..grey.len()).collect();
        order.sort_by(|&a, &b| grey[b].total_cmp(&grey[a]));
        let mut mask = vec![0.0f32; grey.len()];
        for &idx in order.iter().take(count.min(grey.len())) {
            mask[idx] = 1.0;
        }
        mask
    }

    /// Sample `lam` and a binary `height x width` mask.
    pub fn sample_mask<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> (Vec<f32>, f64) {
        let lam = self.beta.sample(rng);
        let grey = self.sample_grey_mask(height, width, rng);
        (Self::binarize(&grey, lam, rng), lam)
    }

    pub fn apply<B: Backend, R: Rng + ?Sized>(
        &self,
        inputs: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        rng: &mut R,
    ) -> RegionMix<B> {
        let [batch, _, height, width] = inputs.dims();
        let device = inputs.device();
        let (mask, lam) = self.sample_mask(height, width, rng);

        let mut permutation: Vec<i64> = (0..batch as i64).collect();
        permutation.shuffle(rng);
        let permutation = Tensor::<B, 1, Int>::from_ints(permutation.as_slice(), &device);

        let mask = Tensor::<B, 1>::from_floats(mask.as_slice(), &device).reshape([1, 1, height, width]);
        let partner = inputs.clone().select(0, permutation.clone());
        let mixed = inputs * mask.clone() + partner * (mask.neg() + 1.0);

        RegionMix {
            inputs: mixed,
            targets_b: targets.clone().select(0, permutation),
            targets_a: targets,
            lam,
        }
    }
}
