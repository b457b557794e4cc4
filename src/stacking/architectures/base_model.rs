//! Frozen base classifiers scored during data creation.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::{activation, Distribution};
use std::path::Path;

use super::shapes::{conv2d_shapes, ensure_same_shapes, linear_shapes, ParameterShapes};
use crate::stacking::checkpoint;
use crate::stacking::error::{Result, StackError};
use crate::stacking::settings::{ArchitectureSpec, BaseModelSpec};

/// A classifier from `[batch, 3, H, W]` images to `[batch, classes]` logits.
pub trait ImageClassifier<B: Backend> {
    fn name(&self) -> &str;

    fn num_classes(&self) -> usize;

    /// Logits for a batch of normalized images.
    fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

fn conv3x3<B: Backend>(channels: [usize; 2], stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Two 3x3 convolutions with a strided 1x1 projection shortcut.
#[derive(Module, Debug)]
pub struct ResidualStage<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub shortcut: Conv2d<B>,
}

impl<B: Backend> ResidualStage<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3([in_channels, out_channels], 2, device),
            conv2: conv3x3([out_channels, out_channels], 1, device),
            shortcut: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([2, 2])
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, drop_path: Option<f64>) -> Tensor<B, 4> {
        let residual = self.shortcut.forward(x.clone());
        let branch = activation::relu(self.conv1.forward(x));
        let branch = self.conv2.forward(branch);
        let branch = match drop_path {
            Some(prob) if prob > 0.0 => drop_path_per_sample(branch, prob),
            _ => branch,
        };
        activation::relu(branch + residual)
    }
}

/// Zero the residual branch of whole samples with probability `prob`,
/// rescaling survivors by `1 / (1 - prob)`.
fn drop_path_per_sample<B: Backend>(x: Tensor<B, 4>, prob: f64) -> Tensor<B, 4> {
    let [batch, _, _, _] = x.dims();
    let keep = 1.0 - prob;
    let mask = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Bernoulli(keep), &x.device());
    x * mask / keep
}

/// Compact residual CNN used for every base model.
#[derive(Module, Debug)]
pub struct ConvClassifier<B: Backend> {
    pub stem: Conv2d<B>,
    pub stages: Vec<ResidualStage<B>>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    pub head: Linear<B>,
    name: Ignored<String>,
    drop_path_rate: Ignored<f64>,
    training: Ignored<bool>,
}

impl<B: Backend> ConvClassifier<B> {
    /// Build an untrained classifier for `spec`, in evaluation mode.
    pub fn new(spec: &BaseModelSpec, num_classes: usize, device: &B::Device) -> Self {
        let ArchitectureSpec {
            in_channels,
            stem_channels,
            stage_channels,
        } = &spec.architecture;

        let mut stages = Vec::with_capacity(stage_channels.len());
        let mut width = *stem_channels;
        for &out in stage_channels {
            stages.push(ResidualStage::new(width, out, device));
            width = out;
        }

        Self {
            stem: conv3x3([*in_channels, *stem_channels], 2, device),
            stages,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(spec.drop_rate).init(),
            head: LinearConfig::new(width, num_classes).init(device),
            name: Ignored(spec.name.clone()),
            drop_path_rate: Ignored(spec.drop_path_rate),
            training: Ignored(false),
        }
    }

    /// Build the classifier for `spec` and load the checkpoint in `dir`.
    ///
    /// # Errors
    /// `CheckpointLoad` when the record cannot be read, `ShapeMismatch` when
    /// the stored parameters do not fit the architecture.
    pub fn load(
        spec: &BaseModelSpec,
        num_classes: usize,
        dir: &Path,
        device: &B::Device,
    ) -> Result<Self> {
        let fresh = Self::new(spec, num_classes, device);
        let (loaded, meta) = checkpoint::load_model(fresh.clone(), dir, device)?;
        ensure_same_shapes(&spec.name, &fresh, &loaded)?;
        match meta {
            Some(meta) => tracing::info!(
                model = %spec.name,
                fold = meta.fold,
                epoch = meta.epoch,
                accuracy = meta.accuracy,
                "loaded base model"
            ),
            None => tracing::info!(model = %spec.name, dir = %dir.display(), "loaded base model"),
        }
        Ok(loaded.eval())
    }

    pub fn train(mut self) -> Self {
        self.training = Ignored(true);
        self
    }

    pub fn eval(mut self) -> Self {
        self.training = Ignored(false);
        self
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let drop_path = self.training.0.then_some(self.drop_path_rate.0);
        let mut x = activation::relu(self.stem.forward(images));
        for stage in &self.stages {
            x = stage.forward(x, drop_path);
        }
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let x = x.reshape([batch, channels]);
        let x = if self.training.0 { self.dropout.forward(x) } else { x };
        self.head.forward(x)
    }
}

impl<B: Backend> ImageClassifier<B> for ConvClassifier<B> {
    fn name(&self) -> &str {
        &self.name.0
    }

    fn num_classes(&self) -> usize {
        let [_, classes] = self.head.weight.val().dims();
        classes
    }

    fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

impl<B: Backend> ParameterShapes for ConvClassifier<B> {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        conv2d_shapes("stem", &self.stem, &mut out);
        for (idx, stage) in self.stages.iter().enumerate() {
            conv2d_shapes(&format!("stages.{idx}.conv1"), &stage.conv1, &mut out);
            conv2d_shapes(&format!("stages.{idx}.conv2"), &stage.conv2, &mut out);
            conv2d_shapes(&format!("stages.{idx}.shortcut"), &stage.shortcut, &mut out);
        }
        linear_shapes("head", &self.head, &mut out);
        out
    }
}

/// Load the fold-`fold` checkpoint of every configured base model.
pub fn load_fold_models<B: Backend>(
    specs: &[BaseModelSpec],
    fold: usize,
    num_classes: usize,
    resolve: impl Fn(&Path) -> std::path::PathBuf,
    device: &B::Device,
) -> Result<Vec<ConvClassifier<B>>> {
    specs
        .iter()
        .map(|spec| {
            let dir = spec.checkpoints.get(fold).ok_or_else(|| StackError::LengthMismatch {
                context: format!("checkpoints of {}", spec.name),
                expected: fold + 1,
                found: spec.checkpoints.len(),
            })?;
            ConvClassifier::load(spec, num_classes, &resolve(dir), device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn spec(stages: Vec<usize>) -> BaseModelSpec {
        BaseModelSpec {
            name: "tiny".to_string(),
            architecture: ArchitectureSpec {
                in_channels: 3,
                stem_channels: 4,
                stage_channels: stages,
            },
            drop_rate: 0.2,
            drop_path_rate: 0.1,
            checkpoints: vec![PathBuf::from("tiny_fold0")],
        }
    }

    #[test]
    fn test_classifier_output_shape() {
        let device = Default::default();
        let model = ConvClassifier::<TestBackend>::new(&spec(vec![8, 8]), 5, &device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);

        assert_eq!(model.classify(images).dims(), [2, 5]);
        assert_eq!(model.num_classes(), 5);
        assert_eq!(model.name(), "tiny");
    }

    #[test]
    fn test_shape_listing_covers_every_stage() {
        let device = Default::default();
        let model = ConvClassifier::<TestBackend>::new(&spec(vec![8, 16, 32]), 5, &device);
        let shapes = model.parameter_shapes();
        // stem (w, b) + 3 stages * 3 convs * (w, b) + head (w, b)
        assert_eq!(shapes.len(), 2 + 18 + 2);
        assert_eq!(shapes.last().unwrap().1, vec![5]);
    }

    #[test]
    fn test_load_rejects_other_architecture() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let saved = ConvClassifier::<TestBackend>::new(&spec(vec![8]), 5, &device);
        checkpoint::save_model::<TestBackend, _>(&saved, dir.path(), checkpoint::Precision::Full)
            .unwrap();

        let err = ConvClassifier::<TestBackend>::load(&spec(vec![16]), 5, dir.path(), &device)
            .unwrap_err();
        assert!(matches!(err, StackError::ShapeMismatch { .. }), "{err:?}");
    }
}
