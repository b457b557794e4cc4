//! Convolutional stacking head over base-model logits.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation;

use super::shapes::{conv2d_shapes, linear_shapes, ParameterShapes};
use crate::stacking::error::{self, StackError};

const CONV1_CHANNELS: usize = 256;
const CONV2_CHANNELS: usize = 512;

#[derive(Config, Debug)]
pub struct StackModelConfig {
    /// Number of base models, the input channel count.
    pub num_models: usize,
    /// TTA variants per example, the input height.
    pub num_tta: usize,
    pub num_classes: usize,
    #[config(default = 1024)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl StackModelConfig {
    /// Build the model.
    ///
    /// # Errors
    /// `StackError::Config` when `num_tta < 3` or `num_classes < 3`: the two
    /// unpadded convolutions would leave an empty feature map.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<StackModel<B>> {
        if self.num_tta < 3 || self.num_classes < 3 {
            return Err(StackError::config(format!(
                "stacking model needs at least 3 TTA variants and 3 classes, got {} and {}",
                self.num_tta, self.num_classes
            )));
        }
        if self.num_models == 0 {
            return Err(StackError::config("stacking model needs at least one base model"));
        }
        Ok(StackModel {
            conv1: Conv2dConfig::new([self.num_models, CONV1_CHANNELS], [1, 3]).init(device),
            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [3, 1]).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(CONV2_CHANNELS, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            head: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            training: Ignored(true),
        })
    }
}

/// `[batch, models, tta, classes]` logits to `[batch, classes]` logits.
///
/// Dropout runs only in training mode, which the caller sets explicitly with
/// [`StackModel::train`] / [`StackModel::eval`].
#[derive(Module, Debug)]
pub struct StackModel<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub head: Linear<B>,
    dropout: Dropout,
    training: Ignored<bool>,
}

impl<B: Backend> StackModel<B> {
    pub fn train(mut self) -> Self {
        self.training = Ignored(true);
        self
    }

    pub fn eval(mut self) -> Self {
        self.training = Ignored(false);
        self
    }

    pub fn is_training(&self) -> bool {
        self.training.0
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = activation::relu(self.conv1.forward(x));
        let x = activation::relu(self.conv2.forward(x));
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let x = x.reshape([batch, channels]);

        let x = self.regularize(activation::relu(self.fc1.forward(x)));
        let x = self.regularize(activation::relu(self.fc2.forward(x)));
        self.head.forward(x)
    }

    fn regularize(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.training.0 {
            self.dropout.forward(x)
        } else {
            x
        }
    }
}

impl<B: Backend> ParameterShapes for StackModel<B> {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        conv2d_shapes("conv1", &self.conv1, &mut out);
        conv2d_shapes("conv2", &self.conv2, &mut out);
        linear_shapes("fc1", &self.fc1, &mut out);
        linear_shapes("fc2", &self.fc2, &mut out);
        linear_shapes("head", &self.head, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn config() -> StackModelConfig {
        StackModelConfig::new(3, 4, 5).with_hidden_size(32)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = config().init::<TestBackend>(&device).unwrap().eval();
        let x = Tensor::<TestBackend, 4>::random([6, 3, 4, 5], burn::tensor::Distribution::Default, &device);
        assert_eq!(model.forward(x).dims(), [6, 5]);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let device = Default::default();
        let model = config().init::<TestBackend>(&device).unwrap().eval();
        assert!(!model.is_training());
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 4, 5], &device);
        let a: Vec<f32> = model.forward(x.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = model.forward(x).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_small_inputs() {
        let device = Default::default();
        assert!(StackModelConfig::new(3, 2, 5).init::<TestBackend>(&device).is_err());
        assert!(StackModelConfig::new(3, 4, 2).init::<TestBackend>(&device).is_err());
        assert!(StackModelConfig::new(3, 3, 3).init::<TestBackend>(&device).is_ok());
    }

    #[test]
    fn test_parameter_shapes_follow_config() {
        let device = Default::default();
        let model = config().init::<TestBackend>(&device).unwrap();
        let shapes = model.parameter_shapes();
        assert_eq!(shapes[0], ("conv1.weight".to_string(), vec![256, 3, 1, 3]));
        assert_eq!(shapes[2], ("conv2.weight".to_string(), vec![512, 256, 3, 1]));
        let head = shapes.iter().find(|(n, _)| n == "head.weight").unwrap();
        assert_eq!(head.1, vec![32, 5]);
    }
}
