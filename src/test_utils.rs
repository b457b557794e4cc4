// Fixture builders for tests.
//
// Tensor helpers follow the Burn 0.18 `Into<TensorData>` pattern (Vec<T> +
// `.as_slice()`). The synthetic image source and cache builders let the
// pipeline run end to end without images or trained base models on disk.

use burn::tensor::{backend::Backend, Int, Tensor};
use std::path::PathBuf;

use crate::stacking::cache::LogitCache;
use crate::stacking::data::{Example, ImageSource};
use crate::stacking::error::{Result, StackError};
use crate::stacking::scorer::FoldLogits;

/// Create f32 tensor from data slice with specified shape
///
/// Panics when the data length does not match the shape.
pub fn tensor_from_f32_vec<B: Backend, const D: usize>(
    data: &[f32],
    shape: &[usize],
    device: &B::Device,
) -> Tensor<B, D> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(
        data.len(),
        expected_size,
        "Data length {} doesn't match shape {:?} (expected {})",
        data.len(),
        shape,
        expected_size
    );

    let flat_tensor = Tensor::<B, 1>::from_floats(data.to_vec().as_slice(), device);
    flat_tensor.reshape(burn::tensor::Shape::from(shape))
}

/// Create i64 tensor from data slice with specified shape
pub fn tensor_from_i64_vec<B: Backend, const D: usize>(
    data: &[i64],
    shape: &[usize],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(
        data.len(),
        expected_size,
        "Data length {} doesn't match shape {:?} (expected {})",
        data.len(),
        shape,
        expected_size
    );

    let flat_tensor = Tensor::<B, 1, Int>::from_ints(data.to_vec().as_slice(), device);
    flat_tensor.reshape(burn::tensor::Shape::from(shape))
}

/// `count` examples with ids `img_0000.jpg`, ... and labels cycling through
/// `num_classes`.
pub fn synthetic_examples(count: usize, num_classes: usize) -> Vec<Example> {
    (0..count)
        .map(|i| {
            let id = format!("img_{i:04}.jpg");
            Example {
                image_path: PathBuf::from("synthetic").join(&id),
                id,
                label: i % num_classes.max(1),
            }
        })
        .collect()
}

/// Deterministic pixels derived from the example id; no files are read.
#[derive(Debug, Clone, Default)]
pub struct SyntheticImageSource {
    /// Loading this id fails with a missing-input error.
    pub fail_on: Option<String>,
}

impl SyntheticImageSource {
    pub fn failing_on(id: &str) -> Self {
        Self {
            fail_on: Some(id.to_string()),
        }
    }
}

impl ImageSource for SyntheticImageSource {
    fn load(&self, example: &Example, size: usize) -> Result<Vec<f32>> {
        if self.fail_on.as_deref() == Some(example.id.as_str()) {
            return Err(StackError::MissingInput {
                what: "image",
                path: example.image_path.clone(),
            });
        }
        let seed = example
            .id
            .bytes()
            .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Ok((0..3 * size * size)
            .map(|i| {
                let v = seed.wrapping_add(i as u32).wrapping_mul(2_654_435_761) >> 16;
                (v % 1000) as f32 / 500.0 - 1.0
            })
            .collect())
    }
}

/// `FoldLogits` whose logits favor each example's own label by `margin`.
pub fn fold_logits<B: Backend>(
    ids: &[String],
    labels: &[usize],
    num_tta: usize,
    num_classes: usize,
    margin: f32,
    device: &B::Device,
) -> FoldLogits<B> {
    let n = ids.len();
    let mut values = Vec::with_capacity(n * num_tta * num_classes);
    for &label in labels {
        for t in 0..num_tta {
            for c in 0..num_classes {
                let bump = if c == label { margin } else { 0.0 };
                values.push(bump + 0.01 * t as f32);
            }
        }
    }
    let targets: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    FoldLogits {
        logits: tensor_from_f32_vec(&values, &[n, num_tta, num_classes], device),
        targets: tensor_from_i64_vec(&targets, &[n], device),
        image_ids: ids.to_vec(),
    }
}

/// One cache per model name over folds of the given sizes. Every model
/// scores the same ids; fold `f` holds ids `f_0`, `f_1`, ...
pub fn synthetic_caches<B: Backend>(
    models: &[&str],
    fold_sizes: &[usize],
    num_tta: usize,
    num_classes: usize,
    device: &B::Device,
) -> Result<Vec<LogitCache<B>>> {
    models
        .iter()
        .enumerate()
        .map(|(m, name)| {
            let mut cache = LogitCache::new(name);
            for (fold, &size) in fold_sizes.iter().enumerate() {
                let ids: Vec<String> = (0..size).map(|i| format!("{fold}_{i}")).collect();
                let labels: Vec<usize> = (0..size).map(|i| (i + fold) % num_classes).collect();
                let scored = fold_logits(&ids, &labels, num_tta, num_classes, 1.0 + m as f32, device);
                cache.push_fold(fold, scored)?;
            }
            Ok(cache)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tensor_from_f32_vec_2d() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 2> = tensor_from_f32_vec(&[1.0, 2.0, 3.0, 4.0], &[2, 2], &device);

        assert_eq!(tensor.dims(), [2, 2]);
        let values: Vec<f32> = tensor.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_tensor_from_i64_vec() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 1, Int> = tensor_from_i64_vec(&[1, 2, 3], &[3], &device);
        let values: Vec<i64> = tensor.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_shape_mismatch_panics() {
        let device = Default::default();
        let _: Tensor<TestBackend, 2> = tensor_from_f32_vec(&[1.0, 2.0, 3.0], &[2, 2], &device);
    }

    #[test]
    fn test_synthetic_source_is_deterministic() {
        let examples = synthetic_examples(2, 5);
        let source = SyntheticImageSource::default();
        let a = source.load(&examples[0], 4).unwrap();
        assert_eq!(a.len(), 48);
        assert_eq!(a, source.load(&examples[0], 4).unwrap());
        assert_ne!(a, source.load(&examples[1], 4).unwrap());

        let failing = SyntheticImageSource::failing_on(&examples[1].id);
        assert!(failing.load(&examples[1], 4).is_err());
    }

    #[test]
    fn test_synthetic_caches_layout() {
        let device = Default::default();
        let caches = synthetic_caches::<TestBackend>(&["a", "b"], &[3, 2], 4, 5, &device).unwrap();
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[1].num_folds(), 2);
        assert_eq!(caches[1].fold(1).unwrap().logits.dims(), [2, 4, 5]);
    }
}
