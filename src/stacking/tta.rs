//! Test-time augmentation of image batches.

use burn::prelude::*;
use burn::tensor::{BasicOps, Int, Numeric, TensorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tta {
    Identity,
    HorizontalFlip,
    VerticalFlip,
    /// Counter-clockwise quarter turn; expects square images.
    Rotate90,
}

impl Tta {
    pub const ALL: [Tta; 4] = [
        Tta::Identity,
        Tta::HorizontalFlip,
        Tta::VerticalFlip,
        Tta::Rotate90,
    ];

    /// Variants scored when TTA is on, or only the identity when it is off.
    pub fn variants(enabled: bool) -> Vec<Tta> {
        if enabled {
            Self::ALL.to_vec()
        } else {
            vec![Tta::Identity]
        }
    }

    /// Apply to a `[batch, channels, height, width]` batch.
    pub fn apply<B: Backend>(self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Tta::Identity => images,
            Tta::HorizontalFlip => reverse_dim(images, 3),
            Tta::VerticalFlip => reverse_dim(images, 2),
            Tta::Rotate90 => reverse_dim(images.swap_dims(2, 3), 2),
        }
    }
}

/// Reverse the order of elements along `dim`.
pub fn reverse_dim<B, const D: usize, K>(x: Tensor<B, D, K>, dim: usize) -> Tensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B> + BasicOps<B> + Numeric<B>,
{
    let len = x.dims()[dim];
    let indices: Vec<i64> = (0..len as i64).rev().collect();
    let indices = Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &x.device());
    x.select(dim, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// 1x1x2x2 image [[1, 2], [3, 4]]
    fn image() -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]), &Default::default())
    }

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_flips() {
        assert_eq!(values(Tta::Identity.apply(image())), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(values(Tta::HorizontalFlip.apply(image())), vec![2.0, 1.0, 4.0, 3.0]);
        assert_eq!(values(Tta::VerticalFlip.apply(image())), vec![3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_rotate90_is_counter_clockwise() {
        // [[1, 2], [3, 4]] turned left is [[2, 4], [1, 3]]
        assert_eq!(values(Tta::Rotate90.apply(image())), vec![2.0, 4.0, 1.0, 3.0]);
    }

    #[test]
    fn test_four_rotations_are_identity() {
        let mut x = image();
        for _ in 0..4 {
            x = Tta::Rotate90.apply(x);
        }
        assert_eq!(values(x), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reverse_dim_on_labels() {
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0i64, 1, 2].as_slice(), &Default::default());
        let reversed: Vec<i64> = reverse_dim(labels, 0).into_data().to_vec().unwrap();
        assert_eq!(reversed, vec![2, 1, 0]);
    }

    #[test]
    fn test_variants_follow_flag() {
        assert_eq!(Tta::variants(true).len(), 4);
        assert_eq!(Tta::variants(false), vec![Tta::Identity]);
    }
}
