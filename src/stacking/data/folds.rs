//! Stratified K-fold assignment.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

use crate::stacking::error::{Result, StackError};

/// Fold index for every example, in example order.
///
/// # Algorithm
/// 1. Group example indices by label, visiting labels in ascending order
/// 2. Shuffle each group with a `ChaCha8Rng` seeded from `seed`
/// 3. Deal each group round-robin into folds, carrying the rotation over to
///    the next group
///
/// Carrying the rotation keeps fold sizes within one of each other while each
/// fold receives `count / K` (rounded) members of every class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    folds: Vec<usize>,
    num_folds: usize,
}

impl FoldAssignment {
    /// # Errors
    /// `StackError::Config` when `num_folds < 2` or `num_folds > labels.len()`.
    pub fn stratified(labels: &[usize], num_folds: usize, seed: u64) -> Result<Self> {
        if num_folds < 2 {
            return Err(StackError::config(format!(
                "stratified split needs at least 2 folds, got {num_folds}"
            )));
        }
        if num_folds > labels.len() {
            return Err(StackError::config(format!(
                "cannot split {} examples into {num_folds} folds",
                labels.len()
            )));
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            groups.entry(label).or_default().push(idx);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut folds = vec![0; labels.len()];
        let mut next_fold = 0;
        for members in groups.values_mut() {
            members.shuffle(&mut rng);
            for &idx in members.iter() {
                folds[idx] = next_fold;
                next_fold = (next_fold + 1) % num_folds;
            }
        }

        Ok(Self { folds, num_folds })
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    pub fn fold_of(&self, example: usize) -> usize {
        self.folds[example]
    }

    /// Example indices held out in `fold`, in ascending order.
    pub fn fold_indices(&self, fold: usize) -> Vec<usize> {
        self.folds
            .iter()
            .enumerate()
            .filter(|(_, &f)| f == fold)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_folds];
        for &fold in &self.folds {
            sizes[fold] += 1;
        }
        sizes
    }

    /// Per-class counts inside `fold`, keyed by label.
    pub fn label_counts(&self, labels: &[usize], fold: usize) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            if self.folds[idx] == fold {
                *counts.entry(label).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<usize> {
        (0..103).map(|i| if i % 7 == 0 { 3 } else { i % 3 }).collect()
    }

    #[test]
    fn test_every_example_gets_one_fold() {
        let labels = labels();
        let assignment = FoldAssignment::stratified(&labels, 5, 42).unwrap();
        assert_eq!(assignment.len(), labels.len());

        let total: usize = (0..5).map(|f| assignment.fold_indices(f).len()).sum();
        assert_eq!(total, labels.len());
    }

    #[test]
    fn test_fold_sizes_differ_by_at_most_one() {
        let assignment = FoldAssignment::stratified(&labels(), 5, 7).unwrap();
        let sizes = assignment.fold_sizes();
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
    }

    #[test]
    fn test_different_seeds_change_assignment() {
        let labels = labels();
        let a = FoldAssignment::stratified(&labels, 5, 1).unwrap();
        let b = FoldAssignment::stratified(&labels, 5, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_degenerate_fold_counts() {
        assert!(FoldAssignment::stratified(&[0, 1, 0], 1, 0).is_err());
        assert!(FoldAssignment::stratified(&[0, 1, 0], 4, 0).is_err());
        assert!(FoldAssignment::stratified(&[0, 1, 0], 3, 0).is_ok());
    }
}
