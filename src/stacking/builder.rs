//! Assembles stacking inputs from cached out-of-fold logits.
//!
//! For held-out fold `f`, the training tensor holds every other fold and the
//! validation tensor holds fold `f` alone. Both are laid out as
//! `[examples, models, tta_variants, classes]`.

use burn::prelude::*;
use burn::tensor::Int;
use std::collections::HashMap;

use super::cache::LogitCache;
use super::error::{Result, StackError};
use super::scorer::FoldLogits;

#[derive(Debug, Clone)]
pub struct StackDataset<B: Backend> {
    /// `[examples, models, tta_variants, classes]`
    pub inputs: Tensor<B, 4>,
    /// `[examples]`, taken from the reference (first) model.
    pub labels: Tensor<B, 1, Int>,
    pub image_ids: Vec<String>,
}

impl<B: Backend> StackDataset<B> {
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    /// Rows `indices` of inputs and labels, in the given order.
    pub fn batch(&self, indices: &[usize]) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
        let device = self.inputs.device();
        let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
        let idx = Tensor::<B, 1, Int>::from_ints(idx.as_slice(), &device);
        (
            self.inputs.clone().select(0, idx.clone()),
            self.labels.clone().select(0, idx),
        )
    }
}

#[derive(Debug, Clone)]
pub struct FoldSplit<B: Backend> {
    pub fold: usize,
    pub train: StackDataset<B>,
    pub valid: StackDataset<B>,
}

/// Reorder `scored` so its ids follow `reference`.
///
/// # Errors
/// `LengthMismatch` for a different example count, `IdMismatch` when the ids
/// are not the same set.
fn align_to_reference<B: Backend>(
    reference: &[String],
    scored: FoldLogits<B>,
    model: &str,
    reference_model: &str,
    fold: usize,
) -> Result<Tensor<B, 3>> {
    if scored.image_ids.len() != reference.len() {
        return Err(StackError::LengthMismatch {
            context: format!("fold {fold} of {model} against {reference_model}"),
            expected: reference.len(),
            found: scored.image_ids.len(),
        });
    }
    if scored.image_ids.as_slice() == reference {
        return Ok(scored.logits);
    }

    let mismatch = || StackError::IdMismatch {
        model: model.to_string(),
        reference: reference_model.to_string(),
        fold,
    };
    let positions: HashMap<&str, usize> = scored
        .image_ids
        .iter()
        .enumerate()
        .map(|(pos, id)| (id.as_str(), pos))
        .collect();
    if positions.len() != scored.image_ids.len() {
        return Err(mismatch());
    }
    let order = reference
        .iter()
        .map(|id| positions.get(id.as_str()).map(|&pos| pos as i64).ok_or_else(mismatch))
        .collect::<Result<Vec<i64>>>()?;

    tracing::debug!(model, fold, "reordering logits to reference id order");
    let device = scored.logits.device();
    let order = Tensor::<B, 1, Int>::from_ints(order.as_slice(), &device);
    Ok(scored.logits.select(0, order))
}

/// Per-model `[examples, tta, classes]` logits to
/// `[examples, models, tta, classes]`, model order preserved.
pub fn stack_models<B: Backend>(per_model: Vec<Tensor<B, 3>>) -> Tensor<B, 4> {
    Tensor::stack::<4>(per_model, 0).swap_dims(0, 1)
}

/// Stack the caches' logits for `folds` into one dataset.
fn assemble<B: Backend>(caches: &[LogitCache<B>], folds: &[usize]) -> Result<StackDataset<B>> {
    let reference_cache = &caches[0];
    let mut per_model: Vec<Vec<Tensor<B, 3>>> = vec![Vec::with_capacity(folds.len()); caches.len()];
    let mut labels = Vec::with_capacity(folds.len());
    let mut image_ids = Vec::new();

    for &fold in folds {
        let reference = fold_of(reference_cache, fold)?;
        let [_, tta, classes] = reference.logits.dims();
        for (cache, slot) in caches.iter().zip(per_model.iter_mut()).skip(1) {
            let scored = fold_of(cache, fold)?;
            let [_, other_tta, other_classes] = scored.logits.dims();
            if (other_tta, other_classes) != (tta, classes) {
                return Err(StackError::LengthMismatch {
                    context: format!(
                        "TTA x class layout of {} fold {fold} ({other_tta}x{other_classes}) against {}",
                        cache.model_name(),
                        reference_cache.model_name()
                    ),
                    expected: tta * classes,
                    found: other_tta * other_classes,
                });
            }
            slot.push(align_to_reference(
                &reference.image_ids,
                scored,
                cache.model_name(),
                reference_cache.model_name(),
                fold,
            )?);
        }
        per_model[0].push(reference.logits);
        labels.push(reference.targets);
        image_ids.extend(reference.image_ids);
    }

    let stacked: Vec<Tensor<B, 3>> = per_model.into_iter().map(|parts| Tensor::cat(parts, 0)).collect();
    let inputs = stack_models(stacked);
    Ok(StackDataset {
        inputs,
        labels: Tensor::cat(labels, 0),
        image_ids,
    })
}

fn fold_of<B: Backend>(cache: &LogitCache<B>, fold: usize) -> Result<FoldLogits<B>> {
    cache.fold(fold).ok_or_else(|| StackError::LengthMismatch {
        context: format!("folds in cache of {}", cache.model_name()),
        expected: fold + 1,
        found: cache.num_folds(),
    })
}

/// Training and validation data for held-out fold `fold`.
///
/// # Errors
/// * `Config` for fewer than two folds, no caches, or `fold >= num_folds`
/// * `LengthMismatch` when a cache holds a different number of folds
/// * `IdMismatch` when a model scored different examples than the reference
pub fn build_fold_split<B: Backend>(
    caches: &[LogitCache<B>],
    num_folds: usize,
    fold: usize,
) -> Result<FoldSplit<B>> {
    if num_folds < 2 {
        return Err(StackError::config(format!(
            "stacking needs at least 2 folds, got {num_folds}"
        )));
    }
    if caches.is_empty() {
        return Err(StackError::config("stacking needs at least one base model cache"));
    }
    if fold >= num_folds {
        return Err(StackError::config(format!(
            "held-out fold {fold} is outside [0, {num_folds})"
        )));
    }
    for cache in caches {
        if cache.num_folds() != num_folds {
            return Err(StackError::LengthMismatch {
                context: format!("folds in cache of {}", cache.model_name()),
                expected: num_folds,
                found: cache.num_folds(),
            });
        }
    }

    let train_folds: Vec<usize> = (0..num_folds).filter(|&f| f != fold).collect();
    if train_folds.is_empty() {
        return Err(StackError::EmptyTrainingSet { fold, num_folds });
    }

    let train = assemble(caches, &train_folds)?;
    let valid = assemble(caches, &[fold])?;
    tracing::info!(
        fold,
        train = ?train.inputs.dims(),
        valid = ?valid.inputs.dims(),
        "stacking data assembled"
    );
    Ok(FoldSplit { fold, train, valid })
}
