//! Base-model scoring under test-time augmentation.

use burn::prelude::*;
use burn::tensor::{Int, TensorData};
use std::sync::Arc;

use super::architectures::ImageClassifier;
use super::data::{Example, ImageBatch, ImageSource, OrderedPrefetcher};
use super::error::{Result, StackError};
use super::tta::Tta;

/// Logits of one base model over one fold, in scoring order.
#[derive(Debug, Clone)]
pub struct FoldLogits<B: Backend> {
    /// `[examples, tta_variants, classes]`
    pub logits: Tensor<B, 3>,
    /// `[examples]`
    pub targets: Tensor<B, 1, Int>,
    pub image_ids: Vec<String>,
}

impl<B: Backend> FoldLogits<B> {
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ScoreOptions {
    pub batch_size: usize,
    pub image_size: usize,
    pub num_workers: usize,
    pub tta: bool,
}

fn batch_tensor<B: Backend>(batch: &ImageBatch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(
        TensorData::new(batch.pixels.clone(), [batch.len(), 3, batch.size, batch.size]),
        device,
    )
}

/// `[batch, tta, classes]` logits of `model` for one decoded batch.
pub fn score_batch<B: Backend, C: ImageClassifier<B>>(
    model: &C,
    images: Tensor<B, 4>,
    variants: &[Tta],
) -> Tensor<B, 3> {
    let per_variant = variants
        .iter()
        .map(|tta| model.classify(tta.apply(images.clone())))
        .collect();
    Tensor::stack::<3>(per_variant, 1)
}

/// Score `examples` with every model in `models`, decoding each image once.
///
/// Results are index-aligned with `models`; examples keep their input order.
/// Runs on a plain (non-autodiff) backend, so no gradient graph is built.
///
/// # Errors
/// Fails on an empty example list, on the first image that cannot be
/// decoded, or when fewer rows than examples come back from the workers.
pub fn score_examples<B: Backend, C: ImageClassifier<B>>(
    models: &[C],
    source: Arc<dyn ImageSource>,
    examples: &[Example],
    options: &ScoreOptions,
    device: &B::Device,
) -> Result<Vec<FoldLogits<B>>> {
    if examples.is_empty() {
        return Err(StackError::config("cannot score an empty example list"));
    }
    let variants = Tta::variants(options.tta);
    let prefetcher = OrderedPrefetcher::spawn(
        source,
        examples.to_vec(),
        options.batch_size,
        options.image_size,
        options.num_workers,
    );
    let num_batches = prefetcher.num_batches();

    let mut per_model: Vec<Vec<Tensor<B, 3>>> = models.iter().map(|_| Vec::with_capacity(num_batches)).collect();
    let mut labels: Vec<i64> = Vec::with_capacity(examples.len());
    let mut image_ids = Vec::with_capacity(examples.len());

    for batch in prefetcher {
        let batch = batch?;
        let images = batch_tensor::<B>(&batch, device);
        for (model, outputs) in models.iter().zip(per_model.iter_mut()) {
            outputs.push(score_batch(model, images.clone(), &variants));
        }
        labels.extend(batch.labels.iter().map(|&l| l as i64));
        image_ids.extend(batch.ids);
        tracing::debug!(batch = batch.index, num_batches, "scored batch");
    }

    if labels.len() != examples.len() {
        return Err(StackError::LengthMismatch {
            context: "scored examples".to_string(),
            expected: examples.len(),
            found: labels.len(),
        });
    }
    let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device);
    Ok(per_model
        .into_iter()
        .map(|outputs| FoldLogits {
            logits: Tensor::cat(outputs, 0),
            targets: targets.clone(),
            image_ids: image_ids.clone(),
        })
        .collect())
}

/// Score one model over one held-out fold.
pub fn score_fold<B: Backend, C: ImageClassifier<B>>(
    model: &C,
    source: Arc<dyn ImageSource>,
    examples: &[Example],
    options: &ScoreOptions,
    device: &B::Device,
) -> Result<FoldLogits<B>> {
    let mut scored = score_examples(std::slice::from_ref(model), source, examples, options, device)?;
    scored.pop().ok_or_else(|| StackError::config("scoring produced no output"))
}
