use burn::tensor::{activation, backend::Backend, ElementConversion, Int, Tensor};

/// Hard labels to smoothed one-hot targets.
///
/// Off-target classes get `smoothing / C`, the target class
/// `1 - smoothing + smoothing / C`, so each row sums to one.
///
/// # Arguments
/// * `targets` - Class indices with shape [N]
/// * `num_classes` - C
/// * `smoothing` - Label smoothing factor in [0, 1)
///
/// # Returns
/// Float tensor with shape [N, C]
pub fn smoothed_one_hot<B: Backend>(
    targets: Tensor<B, 1, Int>,
    num_classes: usize,
    smoothing: f64,
) -> Tensor<B, 2> {
    let [batch] = targets.dims();
    let device = targets.device();
    let off = (smoothing / num_classes as f64) as f32;
    let on = (1.0 - smoothing) as f32 + off;

    let hits = Tensor::<B, 2>::zeros([batch, num_classes], &device).scatter(
        1,
        targets.reshape([batch, 1]),
        Tensor::<B, 2>::ones([batch, 1], &device),
    );
    hits * (on - off) + off
}

/// Cross-entropy against soft targets: `mean_n(sum_c(-t * log_softmax(x)))`.
///
/// # Shape Requirements
/// - logits: [N, C]
/// - targets: [N, C], rows summing to one
///
/// # Returns
/// Scalar tensor with shape [1]
pub fn soft_target_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    (targets.neg() * log_probs).sum_dim(1).mean()
}

fn nll_rows<B: Backend>(log_probs: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 2> {
    let [batch] = targets.dims();
    log_probs.gather(1, targets.reshape([batch, 1])).neg()
}

/// Plain cross-entropy with class-index targets, averaged over the batch.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    nll_rows(log_probs, targets).mean()
}

/// Label-smoothed cross-entropy:
/// `(1 - s) * nll + s * mean_c(-log_softmax(x))`, averaged over the batch.
///
/// Equivalent to [`soft_target_cross_entropy`] against [`smoothed_one_hot`]
/// targets.
pub fn label_smoothing_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    smoothing: f64,
) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 1);
    let nll = nll_rows(log_probs.clone(), targets);
    let smooth = log_probs.neg().mean_dim(1);
    let per_row = nll * (1.0 - smoothing) as f32 + smooth * smoothing as f32;
    per_row.mean()
}

/// Argmax over the class dimension with deterministic tie-breaking.
///
/// Ties resolve to the smallest class index: each class `c` is biased by
/// `-c * eps` with `eps = 1e-6 * (1 + max|x|)` before the argmax.
///
/// # Arguments
/// * `logits` - Tensor with shape [N, C]
///
/// # Returns
/// Class indices with shape [N]
///
/// # Example
/// ```text
/// [1.0, 1.0, 0.5] -> 0
/// [0.2, 3.0, 3.0] -> 1
/// ```
pub fn argmax_with_tie_break_smallest<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    let [batch, num_classes] = logits.dims();
    let device = logits.device();

    let max_abs = logits.clone().abs().max().reshape([1, 1]);
    let eps = (max_abs + 1.0) * 1e-6;

    let class_indices: Vec<f32> = (0..num_classes).map(|i| i as f32).collect();
    let class_indices = Tensor::<B, 1>::from_floats(class_indices.as_slice(), &device).reshape([1, num_classes]);

    let adjusted = logits - class_indices * eps;
    adjusted.argmax(1).reshape([batch])
}

/// Number of rows whose predicted class matches `targets`.
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = argmax_with_tie_break_smallest(logits);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// Batch accuracy in [0, 1]; zero for an empty batch.
pub fn accuracy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let [batch, _] = logits.dims();
    if batch == 0 {
        return 0.0;
    }
    count_correct(logits, targets) as f64 / batch as f64
}

/// Accuracy under soft targets: argmax of the output against argmax of the
/// targets.
pub fn soft_accuracy<B: Backend>(logits: Tensor<B, 2>, soft_targets: Tensor<B, 2>) -> f64 {
    accuracy(logits, argmax_with_tie_break_smallest(soft_targets))
}

/// Scalar loss value, logging a warning when it is not finite.
///
/// Non-finite losses are not treated as errors; they propagate to the
/// metrics unchanged.
pub fn loss_value<B: Backend>(loss: &Tensor<B, 1>, context: &str) -> f32 {
    let value = loss.clone().into_scalar().elem::<f32>();
    if !value.is_finite() {
        tracing::warn!(value, context, "non-finite loss");
    }
    value
}
