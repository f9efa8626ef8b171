//! Segmentation loss and pixel accuracy.

use burn::tensor::activation::log_softmax;
use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};

/// Sparse softmax cross-entropy per pixel, `[batch, depth, height, width]`.
pub fn pixel_cross_entropy<B: Backend>(
    logits: Tensor<B, 5>,
    labels: Tensor<B, 4, Int>,
) -> Tensor<B, 4> {
    let [batch, _, depth, height, width] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    let index = labels.reshape([batch, 1, depth, height, width]);
    log_probs
        .gather(1, index)
        .reshape([batch, depth, height, width])
        .neg()
}

/// Scale each sample's weights so they sum to one.
///
/// There is no epsilon: all-zero samples must be rejected before they reach the graph.
pub fn normalize_pixel_weights<B: Backend>(weight: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, depth, height, width] = weight.dims();
    let totals = weight
        .clone()
        .reshape([batch, depth * height * width])
        .sum_dim(1)
        .reshape([batch, 1, 1, 1]);
    weight / totals
}

/// Per-pixel loss summed within each sample, then averaged over the batch.
///
/// Summing inside a sample gives every sample the same total weight no matter how many
/// pixels carry signal.
pub fn segmentation_loss<B: Backend>(
    logits: Tensor<B, 5>,
    labels: Tensor<B, 4, Int>,
    weight: Option<Tensor<B, 4>>,
) -> Tensor<B, 1> {
    let per_pixel = pixel_cross_entropy(logits, labels);
    let per_pixel = match weight {
        Some(weight) => per_pixel * normalize_pixel_weights(weight),
        None => per_pixel,
    };
    let [batch, depth, height, width] = per_pixel.dims();
    per_pixel
        .reshape([batch, depth * height * width])
        .sum_dim(1)
        .mean()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelAccuracy {
    /// Fraction of all pixels classified correctly.
    pub all: f32,
    /// Same, restricted to pixels whose input is strictly positive. `None` without signal.
    pub nonzero: Option<f32>,
}

pub fn pixel_accuracy<B: Backend>(
    predictions: Tensor<B, 4, Int>,
    labels: Tensor<B, 4, Int>,
    image: Tensor<B, 5>,
) -> PixelAccuracy {
    let [batch, depth, height, width] = labels.dims();
    let correct = predictions.equal(labels).float();
    let signal = image
        .reshape([batch, depth, height, width])
        .greater_elem(0.0)
        .float();

    let all = correct.clone().mean().into_scalar().elem::<f32>();
    let signal_pixels = signal.clone().sum().into_scalar().elem::<f32>();
    let signal_correct = (correct * signal).sum().into_scalar().elem::<f32>();
    PixelAccuracy {
        all,
        nonzero: (signal_pixels > 0.0).then(|| signal_correct / signal_pixels),
    }
}
