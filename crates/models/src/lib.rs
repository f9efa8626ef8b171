//! Burn models for pixel-wise segmentation of toy particle-detector images.
//!
//! - `UResNet`: U-shaped residual encoder-decoder producing per-pixel class logits.
//! - `SpatialOps`: picks 2D or 3D convolutions once, at construction time.
//! - `loss`: per-sample summed cross-entropy and pixel accuracy metrics.
//!
//! These are pure Burn modules with no knowledge of blobs, optimizers or files; the
//! `training` crate wires them to data and checkpoints.

pub mod blocks;
pub mod loss;
pub mod spatial;
pub mod uresnet;

pub use blocks::{ConvBlock, DoubleResnet, ResnetModule, UpBlock};
pub use loss::{pixel_accuracy, segmentation_loss, PixelAccuracy};
pub use spatial::SpatialOps;
pub use uresnet::{
    EncoderStage, FeatureMaps, Merge, ModelError, SegmentationOutput, UResNet, UResNetConfig,
};

pub mod prelude {
    pub use super::{Merge, SegmentationOutput, SpatialOps, UResNet, UResNetConfig};
}
