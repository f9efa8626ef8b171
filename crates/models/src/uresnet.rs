//! U-shaped residual encoder-decoder producing per-pixel class logits.

use burn::module::{Ignored, Module};
use burn::tensor::activation::softmax;
use burn::tensor::{backend::Backend, Int, Tensor};
use thiserror::Error;

use crate::blocks::{ConvBlock, DoubleResnet, UpBlock};
use crate::spatial::{SpatialConv, SpatialOps};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("base_num_outputs must be positive")]
    ZeroWidth,
    #[error("num_classes must be positive")]
    NoClasses,
    #[error("kernel size must be odd, got {0}")]
    EvenKernel(usize),
    #[error("feature map index {index} is out of range for {len} encoder stages")]
    StageIndexOutOfRange { index: usize, len: usize },
    #[error("no encoder feature map with {0} channels")]
    MissingFeatureMap(usize),
    #[error("encoder produced no feature maps")]
    EmptyFeatureMaps,
}

/// How the decoder joins an upsampled map with its encoder counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Element-wise sum; width stays the same.
    Add,
    /// Channel concatenation; width doubles before the decoder block.
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UResNetConfig {
    /// Width of the first convolution; stage `k` has `base_num_outputs * 2^k` channels.
    pub base_num_outputs: usize,
    /// Number of stride-2 encoder steps (and matching decoder steps).
    pub num_strides: usize,
    pub num_classes: usize,
    pub merge: Merge,
    pub ops: SpatialOps,
    /// Encoder stages exported to a point-proposal head.
    pub ppn1_index: usize,
    pub ppn2_index: usize,
    /// Kernel size of the residual convolutions.
    pub kernel: usize,
}

impl Default for UResNetConfig {
    fn default() -> Self {
        Self {
            base_num_outputs: 16,
            num_strides: 3,
            num_classes: 3,
            merge: Merge::Add,
            ops: SpatialOps::Planar,
            ppn1_index: 1,
            ppn2_index: 2,
            kernel: 3,
        }
    }
}

impl UResNetConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.base_num_outputs == 0 {
            return Err(ModelError::ZeroWidth);
        }
        if self.num_classes == 0 {
            return Err(ModelError::NoClasses);
        }
        if self.kernel % 2 == 0 {
            return Err(ModelError::EvenKernel(self.kernel));
        }
        let len = self.num_strides + 1;
        for index in [self.ppn1_index, self.ppn2_index] {
            if index >= len {
                return Err(ModelError::StageIndexOutOfRange { index, len });
            }
        }
        Ok(())
    }

    /// Channel count emitted by encoder stage `stage`.
    pub fn stage_width(&self, stage: usize) -> usize {
        self.base_num_outputs << stage
    }

    /// Spatial sizes must be divisible by this for the decoder to line up with the encoder.
    pub fn size_multiple(&self) -> usize {
        1 << self.num_strides
    }
}

/// One encoder output recorded for skip connections.
#[derive(Debug, Clone)]
pub struct EncoderStage<B: Backend> {
    pub channels: usize,
    pub tensor: Tensor<B, 5>,
}

/// Encoder outputs in the order they were produced; channel counts strictly increase.
#[derive(Debug, Clone)]
pub struct FeatureMaps<B: Backend> {
    stages: Vec<EncoderStage<B>>,
}

impl<B: Backend> FeatureMaps<B> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            stages: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, tensor: Tensor<B, 5>) {
        let channels = tensor.dims()[1];
        self.stages.push(EncoderStage { channels, tensor });
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[EncoderStage<B>] {
        &self.stages
    }

    pub fn channel_counts(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.channels).collect()
    }

    /// Stage at `index` in ascending channel order.
    pub fn stage(&self, index: usize) -> Result<&Tensor<B, 5>, ModelError> {
        self.stages
            .get(index)
            .map(|s| &s.tensor)
            .ok_or(ModelError::StageIndexOutOfRange {
                index,
                len: self.stages.len(),
            })
    }

    pub fn by_channels(&self, channels: usize) -> Result<&Tensor<B, 5>, ModelError> {
        self.stages
            .iter()
            .find(|s| s.channels == channels)
            .map(|s| &s.tensor)
            .ok_or(ModelError::MissingFeatureMap(channels))
    }

    pub fn deepest(&self) -> Result<&Tensor<B, 5>, ModelError> {
        self.stages
            .last()
            .map(|s| &s.tensor)
            .ok_or(ModelError::EmptyFeatureMaps)
    }
}

/// The three standing outputs plus the raw logits they derive from.
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    /// `[batch, classes, depth, height, width]`
    pub logits: Tensor<B, 5>,
    pub softmax: Tensor<B, 5>,
    /// Highest class probability per pixel, `[batch, depth, height, width]`.
    pub scores: Tensor<B, 4>,
    /// Arg-max class per pixel, `[batch, depth, height, width]`.
    pub predictions: Tensor<B, 4, Int>,
}

impl<B: Backend> SegmentationOutput<B> {
    pub fn from_logits(logits: Tensor<B, 5>) -> Self {
        let [batch, _, depth, height, width] = logits.dims();
        let softmax = softmax(logits.clone(), 1);
        let scores = softmax
            .clone()
            .max_dim(1)
            .reshape([batch, depth, height, width]);
        let predictions = softmax
            .clone()
            .argmax(1)
            .reshape([batch, depth, height, width]);
        Self {
            logits,
            softmax,
            scores,
            predictions,
        }
    }
}

#[derive(Module, Debug)]
pub struct UResNet<B: Backend> {
    stem: ConvBlock<B>,
    encoder: Vec<DoubleResnet<B>>,
    upsample: Vec<UpBlock<B>>,
    decoder: Vec<DoubleResnet<B>>,
    head: ConvBlock<B>,
    classifier: SpatialConv<B>,
    pub config: Ignored<UResNetConfig>,
}

impl<B: Backend> UResNet<B> {
    pub fn new(config: UResNetConfig, device: &B::Device) -> Result<Self, ModelError> {
        config.validate()?;
        let ops = config.ops;
        let base = config.base_num_outputs;
        let kernel = config.kernel;

        let stem = ConvBlock::new(ops, [1, base], 3, 1, true, device);
        let encoder = (0..config.num_strides)
            .map(|step| {
                let width = config.stage_width(step);
                DoubleResnet::new(ops, width, width * 2, kernel, 2, device)
            })
            .collect();

        let mut upsample = Vec::with_capacity(config.num_strides);
        let mut decoder = Vec::with_capacity(config.num_strides);
        for step in (0..config.num_strides).rev() {
            let width = config.stage_width(step);
            upsample.push(UpBlock::new(ops, [width * 2, width], device));
            let merged = match config.merge {
                Merge::Add => width,
                Merge::Concat => width * 2,
            };
            decoder.push(DoubleResnet::new(ops, merged, width, kernel, 1, device));
        }

        let head = ConvBlock::new(ops, [base, base], 3, 1, true, device);
        let classifier = ops.conv([base, config.num_classes], 3, 1, true, device);

        Ok(Self {
            stem,
            encoder,
            upsample,
            decoder,
            head,
            classifier,
            config: Ignored(config),
        })
    }

    /// Run the encoding path, recording every stage.
    pub fn encode(&self, image: Tensor<B, 5>) -> FeatureMaps<B> {
        let mut maps = FeatureMaps::with_capacity(self.encoder.len() + 1);
        let mut x = self.stem.forward(image);
        maps.push(x.clone());
        for block in &self.encoder {
            x = block.forward(x);
            maps.push(x.clone());
        }
        maps
    }

    /// Encoder only; returns the two stages selected for the point-proposal head.
    pub fn build_base_net(
        &self,
        image: Tensor<B, 5>,
    ) -> Result<(Tensor<B, 5>, Tensor<B, 5>), ModelError> {
        let maps = self.encode(image);
        let first = maps.stage(self.config.ppn1_index)?.clone();
        let second = maps.stage(self.config.ppn2_index)?.clone();
        Ok((first, second))
    }

    /// Decoding path from recorded encoder stages to class logits.
    pub fn decode(&self, maps: &FeatureMaps<B>) -> Result<Tensor<B, 5>, ModelError> {
        let mut x = maps.deepest()?.clone();
        for (up, block) in self.upsample.iter().zip(&self.decoder) {
            x = up.forward(x);
            let skip = maps.by_channels(x.dims()[1])?.clone();
            x = match self.config.merge {
                Merge::Add => x + skip,
                Merge::Concat => Tensor::cat(vec![x, skip], 1),
            };
            x = block.forward(x);
        }
        Ok(self.classifier.forward(self.head.forward(x)))
    }

    pub fn forward(&self, image: Tensor<B, 5>) -> Result<SegmentationOutput<B>, ModelError> {
        let maps = self.encode(image);
        let logits = self.decode(&maps)?;
        Ok(SegmentationOutput::from_logits(logits))
    }
}
