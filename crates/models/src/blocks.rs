use burn::module::Module;
use burn::nn::{GroupNorm, GroupNormConfig};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};

use crate::spatial::{SpatialConv, SpatialConvTranspose, SpatialOps};

/// Upper bound on normalization groups; the actual count is the largest divisor of the width.
const MAX_NORM_GROUPS: usize = 8;

fn group_norm<B: Backend>(channels: usize, device: &B::Device) -> GroupNorm<B> {
    let groups = (1..=MAX_NORM_GROUPS.min(channels))
        .rev()
        .find(|g| channels % g == 0)
        .unwrap_or(1);
    GroupNormConfig::new(groups, channels).init(device)
}

/// Convolution followed by normalization and an optional ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: SpatialConv<B>,
    norm: GroupNorm<B>,
    activate: bool,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        ops: SpatialOps,
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        activate: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: ops.conv(channels, kernel, stride, false, device),
            norm: group_norm(channels[1], device),
            activate,
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.norm.forward(self.conv.forward(input));
        if self.activate {
            relu(x)
        } else {
            x
        }
    }
}

/// Stride-2 transposed convolution + normalization + ReLU used on the way back up.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    deconv: SpatialConvTranspose<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(ops: SpatialOps, channels: [usize; 2], device: &B::Device) -> Self {
        Self {
            deconv: ops.conv_transpose(channels, false, device),
            norm: group_norm(channels[1], device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        relu(self.norm.forward(self.deconv.forward(input)))
    }
}

/// Two normalized convolutions summed with a shortcut, then ReLU.
///
/// The shortcut is the input itself when width and stride are unchanged, otherwise a
/// normalized 1x1 convolution with the same stride. Either way the output has
/// `num_outputs` channels.
#[derive(Module, Debug)]
pub struct ResnetModule<B: Backend> {
    shortcut: Option<ConvBlock<B>>,
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
}

impl<B: Backend> ResnetModule<B> {
    pub fn new(
        ops: SpatialOps,
        num_inputs: usize,
        num_outputs: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let shortcut = (num_inputs != num_outputs || stride != 1)
            .then(|| ConvBlock::new(ops, [num_inputs, num_outputs], 1, stride, false, device));
        Self {
            shortcut,
            conv1: ConvBlock::new(ops, [num_inputs, num_outputs], kernel, stride, false, device),
            conv2: ConvBlock::new(ops, [num_outputs, num_outputs], kernel, 1, false, device),
        }
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(input.clone()),
            None => input.clone(),
        };
        let residual = self.conv2.forward(self.conv1.forward(input));
        relu(shortcut + residual)
    }
}

/// Two residual modules; only the first one strides.
#[derive(Module, Debug)]
pub struct DoubleResnet<B: Backend> {
    first: ResnetModule<B>,
    second: ResnetModule<B>,
}

impl<B: Backend> DoubleResnet<B> {
    pub fn new(
        ops: SpatialOps,
        num_inputs: usize,
        num_outputs: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            first: ResnetModule::new(ops, num_inputs, num_outputs, kernel, stride, device),
            second: ResnetModule::new(ops, num_outputs, num_outputs, kernel, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        self.second.forward(self.first.forward(input))
    }
}
