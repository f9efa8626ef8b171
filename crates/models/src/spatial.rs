//! 2D/3D convolution strategy.
//!
//! Activations are always rank 5, `[batch, channels, depth, height, width]`. Planar
//! data carries `depth == 1`; its layers fold depth into the batch axis and run true
//! 2D convolutions, so the network code never branches on dimensionality.

use burn::module::Module;
use burn::nn::conv::{
    Conv2d, Conv2dConfig, Conv3d, Conv3dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    ConvTranspose3d, ConvTranspose3dConfig,
};
use burn::nn::{PaddingConfig2d, PaddingConfig3d};
use burn::tensor::{backend::Backend, Tensor};

/// Which convolution family the network is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialOps {
    /// 2D images, stored as volumes of depth one.
    Planar,
    /// 3D volumes.
    Volumetric,
}

impl SpatialOps {
    pub fn from_is_3d(is_3d: bool) -> Self {
        if is_3d {
            Self::Volumetric
        } else {
            Self::Planar
        }
    }

    /// Number of spatial axes the data really has.
    pub fn dims(self) -> usize {
        match self {
            Self::Planar => 2,
            Self::Volumetric => 3,
        }
    }

    /// "Same"-padded convolution; spatial size becomes `ceil(size / stride)`.
    pub fn conv<B: Backend>(
        self,
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        bias: bool,
        device: &B::Device,
    ) -> SpatialConv<B> {
        let pad = kernel / 2;
        match self {
            Self::Planar => SpatialConv::Planar(
                Conv2dConfig::new(channels, [kernel, kernel])
                    .with_stride([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(pad, pad))
                    .with_bias(bias)
                    .init(device),
            ),
            Self::Volumetric => SpatialConv::Volumetric(
                Conv3dConfig::new(channels, [kernel, kernel, kernel])
                    .with_stride([stride, stride, stride])
                    .with_padding(PaddingConfig3d::Explicit(pad, pad, pad))
                    .with_bias(bias)
                    .init(device),
            ),
        }
    }

    /// 3-wide, stride-2 transposed convolution that exactly doubles every spatial axis.
    pub fn conv_transpose<B: Backend>(
        self,
        channels: [usize; 2],
        bias: bool,
        device: &B::Device,
    ) -> SpatialConvTranspose<B> {
        match self {
            Self::Planar => SpatialConvTranspose::Planar(
                ConvTranspose2dConfig::new(channels, [3, 3])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .with_padding_out([1, 1])
                    .with_bias(bias)
                    .init(device),
            ),
            Self::Volumetric => SpatialConvTranspose::Volumetric(
                ConvTranspose3dConfig::new(channels, [3, 3, 3])
                    .with_stride([2, 2, 2])
                    .with_padding([1, 1, 1])
                    .with_padding_out([1, 1, 1])
                    .with_bias(bias)
                    .init(device),
            ),
        }
    }
}

/// Convolution built by [`SpatialOps::conv`].
#[derive(Module, Debug)]
pub enum SpatialConv<B: Backend> {
    Planar(Conv2d<B>),
    Volumetric(Conv3d<B>),
}

impl<B: Backend> SpatialConv<B> {
    pub fn ops(&self) -> SpatialOps {
        match self {
            Self::Planar(_) => SpatialOps::Planar,
            Self::Volumetric(_) => SpatialOps::Volumetric,
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        match self {
            Self::Planar(conv) => per_slice(input, |x| conv.forward(x)),
            Self::Volumetric(conv) => conv.forward(input),
        }
    }
}

/// Transposed convolution built by [`SpatialOps::conv_transpose`].
#[derive(Module, Debug)]
pub enum SpatialConvTranspose<B: Backend> {
    Planar(ConvTranspose2d<B>),
    Volumetric(ConvTranspose3d<B>),
}

impl<B: Backend> SpatialConvTranspose<B> {
    pub fn ops(&self) -> SpatialOps {
        match self {
            Self::Planar(_) => SpatialOps::Planar,
            Self::Volumetric(_) => SpatialOps::Volumetric,
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        match self {
            Self::Planar(conv) => per_slice(input, |x| conv.forward(x)),
            Self::Volumetric(conv) => conv.forward(input),
        }
    }
}

/// Apply a 2D op to every depth slice by folding depth into the batch axis.
fn per_slice<B: Backend>(
    input: Tensor<B, 5>,
    op: impl Fn(Tensor<B, 4>) -> Tensor<B, 4>,
) -> Tensor<B, 5> {
    let [batch, channels, depth, height, width] = input.dims();
    let folded = input
        .swap_dims(1, 2)
        .reshape([batch * depth, channels, height, width]);
    let out = op(folded);
    let [_, out_channels, out_height, out_width] = out.dims();
    out.reshape([batch, depth, out_channels, out_height, out_width])
        .swap_dims(1, 2)
}
