//! Segmentation network lifecycle: input layout, feed contract and the train/test modes.
//!
//! Construction goes through a typestate so each stage runs exactly once:
//! `NetBuilder` fixes the configuration, `init_placeholders` fixes the [`InputLayout`]
//! every feed is checked against, and `create_architecture` allocates the single
//! parameter set shared by [`SegmentationNet::train_step`] and
//! [`SegmentationNet::test_image`].

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use data_contracts::{Array, Blob, ContractError, FloatArray, Label, LabelArray};
use models::{
    pixel_accuracy, segmentation_loss, ModelError, PixelAccuracy, SegmentationOutput,
    SpatialOps, UResNet, UResNetConfig,
};
use thiserror::Error;

use crate::checkpoint::{self, CheckpointError};
use crate::config::TrainConfig;

#[derive(Debug, Error, PartialEq)]
pub enum FeedError {
    #[error("blob has no `{0}` field")]
    MissingField(&'static str),
    #[error("`{field}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        field: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("blob holds no samples")]
    EmptyBatch,
    #[error("label {label} is outside 0..{num_classes}")]
    LabelOutOfRange { label: Label, num_classes: usize },
    #[error("sample {sample} has negative pixel weight {weight}")]
    NegativeWeight { sample: usize, weight: f32 },
    #[error("pixel weights of sample {sample} sum to zero")]
    ZeroWeightSum { sample: usize },
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("input layout {given:?} does not fit the network, expected {expected:?}")]
    LayoutMismatch {
        given: InputLayout,
        expected: InputLayout,
    },
    #[error("failed to read tensor data: {0}")]
    Data(String),
}

/// Pairs a blob field with the name it is exposed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub field: &'static str,
    pub name: &'static str,
}

impl Binding {
    const fn new(field: &'static str, name: &'static str) -> Self {
        Self { field, name }
    }
}

/// Fixed input geometry every blob is checked against before it reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
    side: usize,
    ops: SpatialOps,
    num_classes: usize,
    weighting: bool,
}

/// Tensors produced from one blob.
#[derive(Debug, Clone)]
pub struct Feed<B: Backend> {
    /// `[batch, 1, depth, height, width]`
    pub image: Tensor<B, 5>,
    /// `[batch, depth, height, width]`
    pub labels: Tensor<B, 4, Int>,
    pub weight: Option<Tensor<B, 4>>,
}

impl InputLayout {
    pub fn new(side: usize, ops: SpatialOps, num_classes: usize, weighting: bool) -> Self {
        Self {
            side,
            ops,
            num_classes,
            weighting,
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn dims(&self) -> usize {
        self.ops.dims()
    }

    pub fn weighting(&self) -> bool {
        self.weighting
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings = vec![
            Binding::new("image", "image_uresnet"),
            Binding::new("learning_rate", "lr"),
            Binding::new("labels", "image_label"),
        ];
        if self.weighting {
            bindings.push(Binding::new("weight", "image_weight"));
        }
        bindings
    }

    /// `[batch, side, ...]` with one `side` per spatial axis.
    pub fn pixel_shape(&self, batch: usize) -> Vec<usize> {
        let mut shape = vec![batch];
        shape.extend(std::iter::repeat(self.side).take(self.dims()));
        shape
    }

    /// Pixel shape plus the trailing channel axis.
    pub fn image_shape(&self, batch: usize) -> Vec<usize> {
        let mut shape = self.pixel_shape(batch);
        shape.push(1);
        shape
    }

    /// Spatial extent as `[depth, height, width]`; planar data has depth one.
    fn volume(&self) -> [usize; 3] {
        match self.ops {
            SpatialOps::Planar => [1, self.side, self.side],
            SpatialOps::Volumetric => [self.side; 3],
        }
    }

    /// Check a blob against the layout and move it onto `device`.
    pub fn feed<B: Backend>(&self, blob: &Blob, device: &B::Device) -> Result<Feed<B>, FeedError> {
        let batch = blob.batch_size();
        if batch == 0 {
            return Err(FeedError::EmptyBatch);
        }
        let labels = blob
            .labels
            .as_ref()
            .ok_or(FeedError::MissingField("labels"))?;
        let pixel_shape = self.pixel_shape(batch);
        check_shape("data", &self.image_shape(batch), blob.data.shape())?;
        check_shape("labels", &pixel_shape, labels.shape())?;
        if let Some(&label) = labels
            .values()
            .iter()
            .find(|&&l| l < 0 || l as usize >= self.num_classes)
        {
            return Err(FeedError::LabelOutOfRange {
                label,
                num_classes: self.num_classes,
            });
        }

        let [depth, height, width] = self.volume();
        let weight = if self.weighting {
            let weight = blob
                .weight
                .as_ref()
                .ok_or(FeedError::MissingField("weight"))?;
            check_shape("weight", &pixel_shape, weight.shape())?;
            check_weights(weight)?;
            Some(Tensor::<B, 4>::from_data(
                TensorData::new(weight.values().to_vec(), [batch, depth, height, width]),
                device,
            ))
        } else {
            None
        };

        Ok(Feed {
            image: Tensor::from_data(
                TensorData::new(blob.data.values().to_vec(), [batch, 1, depth, height, width]),
                device,
            ),
            labels: Tensor::from_data(
                TensorData::new(labels.values().to_vec(), [batch, depth, height, width]),
                device,
            ),
            weight,
        })
    }
}

fn check_shape(field: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), FeedError> {
    if expected != actual {
        return Err(FeedError::ShapeMismatch {
            field,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

fn check_weights(weight: &FloatArray) -> Result<(), FeedError> {
    for sample in 0..weight.batch() {
        let values = weight.sample(sample);
        if let Some(&negative) = values.iter().find(|w| **w < 0.0) {
            return Err(FeedError::NegativeWeight {
                sample,
                weight: negative,
            });
        }
        if values.iter().sum::<f32>() <= 0.0 {
            return Err(FeedError::ZeroWeightSum { sample });
        }
    }
    Ok(())
}

/// Host copies of the network outputs for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NetResult {
    /// `[batch, side, ...]`
    pub predictions: LabelArray,
    /// `[batch, side, ...]`
    pub scores: FloatArray,
    /// `[batch, side, ..., classes]`
    pub softmax: FloatArray,
}

impl NetResult {
    fn from_output<B: Backend>(
        layout: &InputLayout,
        output: &SegmentationOutput<B>,
    ) -> Result<Self, NetError> {
        let batch = output.scores.dims()[0];
        let classes = output.softmax.dims()[1];
        let pixel_shape = layout.pixel_shape(batch);
        let mut softmax_shape = pixel_shape.clone();
        softmax_shape.push(classes);

        let predictions = output
            .predictions
            .clone()
            .into_data()
            .convert::<Label>()
            .to_vec::<Label>()
            .map_err(|e| NetError::Data(format!("{e:?}")))?;
        let scores = host_floats(output.scores.clone().into_data())?;
        let softmax = host_floats(
            output
                .softmax
                .clone()
                .permute([0, 2, 3, 4, 1])
                .into_data(),
        )?;

        Ok(Self {
            predictions: Array::new(pixel_shape.clone(), predictions)?,
            scores: Array::new(pixel_shape, scores)?,
            softmax: Array::new(softmax_shape, softmax)?,
        })
    }
}

fn host_floats(data: TensorData) -> Result<Vec<f32>, NetError> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| NetError::Data(format!("{e:?}")))
}

/// Scalars recorded for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSummary {
    pub loss: f32,
    /// Only computed in training mode.
    pub accuracy: Option<PixelAccuracy>,
}

#[derive(Debug, Clone)]
pub struct NetBuilder {
    config: UResNetConfig,
    side: usize,
    weighting: bool,
    learning_rate: f64,
}

impl NetBuilder {
    pub fn new(config: UResNetConfig, side: usize, weighting: bool, learning_rate: f64) -> Self {
        Self {
            config,
            side,
            weighting,
            learning_rate,
        }
    }

    pub fn from_train_config(cfg: &TrainConfig) -> Self {
        Self::new(
            cfg.model_config(),
            cfg.network_side(),
            cfg.uresnet_weighting,
            cfg.learning_rate,
        )
    }

    /// Fix the input layout, adopting `shared` when another net already owns one.
    pub fn init_placeholders(self, shared: Option<InputLayout>) -> Result<PlacedNet, NetError> {
        let expected = InputLayout::new(
            self.side,
            self.config.ops,
            self.config.num_classes,
            self.weighting,
        );
        let layout = match shared {
            Some(given) if given.ops != expected.ops || given.num_classes != expected.num_classes => {
                return Err(NetError::LayoutMismatch { given, expected });
            }
            Some(given) => given,
            None => expected,
        };
        if layout.side % self.config.size_multiple() != 0 {
            return Err(NetError::LayoutMismatch {
                given: layout,
                expected,
            });
        }
        Ok(PlacedNet {
            config: self.config,
            layout,
            learning_rate: self.learning_rate,
        })
    }
}

/// Layout fixed, parameters not yet allocated.
#[derive(Debug, Clone)]
pub struct PlacedNet {
    config: UResNetConfig,
    layout: InputLayout,
    learning_rate: f64,
}

impl PlacedNet {
    pub fn layout(&self) -> &InputLayout {
        &self.layout
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.layout.bindings()
    }

    /// Allocate the model and attach the optimizer that trains it.
    pub fn create_architecture<B, O>(
        self,
        optimizer: O,
        device: &B::Device,
    ) -> Result<SegmentationNet<B, O>, NetError>
    where
        B: AutodiffBackend,
        O: Optimizer<UResNet<B>, B>,
    {
        let model = UResNet::new(self.config, device)?;
        Ok(SegmentationNet {
            model,
            optimizer,
            layout: self.layout,
            learning_rate: self.learning_rate,
            device: device.clone(),
        })
    }
}

/// One parameter set with a training mode (autodiff + optimizer) and a test mode
/// (inner backend, parameters untouched).
pub struct SegmentationNet<B: AutodiffBackend, O> {
    model: UResNet<B>,
    optimizer: O,
    layout: InputLayout,
    learning_rate: f64,
    device: B::Device,
}

impl<B, O> SegmentationNet<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<UResNet<B>, B>,
{
    pub fn model(&self) -> &UResNet<B> {
        &self.model
    }

    pub fn layout(&self) -> &InputLayout {
        &self.layout
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Forward, backward and one optimizer update.
    ///
    /// Reported outputs come from the forward pass, i.e. the parameters before the update.
    pub fn train_step(&mut self, blob: &Blob) -> Result<(StepSummary, NetResult), NetError> {
        let feed = self.layout.feed::<B>(blob, &self.device)?;
        let output = self.model.forward(feed.image.clone())?;
        let loss = segmentation_loss(output.logits.clone(), feed.labels.clone(), feed.weight);
        let accuracy = pixel_accuracy(output.predictions.clone(), feed.labels, feed.image);
        let result = NetResult::from_output(&self.layout, &output)?;
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);

        Ok((
            StepSummary {
                loss: loss_value,
                accuracy: Some(accuracy),
            },
            result,
        ))
    }

    /// Forward only, on the inner backend.
    pub fn test_image(&self, blob: &Blob) -> Result<(StepSummary, NetResult), NetError> {
        let model = self.model.valid();
        let feed = self.layout.feed::<B::InnerBackend>(blob, &self.device)?;
        let output = model.forward(feed.image)?;
        let loss = segmentation_loss(output.logits.clone(), feed.labels, feed.weight)
            .into_scalar()
            .elem::<f32>();
        let result = NetResult::from_output(&self.layout, &output)?;
        Ok((
            StepSummary {
                loss,
                accuracy: None,
            },
            result,
        ))
    }

    /// Encoded parameters; equal snapshots mean identical weights.
    pub fn parameter_snapshot(&self) -> Result<Vec<u8>, NetError> {
        Ok(checkpoint::encode_model(&self.model)?)
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<(), NetError> {
        checkpoint::save_checkpoint(&self.model, path)?;
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), NetError> {
        self.model = checkpoint::load_checkpoint(self.model.clone(), path, &self.device)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn blob(shape: Vec<usize>, labels: Vec<usize>) -> Blob {
        let data = Array::filled(shape, 0.5f32);
        Blob::new(data).with_labels(Array::filled(labels, 0))
    }

    #[test]
    fn bindings_follow_weighting_flag() {
        let plain = InputLayout::new(8, SpatialOps::Planar, 3, false);
        let names: Vec<_> = plain.bindings().iter().map(|b| b.name).collect();
        assert_eq!(names, ["image_uresnet", "lr", "image_label"]);

        let weighted = InputLayout::new(8, SpatialOps::Planar, 3, true);
        let last = weighted.bindings().last().copied().unwrap();
        assert_eq!(last, Binding::new("weight", "image_weight"));
    }

    #[test]
    fn feed_rejects_wrong_dimensionality() {
        let device = Default::default();
        let layout = InputLayout::new(4, SpatialOps::Planar, 3, false);
        let err = layout
            .feed::<TestBackend>(&blob(vec![1, 4, 4, 4, 1], vec![1, 4, 4, 4]), &device)
            .unwrap_err();
        assert!(matches!(err, FeedError::ShapeMismatch { field: "data", .. }));
    }

    #[test]
    fn feed_requires_labels_and_weights() {
        let device = Default::default();
        let layout = InputLayout::new(4, SpatialOps::Planar, 3, true);
        let unlabelled = Blob::new(Array::filled(vec![1, 4, 4, 1], 0.0));
        assert_eq!(
            layout.feed::<TestBackend>(&unlabelled, &device).unwrap_err(),
            FeedError::MissingField("labels")
        );
        assert_eq!(
            layout
                .feed::<TestBackend>(&blob(vec![1, 4, 4, 1], vec![1, 4, 4]), &device)
                .unwrap_err(),
            FeedError::MissingField("weight")
        );
    }

    #[test]
    fn feed_rejects_out_of_range_labels() {
        let device = Default::default();
        let layout = InputLayout::new(2, SpatialOps::Planar, 3, false);
        let mut b = blob(vec![1, 2, 2, 1], vec![1, 2, 2]);
        b.labels = Some(Array::new(vec![1, 2, 2], vec![0, 1, 2, 3]).unwrap());
        assert_eq!(
            layout.feed::<TestBackend>(&b, &device).unwrap_err(),
            FeedError::LabelOutOfRange {
                label: 3,
                num_classes: 3
            }
        );
    }

    #[test]
    fn volumetric_feed_keeps_depth() {
        let device = Default::default();
        let layout = InputLayout::new(4, SpatialOps::Volumetric, 3, false);
        let feed = layout
            .feed::<TestBackend>(&blob(vec![2, 4, 4, 4, 1], vec![2, 4, 4, 4]), &device)
            .unwrap();
        assert_eq!(feed.image.dims(), [2, 1, 4, 4, 4]);
        assert_eq!(feed.labels.dims(), [2, 4, 4, 4]);
        assert!(feed.weight.is_none());
    }

    #[test]
    fn shared_layout_must_match_dimensionality() {
        let builder = NetBuilder::new(UResNetConfig::default(), 16, false, 1e-3);
        let shared = InputLayout::new(16, SpatialOps::Volumetric, 3, false);
        assert!(matches!(
            builder.init_placeholders(Some(shared)),
            Err(NetError::LayoutMismatch { .. })
        ));
    }
}
