//! Training driver for the UResNet segmentation network.
//!
//! The [`trainer::Trainer`] pulls blobs from a [`toydata::DataSource`], optionally cuts
//! them with a [`crop::CropAlgorithm`], and feeds batches through a
//! [`net::SegmentationNet`], alternating train and test steps while recording JSON-lines
//! summaries, PNG displays and checkpoints.

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod crop;
pub mod display;
pub mod net;
pub mod summary;
pub mod toydata;
pub mod trainer;
pub mod util;

pub use checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint, CheckpointError};
pub use config::{ConfigError, CropAlgo, TrainConfig};
pub use crop::{CropAlgorithm, CropError, GridCrop};
pub use display::{DisplaySink, PngDisplay};
pub use net::{
    Binding, Feed, FeedError, InputLayout, NetBuilder, NetError, NetResult, PlacedNet,
    SegmentationNet, StepSummary,
};
pub use summary::{read_events, SummaryEvent, SummaryWriter};
pub use toydata::{DataSource, ToyDataGenerator};
pub use trainer::{Mode, TrainReport, Trainer};
pub use util::{run_train, TrainArgs};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
