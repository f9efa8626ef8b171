//! Shared data contracts between data sources, croppers and the segmentation network.

pub mod blob;

pub use blob::{Array, Blob, ContractError, FloatArray, Label, LabelArray};
