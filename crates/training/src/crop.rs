//! Cutting full images into network-sized patches.

use data_contracts::{Array, Blob, ContractError};
use thiserror::Error;

use crate::config::{CropAlgo, TrainConfig};

#[derive(Debug, Error, PartialEq)]
pub enum CropError {
    #[error("blob data has rank {actual}, expected {expected}")]
    Rank { expected: usize, actual: usize },
    #[error("side {side} is not a multiple of crop size {crop}")]
    NotTiling { side: usize, crop: usize },
    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Splits one blob into sub-blobs the network can consume.
pub trait CropAlgorithm {
    fn process(&self, blob: &Blob) -> Result<Vec<Blob>, CropError>;
}

pub fn build_cropper(cfg: &TrainConfig) -> Box<dyn CropAlgorithm> {
    match cfg.crop_algo {
        CropAlgo::Grid => Box::new(GridCrop::new(cfg.crop_size, cfg.dims())),
    }
}

/// Non-overlapping `crop_size` tiles covering every sample, in raster order.
///
/// Each tile becomes its own batch-1 blob; `crops`/`crops_labels` are not carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCrop {
    crop_size: usize,
    dims: usize,
}

impl GridCrop {
    pub fn new(crop_size: usize, dims: usize) -> Self {
        Self { crop_size, dims }
    }

    fn tile<T: Copy>(
        &self,
        sample: &[T],
        sides: &[usize],
        origin: &[usize],
        channels: usize,
    ) -> Vec<T> {
        let crop = self.crop_size;
        let lead = self.dims - 1;
        let rows = crop.pow(lead as u32);
        let mut out = Vec::with_capacity(rows * crop * channels);
        let mut offsets = vec![0; lead];
        for row in 0..rows {
            let mut rest = row;
            for axis in (0..lead).rev() {
                offsets[axis] = rest % crop;
                rest /= crop;
            }
            let mut start = 0;
            for axis in 0..lead {
                start = start * sides[axis] + origin[axis] + offsets[axis];
            }
            start = start * sides[lead] + origin[lead];
            out.extend_from_slice(&sample[start * channels..(start + crop) * channels]);
        }
        out
    }
}

impl CropAlgorithm for GridCrop {
    fn process(&self, blob: &Blob) -> Result<Vec<Blob>, CropError> {
        let shape = blob.data.shape();
        if shape.len() != self.dims + 2 {
            return Err(CropError::Rank {
                expected: self.dims + 2,
                actual: shape.len(),
            });
        }
        blob.validate()?;
        let sides = &shape[1..=self.dims];
        let channels = shape[self.dims + 1];
        let crop = self.crop_size;
        if let Some(&side) = sides.iter().find(|&&s| crop == 0 || s % crop != 0) {
            return Err(CropError::NotTiling { side, crop });
        }

        let tiles_per_axis: Vec<usize> = sides.iter().map(|s| s / crop).collect();
        let tile_count: usize = tiles_per_axis.iter().product();
        let mut pixel_shape = vec![1];
        pixel_shape.extend(std::iter::repeat(crop).take(self.dims));
        let mut image_shape = pixel_shape.clone();
        image_shape.push(channels);

        let mut out = Vec::with_capacity(blob.batch_size() * tile_count);
        let mut origin = vec![0; self.dims];
        for sample in 0..blob.batch_size() {
            for tile in 0..tile_count {
                let mut rest = tile;
                for axis in (0..self.dims).rev() {
                    origin[axis] = (rest % tiles_per_axis[axis]) * crop;
                    rest /= tiles_per_axis[axis];
                }
                let data = self.tile(blob.data.sample(sample), sides, &origin, channels);
                let mut piece = Blob::new(Array::new(image_shape.clone(), data)?);
                if let Some(labels) = &blob.labels {
                    let values = self.tile(labels.sample(sample), sides, &origin, 1);
                    piece.labels = Some(Array::new(pixel_shape.clone(), values)?);
                }
                if let Some(weight) = &blob.weight {
                    let values = self.tile(weight.sample(sample), sides, &origin, 1);
                    piece.weight = Some(Array::new(pixel_shape.clone(), values)?);
                }
                out.push(piece);
            }
        }
        Ok(out)
    }
}
