//! Typed run configuration, loaded from TOML with every field defaulted.

use std::fs;
use std::path::{Path, PathBuf};

use models::{Merge, ModelError, SpatialOps, UResNetConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("{field} = {size} is not a multiple of 2^num_strides = {multiple}")]
    NotDivisible {
        field: &'static str,
        size: usize,
        multiple: usize,
    },
    #[error("crop_size {crop} does not tile image_size {image}")]
    CropDoesNotTile { crop: usize, image: usize },
    #[error("test_every must be at least 2 so that some steps train, got {0}")]
    TestPeriodTooShort(usize),
}

/// Cropping algorithms selectable from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CropAlgo {
    /// Non-overlapping tiles in raster order.
    #[default]
    Grid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub base_num_outputs: usize,
    pub num_strides: usize,
    /// Feed per-pixel weights into the loss.
    pub uresnet_weighting: bool,
    /// Merge decoder skips by addition (`true`) or concatenation (`false`).
    pub uresnet_add: bool,
    pub ppn1_index: usize,
    pub ppn2_index: usize,
    pub data_3d: bool,
    pub num_classes: usize,
    pub max_steps: usize,
    pub batch_size: usize,
    pub image_size: usize,
    pub crop_size: usize,
    pub enable_crop: bool,
    pub crop_algo: CropAlgo,
    pub learning_rate: f64,
    pub log_dir: PathBuf,
    pub display_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Checkpoint to restore before the first step.
    pub weights_file: Option<PathBuf>,
    pub seed: u64,
    /// Upper bound on straight tracks drawn per toy image.
    pub max_tracks: usize,
    pub checkpoint_every: usize,
    pub display_every: usize,
    pub log_every: usize,
    /// Outer steps per test step; the test step sits in the middle of each period.
    pub test_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            base_num_outputs: 16,
            num_strides: 3,
            uresnet_weighting: false,
            uresnet_add: true,
            ppn1_index: 1,
            ppn2_index: 2,
            data_3d: false,
            num_classes: 3,
            max_steps: 100,
            batch_size: 1,
            image_size: 64,
            crop_size: 32,
            enable_crop: false,
            crop_algo: CropAlgo::Grid,
            learning_rate: 0.001,
            log_dir: PathBuf::from("runs/log"),
            display_dir: PathBuf::from("runs/display"),
            output_dir: PathBuf::from("runs/checkpoints"),
            weights_file: None,
            seed: 123,
            max_tracks: 3,
            checkpoint_every: 1000,
            display_every: 1000,
            log_every: 100,
            test_every: 10,
        }
    }
}

impl TrainConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("image_size", self.image_size),
            ("max_steps", self.max_steps),
            ("checkpoint_every", self.checkpoint_every),
            ("display_every", self.display_every),
            ("log_every", self.log_every),
            ("test_every", self.test_every),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotPositive(*field));
        }
        if self.test_every < 2 {
            return Err(ConfigError::TestPeriodTooShort(self.test_every));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::NotPositive("learning_rate"));
        }

        let model = self.model_config();
        model.validate()?;

        if self.enable_crop {
            if self.crop_size == 0 {
                return Err(ConfigError::NotPositive("crop_size"));
            }
            if self.crop_size > self.image_size || self.image_size % self.crop_size != 0 {
                return Err(ConfigError::CropDoesNotTile {
                    crop: self.crop_size,
                    image: self.image_size,
                });
            }
        }

        let multiple = model.size_multiple();
        let side = self.network_side();
        if side % multiple != 0 {
            return Err(ConfigError::NotDivisible {
                field: if self.enable_crop {
                    "crop_size"
                } else {
                    "image_size"
                },
                size: side,
                multiple,
            });
        }
        Ok(())
    }

    pub fn spatial_ops(&self) -> SpatialOps {
        SpatialOps::from_is_3d(self.data_3d)
    }

    pub fn dims(&self) -> usize {
        self.spatial_ops().dims()
    }

    /// Side length of the images the network actually sees.
    pub fn network_side(&self) -> usize {
        if self.enable_crop {
            self.crop_size
        } else {
            self.image_size
        }
    }

    pub fn model_config(&self) -> UResNetConfig {
        UResNetConfig {
            base_num_outputs: self.base_num_outputs,
            num_strides: self.num_strides,
            num_classes: self.num_classes,
            merge: if self.uresnet_add {
                Merge::Add
            } else {
                Merge::Concat
            },
            ops: self.spatial_ops(),
            ppn1_index: self.ppn1_index,
            ppn2_index: self.ppn2_index,
            ..UResNetConfig::default()
        }
    }
}
