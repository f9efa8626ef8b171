//! Seeded toy detector images: straight tracks over a diffuse shower.

use data_contracts::{Array, Blob, ContractError, Label};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrainConfig;

pub const BACKGROUND: Label = 0;
pub const TRACK: Label = 1;
pub const SHOWER: Label = 2;

/// Produces one blob per call.
pub trait DataSource {
    fn forward(&mut self) -> anyhow::Result<Blob>;
}

#[derive(Debug, Clone)]
pub struct ToyDataGenerator {
    side: usize,
    dims: usize,
    batch_size: usize,
    max_tracks: usize,
    shower_label: Label,
    weighting: bool,
    rng: StdRng,
}

impl ToyDataGenerator {
    /// Full-size images; with cropping enabled one image per blob, the cropper batches the tiles.
    pub fn new(cfg: &TrainConfig, seed: u64) -> Self {
        Self {
            side: cfg.image_size,
            dims: cfg.dims(),
            batch_size: if cfg.enable_crop { 1 } else { cfg.batch_size },
            max_tracks: cfg.max_tracks.max(1),
            shower_label: if cfg.num_classes > SHOWER as usize {
                SHOWER
            } else {
                TRACK
            },
            weighting: cfg.uresnet_weighting,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn voxels(&self) -> usize {
        self.side.pow(self.dims as u32)
    }

    fn index(&self, point: &[f32]) -> Option<usize> {
        let mut index = 0;
        for &coord in point {
            if coord < 0.0 || coord >= self.side as f32 {
                return None;
            }
            index = index * self.side + coord as usize;
        }
        Some(index)
    }

    fn direction(&mut self) -> Vec<f32> {
        loop {
            let dir: Vec<f32> = (0..self.dims)
                .map(|_| self.rng.random_range(-1.0f32..1.0))
                .collect();
            let norm = dir.iter().map(|d| d * d).sum::<f32>().sqrt();
            if norm > 1e-3 {
                return dir.into_iter().map(|d| d / norm).collect();
            }
        }
    }

    fn point(&mut self) -> Vec<f32> {
        let side = self.side as f32;
        (0..self.dims)
            .map(|_| self.rng.random_range(0.0..side))
            .collect()
    }

    fn shower(&mut self, image: &mut [f32], labels: &mut [Label]) {
        let side = self.side as f32;
        let start = self.point();
        let axis = self.direction();
        let length = self.rng.random_range(side * 0.2..side * 0.5);
        let hits = self.side * 4;
        for _ in 0..hits {
            let t = self.rng.random_range(0.0..length);
            let spread = 0.35 * t + 0.5;
            let hit: Vec<f32> = start
                .iter()
                .zip(&axis)
                .map(|(s, a)| {
                    let jitter: f32 = (0..3).map(|_| self.rng.random_range(-1.0f32..1.0)).sum();
                    s + a * t + jitter * spread / 3.0
                })
                .collect();
            if let Some(i) = self.index(&hit) {
                let energy = self.rng.random_range(0.05f32..0.5);
                image[i] += energy;
                labels[i] = self.shower_label;
            }
        }
    }

    fn track(&mut self, image: &mut [f32], labels: &mut [Label]) {
        let side = self.side as f32;
        let start = self.point();
        let dir = self.direction();
        let length = self.rng.random_range(side * 0.25..side * 0.75);
        let energy = self.rng.random_range(0.5f32..1.0);
        let steps = (length * 2.0) as usize;
        for k in 0..=steps {
            let t = k as f32 * 0.5;
            let hit: Vec<f32> = start.iter().zip(&dir).map(|(s, d)| s + d * t).collect();
            if let Some(i) = self.index(&hit) {
                image[i] = image[i].max(energy);
                labels[i] = TRACK;
            }
        }
    }

    /// Inverse class frequency, so every class present in a sample carries the same total weight.
    fn weights(labels: &[Label]) -> Vec<f32> {
        let mut counts = std::collections::HashMap::new();
        for label in labels {
            *counts.entry(*label).or_insert(0usize) += 1;
        }
        labels
            .iter()
            .map(|label| 1.0 / counts[label] as f32)
            .collect()
    }

    pub fn generate(&mut self) -> Result<Blob, ContractError> {
        let voxels = self.voxels();
        let mut data = Vec::with_capacity(self.batch_size * voxels);
        let mut labels = Vec::with_capacity(self.batch_size * voxels);
        let mut weight = Vec::new();
        for _ in 0..self.batch_size {
            let mut image = vec![0.0f32; voxels];
            let mut label = vec![BACKGROUND; voxels];
            self.shower(&mut image, &mut label);
            let tracks = self.rng.random_range(1..=self.max_tracks);
            for _ in 0..tracks {
                self.track(&mut image, &mut label);
            }
            if self.weighting {
                weight.extend(Self::weights(&label));
            }
            data.extend(image);
            labels.extend(label);
        }

        let mut pixel_shape = vec![self.batch_size];
        pixel_shape.extend(std::iter::repeat(self.side).take(self.dims));
        let mut image_shape = pixel_shape.clone();
        image_shape.push(1);

        let blob = Blob::new(Array::new(image_shape, data)?)
            .with_labels(Array::new(pixel_shape.clone(), labels)?);
        if self.weighting {
            Ok(blob.with_weight(Array::new(pixel_shape, weight)?))
        } else {
            Ok(blob)
        }
    }
}

impl DataSource for ToyDataGenerator {
    fn forward(&mut self) -> anyhow::Result<Blob> {
        Ok(self.generate()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(data_3d: bool) -> TrainConfig {
        TrainConfig {
            image_size: 16,
            batch_size: 2,
            data_3d,
            uresnet_weighting: true,
            ..Default::default()
        }
    }

    #[test]
    fn labels_stay_in_class_domain() {
        for data_3d in [false, true] {
            let blob = ToyDataGenerator::new(&cfg(data_3d), 7).generate().unwrap();
            blob.validate().unwrap();
            let labels = blob.labels.as_ref().unwrap();
            assert!(labels.values().iter().all(|l| (0..3).contains(l)));
            assert!(labels.values().contains(&TRACK));
            for (value, label) in blob.data.values().iter().zip(labels.values()) {
                assert_eq!(*value > 0.0, *label != BACKGROUND);
            }
        }
    }

    #[test]
    fn shapes_follow_config() {
        let blob = ToyDataGenerator::new(&cfg(true), 1).generate().unwrap();
        assert_eq!(blob.data.shape(), &[2, 16, 16, 16, 1]);
        assert_eq!(blob.weight.as_ref().unwrap().shape(), &[2, 16, 16, 16]);

        let mut crop_cfg = cfg(false);
        crop_cfg.enable_crop = true;
        crop_cfg.crop_size = 8;
        let blob = ToyDataGenerator::new(&crop_cfg, 1).generate().unwrap();
        assert_eq!(blob.data.shape(), &[1, 16, 16, 1]);
    }

    #[test]
    fn same_seed_same_images() {
        let a = ToyDataGenerator::new(&cfg(false), 42).generate().unwrap();
        let b = ToyDataGenerator::new(&cfg(false), 42).generate().unwrap();
        let c = ToyDataGenerator::new(&cfg(false), 43).generate().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn weights_balance_classes_per_sample() {
        let blob = ToyDataGenerator::new(&cfg(false), 3).generate().unwrap();
        let weight = blob.weight.as_ref().unwrap();
        let labels = blob.labels.as_ref().unwrap();
        for sample in 0..2 {
            let mut totals = [0.0f32; 3];
            for (w, l) in weight.sample(sample).iter().zip(labels.sample(sample)) {
                totals[*l as usize] += w;
            }
            for total in totals.iter().filter(|t| **t > 0.0) {
                assert!((total - 1.0).abs() < 1e-3);
            }
        }
    }
}
