//! Periodic visual dumps of inputs next to predictions.

use std::fs;
use std::path::Path;

use anyhow::Context;
use data_contracts::Blob;
use image::{Rgb, RgbImage};
use tracing::debug;

use crate::config::TrainConfig;
use crate::net::NetResult;

pub trait DisplaySink {
    fn display(
        &mut self,
        blob: &Blob,
        cfg: &TrainConfig,
        step: usize,
        directory: &Path,
        result: &NetResult,
    ) -> anyhow::Result<()>;
}

/// Class colours; background is black, further classes cycle through the list.
const PALETTE: [[u8; 3]; 6] = [
    [0, 0, 0],
    [230, 60, 60],
    [60, 120, 230],
    [80, 200, 90],
    [240, 200, 40],
    [180, 80, 200],
];

/// Writes `display_<step>_<sample>.png`: input in grey on the left, predicted classes on the right.
#[derive(Debug, Clone)]
pub struct PngDisplay {
    /// Input value mapped to white.
    pub vmax: f32,
}

impl Default for PngDisplay {
    fn default() -> Self {
        Self { vmax: 1.0 }
    }
}

impl PngDisplay {
    fn render(&self, pixels: &[f32], predictions: &[i64], side: usize) -> RgbImage {
        let mut img = RgbImage::new((side * 2) as u32, side as u32);
        for y in 0..side {
            for x in 0..side {
                let i = y * side + x;
                let grey = ((pixels[i] / self.vmax).clamp(0.0, 1.0) * 255.0) as u8;
                img.put_pixel(x as u32, y as u32, Rgb([grey, grey, grey]));
                let class = predictions[i].max(0) as usize;
                let colour = if class == 0 {
                    PALETTE[0]
                } else {
                    PALETTE[1 + (class - 1) % (PALETTE.len() - 1)]
                };
                img.put_pixel((side + x) as u32, y as u32, Rgb(colour));
            }
        }
        img
    }
}

impl DisplaySink for PngDisplay {
    fn display(
        &mut self,
        blob: &Blob,
        _cfg: &TrainConfig,
        step: usize,
        directory: &Path,
        result: &NetResult,
    ) -> anyhow::Result<()> {
        let shape = blob.data.shape();
        if shape.len() != 4 {
            debug!(step, rank = shape.len(), "skipping display of non-planar blob");
            return Ok(());
        }
        let (height, width) = (shape[1], shape[2]);
        if height != width {
            debug!(step, height, width, "skipping display of non-square blob");
            return Ok(());
        }
        fs::create_dir_all(directory)
            .with_context(|| format!("creating display dir {}", directory.display()))?;
        for sample in 0..blob.batch_size() {
            let img = self.render(
                blob.data.sample(sample),
                result.predictions.sample(sample),
                width,
            );
            let path = directory.join(format!("display_{step}_{sample}.png"));
            img.save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }
}
