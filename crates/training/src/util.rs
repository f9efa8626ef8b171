use std::path::PathBuf;

use anyhow::Context;
use burn::backend::Autodiff;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use crate::config::TrainConfig;
use crate::display::PngDisplay;
use crate::toydata::ToyDataGenerator;
use crate::trainer::Trainer;
use crate::TrainBackend;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the UResNet segmentation network on toy detector images"
)]
pub struct TrainArgs {
    /// TOML config file; missing keys keep their defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Override the number of outer steps.
    #[arg(long)]
    pub max_steps: Option<usize>,
    /// Override the summary directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Override the checkpoint directory.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Override the display directory.
    #[arg(long)]
    pub display_dir: Option<PathBuf>,
    /// Checkpoint to restore before training.
    #[arg(long)]
    pub weights: Option<PathBuf>,
    /// Skip PNG displays.
    #[arg(long, default_value_t = false)]
    pub no_display: bool,
}

impl TrainArgs {
    /// Load the config file (or defaults) and apply command-line overrides.
    pub fn resolve_config(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::default(),
        };
        if let Some(steps) = self.max_steps {
            cfg.max_steps = steps;
        }
        if let Some(dir) = &self.log_dir {
            cfg.log_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if let Some(dir) = &self.display_dir {
            cfg.display_dir = dir.clone();
        }
        if let Some(weights) = &self.weights {
            cfg.weights_file = Some(weights.clone());
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve_config()?;
    info!(?cfg, "loaded configuration");

    let train_data = ToyDataGenerator::new(&cfg, cfg.seed);
    let test_data = ToyDataGenerator::new(&cfg, cfg.seed.wrapping_add(1));
    let mut trainer = Trainer::new(cfg, train_data, test_data)?;
    if !args.no_display {
        trainer = trainer.with_display(PngDisplay::default());
    }

    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let report = trainer.train::<ADBackend>(&device)?;
    info!(
        real_steps = report.real_steps,
        train_loss = ?report.last_train_loss,
        test_loss = ?report.last_test_loss,
        "finished"
    );
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; training runs on WGPU despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
