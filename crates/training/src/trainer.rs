//! Outer training loop: pull, crop, batch, run, record.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use data_contracts::Blob;
use models::UResNet;
use tracing::{info, warn};

use crate::checkpoint::checkpoint_path;
use crate::config::TrainConfig;
use crate::crop::{build_cropper, CropAlgorithm};
use crate::display::DisplaySink;
use crate::net::{NetBuilder, SegmentationNet, StepSummary};
use crate::summary::SummaryWriter;
use crate::toydata::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

impl Mode {
    /// Subdirectory name used for summaries and displays.
    pub fn name(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Test => "test",
        }
    }

    /// Test steps sit in the middle of every `test_every` period; periods shorter than two
    /// would leave no training steps and are rejected by `TrainConfig::validate`.
    pub fn for_step(step: usize, test_every: usize) -> Self {
        if step % test_every == test_every / 2 {
            Mode::Test
        } else {
            Mode::Train
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Batches fed through the network, across both modes.
    pub real_steps: usize,
    pub train_steps: usize,
    pub test_steps: usize,
    pub last_train_loss: Option<f32>,
    pub last_test_loss: Option<f32>,
    pub checkpoints: Vec<PathBuf>,
}

struct SummaryStreams {
    train: SummaryWriter,
    test: SummaryWriter,
}

impl SummaryStreams {
    fn open(cfg: &TrainConfig) -> anyhow::Result<Self> {
        let open = |mode: Mode| {
            let dir = cfg.log_dir.join(mode.name());
            SummaryWriter::create(&dir)
                .with_context(|| format!("opening summary stream in {}", dir.display()))
        };
        Ok(Self {
            train: open(Mode::Train)?,
            test: open(Mode::Test)?,
        })
    }

    fn record(&mut self, mode: Mode, step: usize, summary: &StepSummary) -> anyhow::Result<()> {
        let writer = match mode {
            Mode::Train => &mut self.train,
            Mode::Test => &mut self.test,
        };
        writer
            .add_summary(step, summary)
            .with_context(|| format!("writing {}", writer.path().display()))
    }
}

pub struct Trainer {
    config: TrainConfig,
    train_data: Box<dyn DataSource>,
    test_data: Box<dyn DataSource>,
    display: Option<Box<dyn DisplaySink>>,
    cropper: Option<Box<dyn CropAlgorithm>>,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        train_data: impl DataSource + 'static,
        test_data: impl DataSource + 'static,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        for dir in [&config.log_dir, &config.display_dir, &config.output_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let cropper = config.enable_crop.then(|| build_cropper(&config));
        Ok(Self {
            config,
            train_data: Box::new(train_data),
            test_data: Box::new(test_data),
            display: None,
            cropper,
        })
    }

    pub fn with_display(mut self, sink: impl DisplaySink + 'static) -> Self {
        self.display = Some(Box::new(sink));
        self
    }

    /// Replace the cropper built from the config; only used when cropping is enabled.
    pub fn with_cropper(mut self, cropper: impl CropAlgorithm + 'static) -> Self {
        if !self.config.enable_crop {
            warn!("cropper supplied but enable_crop is false; it will not be used");
        } else {
            self.cropper = Some(Box::new(cropper));
        }
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn train<B: AutodiffBackend>(&mut self, device: &B::Device) -> anyhow::Result<TrainReport> {
        info!(
            side = self.config.network_side(),
            dims = self.config.dims(),
            "creating net architecture"
        );
        let placed = NetBuilder::from_train_config(&self.config).init_placeholders(None)?;
        let mut net = placed.create_architecture::<B, _>(AdamConfig::new().init(), device)?;
        if let Some(weights) = &self.config.weights_file {
            net.load_checkpoint(weights)
                .with_context(|| format!("restoring weights from {}", weights.display()))?;
            info!(path = %weights.display(), "restored weights");
        }

        let mut streams = SummaryStreams::open(&self.config)?;
        let mut report = TrainReport::default();
        for step in 0..self.config.max_steps {
            let mode = Mode::for_step(step, self.config.test_every);
            let blob = match mode {
                Mode::Train => self.train_data.forward(),
                Mode::Test => self.test_data.forward(),
            }
            .with_context(|| format!("reading {} data at step {step}", mode.name()))?;
            let blob = if blob.crops.is_some() {
                blob.promote_crops(self.config.crop_size, self.config.dims())?
            } else {
                blob
            };
            let pieces = match &self.cropper {
                Some(cropper) => cropper.process(&blob)?,
                None => vec![blob],
            };
            for chunk in pieces.chunks(self.config.batch_size) {
                let batch = Blob::concat(chunk)?;
                self.run_batch(&mut net, &batch, mode, &mut streams, &mut report)?;
            }
        }
        info!(
            real_steps = report.real_steps,
            checkpoints = report.checkpoints.len(),
            "training done"
        );
        Ok(report)
    }

    fn run_batch<B, O>(
        &mut self,
        net: &mut SegmentationNet<B, O>,
        batch: &Blob,
        mode: Mode,
        streams: &mut SummaryStreams,
        report: &mut TrainReport,
    ) -> anyhow::Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<UResNet<B>, B>,
    {
        report.real_steps += 1;
        let step = report.real_steps;
        let (summary, result) = match mode {
            Mode::Train => net.train_step(batch)?,
            Mode::Test => net.test_image(batch)?,
        };
        streams.record(mode, step, &summary)?;
        match mode {
            Mode::Train => {
                report.train_steps += 1;
                report.last_train_loss = Some(summary.loss);
            }
            Mode::Test => {
                report.test_steps += 1;
                report.last_test_loss = Some(summary.loss);
            }
        }
        if !summary.loss.is_finite() {
            warn!(step, mode = mode.name(), "non-finite loss");
        }
        if step % self.config.log_every == 0 {
            info!(step, mode = mode.name(), loss = summary.loss, "real step");
        }

        if step % self.config.display_every == 0 {
            if let Some(display) = self.display.as_mut() {
                let dir = self.config.display_dir.join(mode.name());
                display.display(batch, &self.config, step, &dir, &result)?;
            }
        }
        if step % self.config.checkpoint_every == 0 {
            let path = checkpoint_path(&self.config.output_dir, step);
            net.save_checkpoint(&path)?;
            info!(path = %path.display(), "wrote checkpoint");
            report.checkpoints.push(path);
        }
        Ok(())
    }
}
