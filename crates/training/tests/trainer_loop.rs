use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use burn::backend::{ndarray::NdArray, Autodiff};
use data_contracts::{Array, Blob};
use training::summary::EVENTS_FILE;
use training::{
    read_events, DataSource, DisplaySink, NetResult, ToyDataGenerator, TrainConfig, Trainer,
};

type TestBackend = Autodiff<NdArray<f32>>;

fn small_config(root: &Path) -> TrainConfig {
    TrainConfig {
        base_num_outputs: 4,
        num_strides: 1,
        ppn1_index: 0,
        ppn2_index: 1,
        image_size: 8,
        max_steps: 6,
        checkpoint_every: 2,
        display_every: 3,
        log_every: 1,
        test_every: 4,
        log_dir: root.join("log"),
        display_dir: root.join("display"),
        output_dir: root.join("ckpt"),
        ..Default::default()
    }
}

#[derive(Clone, Default)]
struct RecordingDisplay {
    calls: Rc<RefCell<Vec<(usize, PathBuf, Vec<usize>)>>>,
}

impl DisplaySink for RecordingDisplay {
    fn display(
        &mut self,
        blob: &Blob,
        _cfg: &TrainConfig,
        step: usize,
        directory: &Path,
        result: &NetResult,
    ) -> anyhow::Result<()> {
        assert_eq!(blob.pixel_shape(), result.predictions.shape());
        self.calls
            .borrow_mut()
            .push((step, directory.to_path_buf(), blob.data.shape().to_vec()));
        Ok(())
    }
}

struct CountingSource {
    inner: ToyDataGenerator,
    pulls: Rc<RefCell<usize>>,
}

impl DataSource for CountingSource {
    fn forward(&mut self) -> anyhow::Result<Blob> {
        *self.pulls.borrow_mut() += 1;
        self.inner.forward()
    }
}

#[test]
fn loop_alternates_modes_and_writes_artifacts_on_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_config(dir.path());
    let train_pulls = Rc::new(RefCell::new(0));
    let test_pulls = Rc::new(RefCell::new(0));
    let display = RecordingDisplay::default();

    let train = CountingSource {
        inner: ToyDataGenerator::new(&cfg, 1),
        pulls: train_pulls.clone(),
    };
    let test = CountingSource {
        inner: ToyDataGenerator::new(&cfg, 2),
        pulls: test_pulls.clone(),
    };
    let mut trainer = Trainer::new(cfg.clone(), train, test)
        .unwrap()
        .with_display(display.clone());
    let report = trainer.train::<TestBackend>(&Default::default()).unwrap();

    assert_eq!(report.real_steps, 6);
    assert_eq!(*test_pulls.borrow(), 1);
    assert_eq!(*train_pulls.borrow(), 5);
    assert_eq!((report.train_steps, report.test_steps), (5, 1));
    assert!(report.last_test_loss.is_some());

    let expected: Vec<PathBuf> = [2, 4, 6]
        .iter()
        .map(|s| cfg.output_dir.join(format!("model-{s}.ckpt")))
        .collect();
    assert_eq!(report.checkpoints, expected);
    for path in &expected {
        assert!(path.is_file(), "{} missing", path.display());
    }

    let calls = display.calls.borrow();
    let steps: Vec<usize> = calls.iter().map(|c| c.0).collect();
    assert_eq!(steps, [3, 6]);
    // Outer step 2 is the test step, i.e. real step 3.
    assert_eq!(calls[0].1, cfg.display_dir.join("test"));
    assert_eq!(calls[1].1, cfg.display_dir.join("train"));

    let train_events = read_events(&cfg.log_dir.join("train").join(EVENTS_FILE)).unwrap();
    let test_events = read_events(&cfg.log_dir.join("test").join(EVENTS_FILE)).unwrap();
    assert_eq!(train_events.len(), 5);
    assert_eq!(test_events.len(), 1);
    assert_eq!(test_events[0].step, 3);
    assert!(test_events[0].accuracy_all.is_none());
    assert!(train_events.iter().all(|e| e.accuracy_all.is_some()));
}

#[test]
fn cropping_batches_tiles_into_real_steps() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        image_size: 16,
        crop_size: 8,
        enable_crop: true,
        batch_size: 2,
        max_steps: 2,
        checkpoint_every: 100,
        display_every: 1,
        ..small_config(dir.path())
    };
    let display = RecordingDisplay::default();
    let mut trainer = Trainer::new(
        cfg.clone(),
        ToyDataGenerator::new(&cfg, 5),
        ToyDataGenerator::new(&cfg, 6),
    )
    .unwrap()
    .with_display(display.clone());
    let report = trainer.train::<TestBackend>(&Default::default()).unwrap();

    // Four 8x8 tiles per 16x16 image, two per batch.
    assert_eq!(report.real_steps, 4);
    assert!(report.checkpoints.is_empty());
    for call in display.calls.borrow().iter() {
        assert_eq!(call.2, [2, 8, 8, 1]);
    }
}

#[test]
fn restored_weights_feed_into_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        max_steps: 2,
        ..small_config(dir.path())
    };
    let mut first = Trainer::new(
        cfg.clone(),
        ToyDataGenerator::new(&cfg, 1),
        ToyDataGenerator::new(&cfg, 2),
    )
    .unwrap();
    let report = first.train::<TestBackend>(&Default::default()).unwrap();
    let weights = report.checkpoints.last().cloned().unwrap();

    let resumed = TrainConfig {
        weights_file: Some(weights),
        ..cfg.clone()
    };
    let mut second = Trainer::new(
        resumed.clone(),
        ToyDataGenerator::new(&resumed, 1),
        ToyDataGenerator::new(&resumed, 2),
    )
    .unwrap();
    assert!(second.train::<TestBackend>(&Default::default()).is_ok());

    let missing = TrainConfig {
        weights_file: Some(dir.path().join("nope.ckpt")),
        ..cfg
    };
    let mut third = Trainer::new(
        missing.clone(),
        ToyDataGenerator::new(&missing, 1),
        ToyDataGenerator::new(&missing, 2),
    )
    .unwrap();
    assert!(third.train::<TestBackend>(&Default::default()).is_err());
}

#[test]
fn invalid_config_is_rejected_before_creating_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        image_size: 9,
        ..small_config(dir.path())
    };
    let result = Trainer::new(
        cfg.clone(),
        ToyDataGenerator::new(&cfg, 1),
        ToyDataGenerator::new(&cfg, 2),
    );
    assert!(result.is_err());
    assert!(!cfg.log_dir.exists());
}

#[test]
fn missing_output_dirs_are_created_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("runs").join("fresh");
    let cfg = small_config(&root);
    assert!(!root.exists());
    let trainer = Trainer::new(
        cfg.clone(),
        ToyDataGenerator::new(&cfg, 1),
        ToyDataGenerator::new(&cfg, 2),
    )
    .unwrap();
    for created in [&cfg.log_dir, &cfg.display_dir, &cfg.output_dir] {
        assert!(created.is_dir(), "{} was not created", created.display());
    }
    assert_eq!(trainer.config().log_dir, cfg.log_dir);
}

#[test]
fn pre_cut_crops_are_promoted() {
    struct PreCut;
    impl DataSource for PreCut {
        fn forward(&mut self) -> anyhow::Result<Blob> {
            let mut blob = Blob::new(Array::filled(vec![1, 8, 8, 1], 0.0))
                .with_labels(Array::filled(vec![1, 8, 8], 0));
            blob.crops = Some(Array::filled(vec![2, 4, 4, 1], 0.5));
            blob.crops_labels = Some(Array::filled(vec![2, 4, 4], 1));
            Ok(blob)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        image_size: 8,
        crop_size: 4,
        enable_crop: true,
        max_steps: 1,
        display_every: 1,
        ..small_config(dir.path())
    };
    let display = RecordingDisplay::default();
    let mut trainer = Trainer::new(cfg, PreCut, PreCut)
        .unwrap()
        .with_display(display.clone());
    let report = trainer.train::<TestBackend>(&Default::default()).unwrap();
    assert_eq!(report.real_steps, 2);
    assert!(display
        .calls
        .borrow()
        .iter()
        .all(|c| c.2 == [1, 4, 4, 1]));
}
