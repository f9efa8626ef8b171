use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use models::UResNet;
use thiserror::Error;

/// Full-precision binary record; the bytes are written to disk unchanged.
pub type CheckpointRecorder = BinBytesRecorder<FullPrecisionSettings>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to encode parameters: {0}")]
    Encode(String),
    #[error("failed to decode checkpoint {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("checkpoint io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `OUTPUT_DIR/model-<step>.ckpt`
pub fn checkpoint_path(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("model-{step}.ckpt"))
}

pub fn encode_model<B: Backend>(model: &UResNet<B>) -> Result<Vec<u8>, CheckpointError> {
    let recorder = CheckpointRecorder::default();
    <CheckpointRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| CheckpointError::Encode(e.to_string()))
}

pub fn save_checkpoint<B: Backend>(model: &UResNet<B>, path: &Path) -> Result<(), CheckpointError> {
    let bytes = encode_model(model)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Restore parameters into `model`, which must have the architecture the checkpoint was saved from.
pub fn load_checkpoint<B: Backend>(
    model: UResNet<B>,
    path: &Path,
    device: &B::Device,
) -> Result<UResNet<B>, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let recorder = CheckpointRecorder::default();
    let record = <CheckpointRecorder as Recorder<B>>::load(&recorder, bytes, device).map_err(|e| {
        CheckpointError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    Ok(model.load_record(record))
}
