//! Silero VAD inference via ONNX Runtime.
//!
//! The v5 model takes a 512-sample window at 16kHz plus a combined LSTM
//! state tensor `[2, 1, 128]` and returns a speech probability. The model
//! file is fetched once into the user cache directory.

use crate::config::{VadModelConfig, SILERO_CHUNK_SIZE};
use crate::error::{Result, ScribeError};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array0, Array2, Array3};
use ort::session::Session;
use ort::value::Tensor;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Sample rate the model is trained for.
const SAMPLE_RATE: i64 = 16_000;
/// Combined LSTM state size of the v5 model.
const HIDDEN_SIZE: usize = 128;

/// Stateful Silero VAD session.
pub struct SileroVad {
    session: Session,
    /// Combined LSTM state `[2, 1, 128]`, carried between chunks.
    state: Array3<f32>,
}

impl SileroVad {
    /// Load the model, downloading it into the cache first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the download or session construction fails; both
    /// are fatal at startup.
    pub fn new(config: &VadModelConfig) -> Result<Self> {
        let model_path = ensure_model(config)?;

        let session = Session::builder()
            .map_err(|e| ScribeError::Vad(format!("failed to create session builder: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| ScribeError::Vad(format!("failed to set intra threads: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| {
                ScribeError::Vad(format!(
                    "failed to load VAD model '{}': {e}",
                    model_path.display()
                ))
            })?;

        info!("Silero VAD loaded from {}", model_path.display());

        Ok(Self {
            session,
            state: Array3::zeros((2, 1, HIDDEN_SIZE)),
        })
    }

    /// Run inference on one 512-sample chunk and return the speech
    /// probability.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong-sized chunk or an inference failure.
    pub fn process(&mut self, chunk: &[f32]) -> Result<f32> {
        if chunk.len() != SILERO_CHUNK_SIZE {
            return Err(ScribeError::Vad(format!(
                "expected {SILERO_CHUNK_SIZE}-sample chunk, got {}",
                chunk.len()
            )));
        }

        let input = Array2::from_shape_vec((1, SILERO_CHUNK_SIZE), chunk.to_vec())
            .map_err(|e| ScribeError::Vad(format!("input shape error: {e}")))?;
        let input_val =
            Tensor::from_array(input).map_err(|e| ScribeError::Vad(format!("input tensor: {e}")))?;
        let state_val = Tensor::from_array(self.state.clone())
            .map_err(|e| ScribeError::Vad(format!("state tensor: {e}")))?;
        let sr_val = Tensor::from_array(Array0::from_elem((), SAMPLE_RATE))
            .map_err(|e| ScribeError::Vad(format!("sr tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs!("input" => input_val, "state" => state_val, "sr" => sr_val))
            .map_err(|e| ScribeError::Vad(format!("inference failed: {e}")))?;

        let (_shape, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ScribeError::Vad(format!("output extraction: {e}")))?;
        let probability = probs.first().copied().unwrap_or(0.0);

        if let Ok((_shape, next_state)) = outputs[1].try_extract_tensor::<f32>() {
            if next_state.len() == 2 * HIDDEN_SIZE {
                if let Ok(arr) = Array3::from_shape_vec((2, 1, HIDDEN_SIZE), next_state.to_vec()) {
                    self.state = arr;
                }
            }
        }

        Ok(probability)
    }

    /// Zero the LSTM state. Called between utterances and after long idle
    /// periods to undo internal state drift.
    pub fn reset_states(&mut self) {
        self.state = Array3::zeros((2, 1, HIDDEN_SIZE));
    }
}

impl crate::vad::VadModel for SileroVad {
    fn probability(&mut self, chunk: &[f32]) -> Result<f32> {
        self.process(chunk)
    }

    fn reset_states(&mut self) {
        Self::reset_states(self);
    }
}

/// Resolve the model path, downloading the model on first use.
fn ensure_model(config: &VadModelConfig) -> Result<PathBuf> {
    let path = config.model_path();
    if path.exists() {
        return Ok(path);
    }
    download_model(&config.url, &path)?;
    Ok(path)
}

/// Fetch the ONNX model, staging it next to the cache path so an
/// interrupted download never leaves a truncated model behind.
fn download_model(url: &str, dest: &Path) -> Result<()> {
    info!("fetching Silero VAD model from {url}");
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let response = ureq::get(url)
        .call()
        .map_err(|e| ScribeError::Vad(format!("VAD model download failed: {e}")))?;
    let total_bytes = response
        .header("content-length")
        .and_then(|v| v.parse::<u64>().ok());

    let bar = match total_bytes {
        Some(n) => ProgressBar::new(n),
        None => ProgressBar::new_spinner(),
    };
    if let Ok(style) = ProgressStyle::with_template("silero_vad.onnx {bytes}/{total_bytes} ({eta})")
    {
        bar.set_style(style);
    }

    let staging = dest.with_extension("onnx.partial");
    let mut output = std::fs::File::create(&staging)?;
    let mut body = response.into_reader();
    let mut block = [0u8; 32 * 1024];
    loop {
        let read = body
            .read(&mut block)
            .map_err(|e| ScribeError::Vad(format!("VAD model download interrupted: {e}")))?;
        if read == 0 {
            break;
        }
        output.write_all(&block[..read])?;
        bar.inc(read as u64);
    }
    bar.finish_and_clear();

    std::fs::rename(&staging, dest)?;
    info!("VAD model cached at {}", dest.display());
    Ok(())
}
