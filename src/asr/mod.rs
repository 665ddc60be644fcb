//! Speech recognition: engine abstraction, quality filtering, retry
//! strategy, and the transcription worker.

pub mod filter;
pub mod strategy;
pub mod whisper;
pub mod worker;

pub use filter::HallucinationFilter;
pub use strategy::{RetryStrategy, StrategyDecision};
pub use whisper::WhisperEngine;
pub use worker::{TranscriberClient, TranscriberHandle, TranscriptionWorker};

use crate::config::WhisperParams;
use crate::error::Result;

/// Quality metrics for one engine-level segment. Engines that cannot supply
/// a metric leave it `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsrSegmentInfo {
    /// Mean token log-probability of the segment.
    pub avg_logprob: Option<f32>,
    /// Token compression ratio of the segment.
    pub compression_ratio: Option<f32>,
    /// Probability the segment is not speech.
    pub no_speech_prob: Option<f32>,
}

/// One engine invocation result.
#[derive(Debug, Clone, Default)]
pub struct AsrOutput {
    /// Raw transcribed text (not yet trimmed).
    pub text: String,
    /// Per-segment metrics, in order.
    pub segments: Vec<AsrSegmentInfo>,
}

/// A speech recognition engine: audio in, text plus metrics out.
///
/// [`WhisperEngine`] is the production implementation; the worker is
/// engine-agnostic so tests substitute scripted engines.
pub trait AsrEngine: Send {
    /// Transcribe a complete utterance with the given decode parameters.
    ///
    /// # Errors
    ///
    /// Returns an error on an engine-level failure (not a quality problem).
    fn transcribe(&mut self, samples: &[f32], params: &WhisperParams) -> Result<AsrOutput>;
}
