//! Whisper speech recognition via whisper.cpp bindings.

use crate::asr::{AsrEngine, AsrOutput, AsrSegmentInfo};
use crate::config::WhisperParams;
use crate::error::{Result, ScribeError};
use std::path::Path;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Production ASR engine wrapping a whisper.cpp model.
pub struct WhisperEngine {
    ctx: WhisperContext,
}

impl WhisperEngine {
    /// Load a ggml model file.
    ///
    /// # Errors
    ///
    /// Returns an error if the model file is missing or fails to load.
    pub fn new(model_path: &str) -> Result<Self> {
        if !Path::new(model_path).exists() {
            return Err(ScribeError::Asr(format!(
                "whisper model not found: {model_path} (set whisper.model in config.toml)"
            )));
        }

        let ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .map_err(|e| ScribeError::Asr(format!("failed to load whisper model: {e}")))?;
        info!("whisper model loaded: {model_path}");
        Ok(Self { ctx })
    }

    fn full_params<'a>(params: &'a WhisperParams) -> FullParams<'a, 'a> {
        let mut fp = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        fp.set_language(Some(params.language.as_str()));
        fp.set_temperature(params.temperature);
        fp.set_no_context(!params.condition_on_previous_text);
        if let Some(ref prompt) = params.initial_prompt {
            fp.set_initial_prompt(prompt);
        }
        // entropy_thold is whisper.cpp's analog of the compression-ratio
        // gate, on the same numeric scale.
        fp.set_entropy_thold(params.compression_ratio_threshold);
        fp.set_logprob_thold(params.logprob_threshold);
        fp.set_no_speech_thold(params.no_speech_threshold);
        fp.set_print_special(false);
        fp.set_print_progress(false);
        fp.set_print_realtime(false);
        fp.set_print_timestamps(false);
        fp
    }
}

impl AsrEngine for WhisperEngine {
    fn transcribe(&mut self, samples: &[f32], params: &WhisperParams) -> Result<AsrOutput> {
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| ScribeError::Asr(format!("failed to create decode state: {e}")))?;

        state
            .full(Self::full_params(params), samples)
            .map_err(|e| ScribeError::Asr(format!("transcription failed: {e}")))?;

        let num_segments = state.full_n_segments();
        let mut text = String::new();
        let mut segments = Vec::with_capacity(num_segments as usize);

        for i in 0..num_segments {
            if let Some(segment) = state.get_segment(i) {
                match segment.to_str() {
                    Ok(s) => text.push_str(s),
                    Err(e) => {
                        return Err(ScribeError::Asr(format!("segment {i} not valid UTF-8: {e}")))
                    }
                }
                // The bindings expose no per-segment confidence metrics;
                // the filter treats missing values as absent.
                segments.push(AsrSegmentInfo::default());
            }
        }

        Ok(AsrOutput { text, segments })
    }
}
