//! Configuration types for the transcription pipeline.
//!
//! Settings load from `config.toml` merged with an optional
//! `config.local.toml` (deep merge, later wins), with every field carrying a
//! sensible default so both files are optional.

use crate::error::{Result, ScribeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Chunk size the Silero VAD model accepts at 16kHz. The model is trained on
/// exactly this window; `CoreConfig` validation enforces it.
pub const SILERO_CHUNK_SIZE: usize = 512;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScribeConfig {
    /// Sample format fundamentals shared by every stage.
    pub core: CoreConfig,
    /// Audio source settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Whisper transcription settings.
    pub whisper: WhisperConfig,
    /// Hallucination filter settings.
    pub hallucination: HallucinationConfig,
    /// Summary generation settings.
    pub summary: SummaryConfig,
    /// Application-level settings.
    pub app: AppConfig,
}

/// Sample rate and chunk timing shared across the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds.
    pub chunk_ms: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 32,
        }
    }
}

impl CoreConfig {
    /// Samples per chunk, derived from sample rate and chunk duration.
    pub fn chunk_size(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

/// Audio source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device block duration in seconds.
    pub block_sec: f64,
    /// Timeout for queue reads in the audio path, in seconds.
    pub queue_get_timeout_sec: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            block_sec: 0.1,
            queue_get_timeout_sec: 0.5,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// ONNX model location settings.
    pub model: VadModelConfig,
    /// Detection thresholds and timing.
    pub detection: VadDetectionConfig,
}

/// Silero VAD model location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadModelConfig {
    /// Download URL for the ONNX model.
    pub url: String,
    /// Local model path override (None = user cache directory).
    pub path: Option<PathBuf>,
}

impl Default for VadModelConfig {
    fn default() -> Self {
        Self {
            url: "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx"
                .to_owned(),
            path: None,
        }
    }
}

impl VadModelConfig {
    /// Resolved on-disk model path (`~/.cache/silero-vad/silero_vad.onnx`
    /// unless overridden).
    pub fn model_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => p.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("silero-vad")
                .join("silero_vad.onnx"),
        }
    }
}

/// VAD detection thresholds.
///
/// Hysteresis: the start threshold is deliberately higher than the end
/// threshold, so noise does not trigger recording but trailing phonemes are
/// not clipped once it has started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadDetectionConfig {
    /// Speech probability threshold while idle.
    pub start_threshold: f32,
    /// Speech probability threshold while recording.
    pub end_threshold: f32,
    /// Consecutive speech chunks required to start recording.
    pub min_speech_chunks: usize,
    /// Consecutive silence chunks that end a recording (~800ms at 32ms).
    pub max_silence_chunks: usize,
    /// Idle silence chunks before the VAD model state is reset (~32s).
    pub idle_reset_chunks: usize,
    /// Pre-roll buffer length in seconds, prepended to each utterance.
    pub pre_roll_sec: f64,
}

impl Default for VadDetectionConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.5,
            end_threshold: 0.3,
            min_speech_chunks: 3,
            max_silence_chunks: 25,
            idle_reset_chunks: 1000,
            pre_roll_sec: 3.0,
        }
    }
}

impl VadDetectionConfig {
    /// Pre-roll capacity in chunks for the given chunk duration.
    pub fn pre_roll_chunks(&self, chunk_ms: u32) -> usize {
        ((self.pre_roll_sec * 1000.0) / f64::from(chunk_ms)).ceil() as usize
    }
}

/// A single Whisper decode parameter set.
///
/// The retry strategy walks an ordered list of these, each stricter than the
/// last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperParams {
    /// Language code passed to the decoder.
    pub language: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether earlier output conditions later decoding.
    pub condition_on_previous_text: bool,
    /// Initial prompt biasing the decoder, if any.
    pub initial_prompt: Option<String>,
    /// Compression ratio above which a decode is rejected in-engine.
    pub compression_ratio_threshold: f32,
    /// Mean token log-probability below which a decode is rejected in-engine.
    pub logprob_threshold: f32,
    /// No-speech probability above which a segment is treated as silence.
    pub no_speech_threshold: f32,
}

/// Default initial prompt. Also appears in the banned-phrase list: Whisper
/// echoes the prompt back on silent or degenerate audio.
pub const DEFAULT_INITIAL_PROMPT: &str = "議事録です。句読点を付けてください。";

fn default_whisper_params() -> Vec<WhisperParams> {
    let base = |temperature: f32,
                initial_prompt: Option<String>,
                compression: f32,
                logprob: f32,
                no_speech: f32| WhisperParams {
        language: "ja".to_owned(),
        temperature,
        condition_on_previous_text: false,
        initial_prompt,
        compression_ratio_threshold: compression,
        logprob_threshold: logprob,
        no_speech_threshold: no_speech,
    };
    let prompt = Some(DEFAULT_INITIAL_PROMPT.to_owned());
    vec![
        // Phase 1: standard decode.
        base(0.0, prompt.clone(), 2.4, -1.0, 0.6),
        // Phase 2: tighter compression gate against repetition loops.
        base(0.0, prompt, 2.0, -1.0, 0.6),
        // Phase 3: drop the prompt to remove its bias.
        base(0.0, None, 2.2, -1.0, 0.6),
        // Phase 4: stricter confidence gates.
        base(0.0, None, 1.8, -0.6, 0.5),
        // Phase 5: final gate.
        base(0.0, None, 1.4, -0.4, 0.4),
    ]
}

/// Whisper transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// Path to the ggml model file.
    pub model: String,
    /// Graceful-shutdown drain deadline in seconds.
    pub shutdown_timeout_sec: f64,
    /// Ordered retry parameter phases.
    pub params: Vec<WhisperParams>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "models/ggml-large-v3-turbo.bin".to_owned(),
            shutdown_timeout_sec: 10.0,
            params: default_whisper_params(),
        }
    }
}

fn default_banned_phrases() -> Vec<String> {
    [
        // The initial prompt and its fragments, echoed back on silence.
        "議事録です。句読点を付けてください",
        "句読点を付けてください",
        // Video-transcript boilerplate the model was trained on.
        "ご視聴ありがとうございました",
        "ご視聴ありがとうございます",
        "チャンネル登録",
        "高評価",
        "コメント欄",
        "次の動画でお会いしましょう",
        "動画をご覧いただき",
        // Subtitle credits.
        "字幕作成",
        "字幕提供",
        "翻訳・字幕",
        // large-v3 silence artifacts.
        "ご清聴ありがとうございました",
        "最後までご覧いただきありがとうございます",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_greeting_phrases() -> Vec<String> {
    [
        "おはようございます",
        "こんにちは",
        "こんばんは",
        "おやすみなさい",
        "ありがとうございました",
        "お疲れ様でした",
        "よろしくお願いします",
        "失礼します",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Hallucination filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HallucinationConfig {
    /// Substrings that always mark a transcription as hallucinated.
    pub banned_phrases: Vec<String>,
    /// Consecutive identical characters that trigger rejection.
    pub min_char_repetition: usize,
    /// Longest short pattern length to scan for.
    pub short_pattern_max_length: usize,
    /// How many start offsets to try per short pattern length.
    pub pattern_search_start_positions: usize,
    /// Occurrences of a short pattern that trigger rejection.
    pub min_short_pattern_repetition: usize,
    /// Minimum fraction of the text a repeated pattern must cover.
    pub repetition_ratio_threshold: f32,
    /// Shortest long pattern length to scan for.
    pub long_pattern_min_length: usize,
    /// Longest long pattern length to scan for.
    pub long_pattern_max_length: usize,
    /// Occurrences of a long pattern that trigger rejection.
    pub min_long_pattern_repetition: usize,
    /// Identical trailing tokens that trigger rejection.
    pub min_token_repetition: usize,
    /// Greetings that are suspicious when they appear without context.
    pub contextless_greeting_phrases: Vec<String>,
    /// Maximum normalized length for the contextless-greeting check.
    pub short_text_threshold: usize,
    /// Mean log-probability below which a lone greeting is rejected.
    pub low_logprob_threshold: f32,
    /// Audio length above which a lone short greeting is rejected, seconds.
    pub long_audio_threshold: f32,
    /// Mean log-probability below which any text is rejected outright.
    pub extreme_low_logprob_threshold: f32,
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        Self {
            banned_phrases: default_banned_phrases(),
            min_char_repetition: 10,
            short_pattern_max_length: 10,
            pattern_search_start_positions: 50,
            min_short_pattern_repetition: 5,
            repetition_ratio_threshold: 0.5,
            long_pattern_min_length: 11,
            long_pattern_max_length: 50,
            min_long_pattern_repetition: 3,
            min_token_repetition: 5,
            contextless_greeting_phrases: default_greeting_phrases(),
            short_text_threshold: 15,
            low_logprob_threshold: -0.8,
            long_audio_threshold: 5.0,
            extreme_low_logprob_threshold: -1.7,
        }
    }
}

/// Which LLM backend generates summaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryBackend {
    /// Anthropic Messages API.
    #[default]
    Claude,
    /// OpenAI-compatible server (vLLM and friends).
    Vllm,
}

/// Summary generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Whether summarization runs at all.
    pub enabled: bool,
    /// Backend selection.
    pub backend: SummaryBackend,
    /// Claude model identifier.
    pub claude_model: String,
    /// Anthropic API key (falls back to `ANTHROPIC_API_KEY`).
    pub anthropic_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible server.
    pub vllm_base_url: String,
    /// API key for the OpenAI-compatible server, if it requires one.
    pub vllm_api_key: Option<String>,
    /// Model name on the OpenAI-compatible server.
    pub vllm_model: Option<String>,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// Pending text length (chars) that triggers a summary round.
    pub trigger_threshold: usize,
    /// Silence after the last segment that triggers a summary round, seconds.
    pub silence_timeout_sec: f64,
    /// How many already-summarized segments are replayed as context.
    pub recent_segments_for_context: usize,
    /// Worker wake timeout in seconds.
    pub queue_get_timeout_sec: f64,
    /// Final-summary join deadline at shutdown, seconds.
    pub shutdown_timeout_sec: f64,
    /// Sampling temperature for realtime summaries (None = API default).
    pub realtime_temperature: Option<f32>,
    /// Nucleus sampling for realtime summaries (None = API default).
    pub realtime_top_p: Option<f32>,
    /// Sampling temperature for the final summary (None = API default).
    pub final_temperature: Option<f32>,
    /// Nucleus sampling for the final summary (None = API default).
    pub final_top_p: Option<f32>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: SummaryBackend::Claude,
            claude_model: "claude-3-5-haiku-20241022".to_owned(),
            anthropic_api_key: None,
            vllm_base_url: "http://localhost:8000/v1".to_owned(),
            vllm_api_key: None,
            vllm_model: None,
            max_tokens: 4096,
            trigger_threshold: 600,
            silence_timeout_sec: 60.0,
            recent_segments_for_context: 5,
            queue_get_timeout_sec: 1.0,
            shutdown_timeout_sec: 2.0,
            realtime_temperature: None,
            realtime_top_p: None,
            final_temperature: None,
            final_top_p: None,
        }
    }
}

impl SummaryConfig {
    /// Claude API key from config or the `ANTHROPIC_API_KEY` environment
    /// variable.
    pub fn resolve_claude_api_key(&self) -> Option<String> {
        self.anthropic_api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Whether to persist the session JSON at graceful shutdown.
    pub save_json: bool,
    /// UI status refresh interval in seconds.
    pub status_update_interval_sec: f64,
    /// Poll interval while reporting drain progress at shutdown, seconds.
    pub transcription_progress_poll_interval_sec: f64,
    /// Maximum characters of segment text shown in the status line.
    pub ui_text_truncate: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            save_json: true,
            status_update_interval_sec: 0.1,
            transcription_progress_poll_interval_sec: 0.5,
            ui_text_truncate: 60,
        }
    }
}

impl ScribeConfig {
    /// Load configuration from a single TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ScribeError::Config(e.to_string()))
    }

    /// Load configuration from `config.toml` merged with
    /// `config.local.toml` in `dir`. Missing files contribute nothing; the
    /// local file wins on overlapping keys.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be read or parsed, or if
    /// the merged document does not deserialize.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut merged = toml::Table::new().into();
        for name in ["config.toml", "config.local.toml"] {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let value: toml::Value = content
                .parse()
                .map_err(|e: toml::de::Error| ScribeError::Config(format!("{name}: {e}")))?;
            merged = deep_merge(merged, value);
        }
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ScribeError::Config(e.to_string()))
    }

    /// Validate cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error when the derived chunk size is not the
    /// Silero window, when the whisper phase table is empty, or when the
    /// selected summary backend is missing its credentials.
    pub fn validate(&self, summary_requested: bool) -> Result<()> {
        let chunk = self.core.chunk_size();
        if chunk != SILERO_CHUNK_SIZE {
            return Err(ScribeError::Config(format!(
                "core.sample_rate={} with core.chunk_ms={} derives a {chunk}-sample chunk, \
                 but the Silero VAD model only accepts {SILERO_CHUNK_SIZE}-sample windows",
                self.core.sample_rate, self.core.chunk_ms
            )));
        }
        if self.whisper.params.is_empty() {
            return Err(ScribeError::Config(
                "whisper.params must contain at least one phase".to_owned(),
            ));
        }
        if summary_requested && self.summary.enabled {
            match self.summary.backend {
                SummaryBackend::Claude => {
                    if self.summary.resolve_claude_api_key().is_none() {
                        return Err(ScribeError::Config(
                            "summary.backend = \"claude\" requires an API key: set \
                             summary.anthropic_api_key or ANTHROPIC_API_KEY, or pass --no-summary"
                                .to_owned(),
                        ));
                    }
                }
                SummaryBackend::Vllm => {
                    if self.summary.vllm_model.is_none() {
                        return Err(ScribeError::Config(
                            "summary.backend = \"vllm\" requires summary.vllm_model".to_owned(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Recursively merge two TOML values; `over` wins on conflicts, tables merge
/// key-by-key.
fn deep_merge(base: toml::Value, over: toml::Value) -> toml::Value {
    match (base, over) {
        (toml::Value::Table(mut base), toml::Value::Table(over)) => {
            for (key, over_value) in over {
                match base.remove(&key) {
                    Some(base_value) => {
                        base.insert(key, deep_merge(base_value, over_value));
                    }
                    None => {
                        base.insert(key, over_value);
                    }
                }
            }
            toml::Value::Table(base)
        }
        (_, over) => over,
    }
}
