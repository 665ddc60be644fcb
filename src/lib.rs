//! Kikitori: real-time speech capture and structuring pipeline.
//!
//! A continuous audio stream (microphone or file) flows through a cascade
//! of independent stages connected by channels and a typed event bus:
//! - **Audio source**: fixed-size 32ms chunks at 16kHz via `cpal` or a file
//! - **VAD**: Silero ONNX probabilities into a hysteresis state machine
//!   that decides utterance boundaries, with pre-roll so first syllables
//!   survive
//! - **ASR**: Whisper with a five-phase quality-gated retry ladder and a
//!   hallucination filter tuned for Japanese
//! - **Summarizer**: batches accepted segments and maintains a rolling
//!   structured summary through an LLM backend
//!
//! The session aggregate collects segments, errors and summaries, and is
//! persisted as JSON at graceful shutdown.

pub mod app;
pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod summary;
pub mod ui;
pub mod vad;

pub use app::App;
pub use config::ScribeConfig;
pub use error::{Result, ScribeError};
