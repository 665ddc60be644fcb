//! Voice activity detection.
//!
//! [`VadStateMachine`] turns a stream of per-chunk speech probabilities into
//! recording start/stop decisions with hysteresis; [`silero::SileroVad`]
//! produces those probabilities from raw audio.

pub mod silero;

pub use silero::SileroVad;

use crate::config::VadDetectionConfig;
use crate::error::Result;

/// Stateful speech-probability model: one 512-sample chunk in, one
/// probability out. [`SileroVad`] is the production implementation; tests
/// substitute scripted models.
pub trait VadModel: Send {
    /// Speech probability in `[0, 1]` for the chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn probability(&mut self, chunk: &[f32]) -> Result<f32>;

    /// Zero any internal recurrent state.
    fn reset_states(&mut self);
}

/// Decision produced for one probability sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadAction {
    /// Nothing to do.
    None,
    /// Enough consecutive speech observed; begin recording.
    StartRecording,
    /// Enough trailing silence observed; finish the utterance.
    StopRecording,
    /// Long idle period; the Silero LSTM state should be zeroed.
    ResetVadModel,
}

/// Counters driving the hysteresis decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadState {
    pub is_recording: bool,
    pub speech_chunks: usize,
    pub silence_chunks: usize,
    pub idle_silence_chunks: usize,
}

/// One pure transition: `(state, probability) -> (state', action)`.
///
/// While idle the start threshold classifies the chunk; while recording the
/// lower end threshold does, so quiet utterance tails keep the recording
/// open. A probability exactly at the active threshold counts as speech.
pub fn step(
    mut state: VadState,
    probability: f32,
    config: &VadDetectionConfig,
) -> (VadState, VadAction) {
    let threshold = if state.is_recording {
        config.end_threshold
    } else {
        config.start_threshold
    };

    if probability >= threshold {
        state.silence_chunks = 0;
        state.idle_silence_chunks = 0;
        state.speech_chunks += 1;

        if !state.is_recording && state.speech_chunks >= config.min_speech_chunks {
            state.is_recording = true;
            return (state, VadAction::StartRecording);
        }
        return (state, VadAction::None);
    }

    state.speech_chunks = 0;

    if state.is_recording {
        state.silence_chunks += 1;
        if state.silence_chunks >= config.max_silence_chunks {
            state.is_recording = false;
            state.silence_chunks = 0;
            return (state, VadAction::StopRecording);
        }
    } else {
        state.idle_silence_chunks += 1;
        if state.idle_silence_chunks >= config.idle_reset_chunks {
            state.idle_silence_chunks = 0;
            return (state, VadAction::ResetVadModel);
        }
    }

    (state, VadAction::None)
}

/// Hysteresis state machine deciding utterance boundaries.
#[derive(Debug)]
pub struct VadStateMachine {
    config: VadDetectionConfig,
    state: VadState,
}

impl VadStateMachine {
    pub fn new(config: VadDetectionConfig) -> Self {
        Self {
            config,
            state: VadState::default(),
        }
    }

    /// Feed one probability sample and return the resulting action.
    pub fn process(&mut self, probability: f32) -> VadAction {
        let (state, action) = step(self.state, probability, &self.config);
        self.state = state;
        action
    }

    pub fn is_recording(&self) -> bool {
        self.state.is_recording
    }

    pub fn speech_chunks(&self) -> usize {
        self.state.speech_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> VadStateMachine {
        VadStateMachine::new(VadDetectionConfig::default())
    }

    #[test]
    fn initial_state_is_idle() {
        let m = machine();
        assert!(!m.is_recording());
        assert_eq!(m.state, VadState::default());
    }

    #[test]
    fn starts_on_third_speech_chunk() {
        let mut m = machine();
        assert_eq!(m.process(0.6), VadAction::None);
        assert_eq!(m.process(0.6), VadAction::None);
        assert_eq!(m.process(0.6), VadAction::StartRecording);
        assert!(m.is_recording());
    }

    #[test]
    fn stops_on_25th_silence_chunk() {
        let mut m = machine();
        for _ in 0..3 {
            m.process(0.6);
        }
        for _ in 0..24 {
            assert_eq!(m.process(0.1), VadAction::None);
        }
        assert_eq!(m.process(0.1), VadAction::StopRecording);
        assert!(!m.is_recording());
    }

    #[test]
    fn idle_reset_after_1000_silent_chunks() {
        let mut m = machine();
        let mut last = VadAction::None;
        for _ in 0..1000 {
            last = m.process(0.1);
        }
        assert_eq!(last, VadAction::ResetVadModel);
        assert!(!m.is_recording());
    }

    #[test]
    fn threshold_boundaries_count_as_speech() {
        let config = VadDetectionConfig::default();

        // Exactly at the start threshold while idle.
        let (state, _) = step(VadState::default(), config.start_threshold, &config);
        assert_eq!(state.speech_chunks, 1);

        // Exactly at the end threshold while recording.
        let recording = VadState {
            is_recording: true,
            ..VadState::default()
        };
        let (state, _) = step(recording, config.end_threshold, &config);
        assert_eq!(state.silence_chunks, 0);
        assert_eq!(state.speech_chunks, 1);
    }

    #[test]
    fn between_thresholds_is_silence_only_when_idle() {
        let config = VadDetectionConfig::default();
        let p = (config.end_threshold + config.start_threshold) / 2.0;

        let (idle, _) = step(VadState::default(), p, &config);
        assert_eq!(idle.speech_chunks, 0);
        assert_eq!(idle.idle_silence_chunks, 1);

        let recording = VadState {
            is_recording: true,
            ..VadState::default()
        };
        let (state, _) = step(recording, p, &config);
        assert_eq!(state.speech_chunks, 1);
    }

    #[test]
    fn speech_resets_idle_counter() {
        let mut m = machine();
        for _ in 0..999 {
            m.process(0.1);
        }
        m.process(0.6);
        // The idle counter restarted, so 999 more silent chunks stay quiet.
        for _ in 0..999 {
            assert_eq!(m.process(0.1), VadAction::None);
        }
        assert_eq!(m.process(0.1), VadAction::ResetVadModel);
    }

    #[test]
    fn every_start_is_closed_before_the_next() {
        // Alternating bursts of speech and silence: starts and stops must
        // strictly alternate no matter the pattern.
        let mut m = machine();
        let mut expecting_stop = false;
        for burst in 0..20 {
            let (p, n) = if burst % 2 == 0 { (0.9, 10) } else { (0.05, 40) };
            for _ in 0..n {
                match m.process(p) {
                    VadAction::StartRecording => {
                        assert!(!expecting_stop, "start before previous stop");
                        expecting_stop = true;
                    }
                    VadAction::StopRecording => {
                        assert!(expecting_stop, "stop without a start");
                        expecting_stop = false;
                    }
                    _ => {}
                }
            }
        }
    }
}
