//! Retry strategy for quality-gated transcription.
//!
//! Walks the configured parameter phases from standard decoding toward the
//! strictest gates: standard, anti-loop, bias removal, strict, final gate.
//! One instance lives for exactly one utterance.

use crate::config::WhisperParams;

/// Outcome of evaluating one transcription attempt.
#[derive(Debug, Clone)]
pub enum StrategyDecision {
    /// The result is clean; keep it.
    Accept,
    /// Try again with the next (stricter) parameter phase.
    Retry {
        /// Parameters for the next attempt.
        params: WhisperParams,
        /// The filter reason that triggered the retry.
        reason: String,
    },
    /// Give up on this utterance.
    Discard {
        /// Why the utterance was dropped.
        reason: String,
    },
}

/// Per-utterance retry state over the configured phase table.
pub struct RetryStrategy {
    params: Vec<WhisperParams>,
    attempt: usize,
}

impl RetryStrategy {
    pub fn new(params: Vec<WhisperParams>) -> Self {
        debug_assert!(!params.is_empty());
        Self { params, attempt: 0 }
    }

    /// Parameters for the current attempt.
    pub fn current_params(&self) -> &WhisperParams {
        &self.params[self.attempt.min(self.params.len() - 1)]
    }

    /// `(current attempt 1-based, max attempts)`.
    pub fn attempt_info(&self) -> (usize, usize) {
        (self.attempt + 1, self.params.len())
    }

    /// Decide what to do with an attempt's text and filter verdict.
    pub fn evaluate(&mut self, text: &str, filter_reason: Option<&str>) -> StrategyDecision {
        match filter_reason {
            None if !text.is_empty() => StrategyDecision::Accept,
            None => StrategyDecision::Discard {
                reason: "Empty transcription (likely silence)".to_owned(),
            },
            Some(reason) => {
                if self.attempt < self.params.len() - 1 {
                    self.attempt += 1;
                    StrategyDecision::Retry {
                        params: self.current_params().clone(),
                        reason: reason.to_owned(),
                    }
                } else {
                    StrategyDecision::Discard {
                        reason: format!("Max retries reached. Last error: {reason}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WhisperConfig;

    fn strategy() -> RetryStrategy {
        RetryStrategy::new(WhisperConfig::default().params)
    }

    #[test]
    fn clean_text_is_accepted_immediately() {
        let mut s = strategy();
        assert!(matches!(
            s.evaluate("こんにちは、テストです", None),
            StrategyDecision::Accept
        ));
        assert_eq!(s.attempt_info(), (1, 5));
    }

    #[test]
    fn silence_is_discarded_without_retry() {
        let mut s = strategy();
        match s.evaluate("", None) {
            StrategyDecision::Discard { reason } => {
                assert!(reason.contains("likely silence"));
            }
            other => panic!("expected Discard, got {other:?}"),
        }
        assert_eq!(s.attempt_info(), (1, 5));
    }

    #[test]
    fn retry_ladder_walks_the_phase_table() {
        let table = WhisperConfig::default().params;
        let mut s = RetryStrategy::new(table.clone());

        for expected in &table[1..] {
            match s.evaluate("", Some("some reason")) {
                StrategyDecision::Retry { params, reason } => {
                    assert_eq!(
                        params.compression_ratio_threshold,
                        expected.compression_ratio_threshold
                    );
                    assert_eq!(params.logprob_threshold, expected.logprob_threshold);
                    assert_eq!(reason, "some reason");
                }
                other => panic!("expected Retry, got {other:?}"),
            }
        }

        // Fifth evaluation with the same input exhausts the ladder.
        match s.evaluate("", Some("some reason")) {
            StrategyDecision::Discard { reason } => {
                assert!(reason.contains("Max retries reached"));
                assert!(reason.contains("some reason"));
            }
            other => panic!("expected Discard, got {other:?}"),
        }
    }

    #[test]
    fn accept_after_retries_keeps_attempt_count() {
        let mut s = strategy();
        let _ = s.evaluate("テスト", Some("Banned phrase: 'x'"));
        let _ = s.evaluate("テスト", Some("Banned phrase: 'x'"));
        assert!(matches!(
            s.evaluate("きれいなテキスト", None),
            StrategyDecision::Accept
        ));
        assert_eq!(s.attempt_info(), (3, 5));
    }
}
