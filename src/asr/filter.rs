//! Hallucination detection for Japanese speech transcription.
//!
//! Whisper produces textually plausible output on silence and degenerate
//! audio: repeated prompts, video-transcript boilerplate, pathological
//! repetitions, and lone greetings. Eight detectors run in order; the first
//! hit wins and its reason string drives the retry strategy.

use crate::asr::AsrSegmentInfo;
use crate::config::HallucinationConfig;

/// Characters treated as Japanese punctuation when tokenizing and
/// normalizing (fullwidth and ASCII variants).
fn is_punctuation(c: char) -> bool {
    matches!(c, '。' | '、' | '！' | '？' | '!' | '?') || c.is_whitespace()
}

/// Classifies candidate transcriptions as clean or hallucinated.
pub struct HallucinationFilter {
    config: HallucinationConfig,
}

impl HallucinationFilter {
    pub fn new(config: HallucinationConfig) -> Self {
        Self { config }
    }

    /// Evaluate a transcription. Returns `None` when the text is acceptable
    /// (including empty text, which the caller handles as silence), or the
    /// rejection reason.
    pub fn evaluate(
        &self,
        text: &str,
        avg_logprob: Option<f32>,
        audio_duration: Option<f64>,
    ) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }

        self.check_banned_phrases(text)
            .or_else(|| self.check_character_repetition(text))
            .or_else(|| self.check_short_pattern_repetition(text))
            .or_else(|| self.check_long_pattern_repetition(text))
            .or_else(|| self.check_token_repetition(text))
            .or_else(|| self.check_contextless_greeting(text, avg_logprob, audio_duration))
            .or_else(|| self.check_extreme_low_confidence(avg_logprob))
    }

    /// Aggregate engine segment metrics: mean log-probability, and the most
    /// suspicious (maximum) compression ratio and no-speech probability.
    pub fn extract_metrics(
        &self,
        segments: &[AsrSegmentInfo],
    ) -> (Option<f32>, Option<f32>, Option<f32>) {
        let logprobs: Vec<f32> = segments.iter().filter_map(|s| s.avg_logprob).collect();
        let avg_logprob = if logprobs.is_empty() {
            None
        } else {
            Some(logprobs.iter().sum::<f32>() / logprobs.len() as f32)
        };

        let compression_ratio = segments
            .iter()
            .filter_map(|s| s.compression_ratio)
            .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |a| a.max(v))));

        let no_speech_prob = segments
            .iter()
            .filter_map(|s| s.no_speech_prob)
            .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |a| a.max(v))));

        (avg_logprob, compression_ratio, no_speech_prob)
    }

    fn check_banned_phrases(&self, text: &str) -> Option<String> {
        self.config
            .banned_phrases
            .iter()
            .find(|phrase| text.contains(phrase.as_str()))
            .map(|phrase| format!("Banned phrase: '{phrase}'"))
    }

    /// O(n) scan for a run of identical characters.
    fn check_character_repetition(&self, text: &str) -> Option<String> {
        let min = self.config.min_char_repetition;
        let mut chars = text.chars();
        let mut prev = chars.next()?;
        let mut run = 1usize;

        for c in chars {
            if c == prev {
                run += 1;
                if run >= min {
                    return Some(format!("Character repetition: '{prev}' x{run}+"));
                }
            } else {
                run = 1;
                prev = c;
            }
        }
        None
    }

    /// Short phrases (2-10 chars) repeated across the text, e.g.
    /// "ピリピリピリピリピリ". Pattern candidates are taken from the first
    /// few positions of the text.
    fn check_short_pattern_repetition(&self, text: &str) -> Option<String> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        if n < 20 {
            return None;
        }

        let max_len = self.config.short_pattern_max_length.min(n / 3);
        for pattern_len in 2..=max_len {
            let max_start = self
                .config
                .pattern_search_start_positions
                .min(n - pattern_len * 3 + 1);

            for start in 0..max_start {
                let pattern = &chars[start..start + pattern_len];
                if pattern.iter().all(|c| c.is_whitespace()) {
                    continue;
                }

                let count = count_occurrences(&chars, pattern);
                if count >= self.config.min_short_pattern_repetition
                    && covers_ratio(pattern_len, count, n, self.config.repetition_ratio_threshold)
                {
                    return Some(format!(
                        "Pattern repetition: '{}...' x{count}",
                        truncate_chars(pattern, 30)
                    ));
                }
            }
        }
        None
    }

    /// Long phrases (11-50 chars) repeated from the start of the text.
    /// Lengths step by 5 and only the leading position is tried to keep the
    /// scan cheap.
    fn check_long_pattern_repetition(&self, text: &str) -> Option<String> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        if n < 60 {
            return None;
        }

        let max_len = self.config.long_pattern_max_length.min(n / 3);
        let mut pattern_len = self.config.long_pattern_min_length;
        while pattern_len <= max_len {
            let pattern = &chars[0..pattern_len];
            if !pattern.iter().all(|c| c.is_whitespace()) {
                let count = count_occurrences(&chars, pattern);
                if count >= self.config.min_long_pattern_repetition
                    && covers_ratio(pattern_len, count, n, self.config.repetition_ratio_threshold)
                {
                    return Some(format!(
                        "Long phrase repetition: '{}...' x{count}",
                        truncate_chars(pattern, 30)
                    ));
                }
            }
            pattern_len += 5;
        }
        None
    }

    /// The same token repeated at the end of the text, e.g.
    /// "はい。はい。はい。はい。はい。".
    fn check_token_repetition(&self, text: &str) -> Option<String> {
        let min = self.config.min_token_repetition;
        let tokens: Vec<&str> = text
            .split(is_punctuation)
            .filter(|t| !t.trim().is_empty())
            .collect();

        if tokens.len() >= min {
            let last = tokens[tokens.len() - 1];
            if !last.is_empty() && tokens[tokens.len() - min..].iter().all(|t| *t == last) {
                return Some(format!("Token repetition at end: '{last}' x{min}+"));
            }
        }
        None
    }

    /// A greeting standing alone is suspicious when confidence is low or
    /// when it is the only output for a long stretch of audio.
    fn check_contextless_greeting(
        &self,
        text: &str,
        avg_logprob: Option<f32>,
        audio_duration: Option<f64>,
    ) -> Option<String> {
        let normalized: String = text.chars().filter(|c| !is_punctuation(*c)).collect();
        let normalized_len = normalized.chars().count();

        let greeting = self
            .config
            .contextless_greeting_phrases
            .iter()
            .find(|phrase| normalized.contains(phrase.as_str()))?;

        if normalized_len > self.config.short_text_threshold {
            return None;
        }

        if let Some(lp) = avg_logprob {
            if lp < self.config.low_logprob_threshold {
                return Some(format!(
                    "Contextless greeting with low confidence: '{greeting}' (avg_logprob={lp:.2})"
                ));
            }
        }
        if let Some(duration) = audio_duration {
            if duration >= f64::from(self.config.long_audio_threshold) {
                return Some(format!(
                    "Contextless greeting in long audio: '{greeting}' \
                     (audio={duration:.1}s, text={normalized_len} chars)"
                ));
            }
        }
        None
    }

    fn check_extreme_low_confidence(&self, avg_logprob: Option<f32>) -> Option<String> {
        let lp = avg_logprob?;
        if lp < self.config.extreme_low_logprob_threshold {
            return Some(format!("Extreme low confidence (avg_logprob={lp:.2})"));
        }
        None
    }
}

/// Non-overlapping occurrence count, matching on Unicode scalar values.
fn count_occurrences(haystack: &[char], needle: &[char]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

fn covers_ratio(pattern_len: usize, count: usize, text_len: usize, threshold: f32) -> bool {
    (pattern_len * count) as f32 >= text_len as f32 * threshold
}

fn truncate_chars(chars: &[char], max: usize) -> String {
    chars.iter().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HallucinationConfig;

    fn filter() -> HallucinationFilter {
        HallucinationFilter::new(HallucinationConfig::default())
    }

    #[test]
    fn empty_and_whitespace_are_accepted() {
        let f = filter();
        assert_eq!(f.evaluate("", None, None), None);
        assert_eq!(f.evaluate("   ", None, None), None);
    }

    #[test]
    fn detects_banned_phrase() {
        let f = filter();
        let reason = f
            .evaluate("ご視聴ありがとうございました", Some(-0.5), None)
            .unwrap();
        assert!(reason.contains("Banned phrase"));
    }

    #[test]
    fn detects_banned_phrase_in_middle() {
        let f = filter();
        let reason = f
            .evaluate("今日の配信はここまでです。チャンネル登録お願いします", None, None)
            .unwrap();
        assert!(reason.contains("Banned phrase"));
    }

    #[test]
    fn passes_normal_text() {
        let f = filter();
        assert_eq!(f.evaluate("これは普通の文章です", Some(-0.3), None), None);
    }

    #[test]
    fn character_repetition_boundary() {
        let f = filter();
        let reason = f.evaluate(&"あ".repeat(10), None, None).unwrap();
        assert!(reason.contains("Character repetition"));
        assert_eq!(f.evaluate(&"あ".repeat(9), None, None), None);
    }

    #[test]
    fn detects_repeated_katakana() {
        let f = filter();
        let reason = f.evaluate(&"ン".repeat(12), None, None).unwrap();
        assert!(reason.contains("Character repetition"));
    }

    #[test]
    fn detects_short_pattern_repetition() {
        let f = filter();
        let reason = f.evaluate(&"ピリ".repeat(12), None, None).unwrap();
        assert!(reason.contains("Pattern repetition"));
    }

    #[test]
    fn short_text_escapes_pattern_check() {
        let f = filter();
        assert_eq!(f.evaluate("ピリピリ", None, None), None);
    }

    #[test]
    fn detects_long_phrase_repetition() {
        let f = filter();
        let text = "私たちの意味が好きな話題について、".repeat(4);
        let reason = f.evaluate(&text, None, None).unwrap();
        assert!(reason.contains("Long phrase repetition"));
    }

    #[test]
    fn passes_non_repetitive_long_text() {
        let f = filter();
        let text = "今日は天気が良いです。明日は雨が降るかもしれません。週末は晴れるでしょう。";
        assert_eq!(f.evaluate(text, Some(-0.4), None), None);
    }

    #[test]
    fn detects_token_repetition_at_end() {
        let f = filter();
        let reason = f.evaluate("はい。はい。はい。はい。はい。", None, None).unwrap();
        assert!(reason.contains("Token repetition"));
    }

    #[test]
    fn passes_varied_tokens() {
        let f = filter();
        assert_eq!(
            f.evaluate("はい。いいえ。多分。そうですね。分かりました。", None, None),
            None
        );
    }

    #[test]
    fn greeting_with_low_confidence_is_rejected() {
        let f = filter();
        let reason = f.evaluate("おやすみなさい", Some(-0.9), Some(2.0)).unwrap();
        assert!(reason.contains("Contextless greeting with low confidence"));
    }

    #[test]
    fn greeting_with_normal_confidence_passes() {
        let f = filter();
        assert_eq!(f.evaluate("おやすみなさい", Some(-0.3), Some(2.0)), None);
    }

    #[test]
    fn greeting_in_long_audio_is_rejected() {
        let f = filter();
        let reason = f.evaluate("こんにちは。", Some(-0.3), Some(8.0)).unwrap();
        assert!(reason.contains("Contextless greeting in long audio"));
    }

    #[test]
    fn greeting_inside_long_text_passes() {
        let f = filter();
        let text = "おはようございます。今日の議題は予算計画と採用方針についてです";
        assert_eq!(f.evaluate(text, Some(-0.3), Some(8.0)), None);
    }

    #[test]
    fn extreme_low_confidence_is_rejected() {
        let f = filter();
        let reason = f.evaluate("テスト", Some(-2.0), None).unwrap();
        assert!(reason.contains("Extreme low confidence"));
        assert_eq!(f.evaluate("テスト", Some(-0.5), None), None);
        assert_eq!(f.evaluate("テスト", None, None), None);
    }

    #[test]
    fn extract_metrics_aggregates() {
        let f = filter();
        let segments = vec![
            AsrSegmentInfo {
                avg_logprob: Some(-0.5),
                compression_ratio: Some(1.2),
                no_speech_prob: Some(0.1),
            },
            AsrSegmentInfo {
                avg_logprob: Some(-0.7),
                compression_ratio: Some(1.5),
                no_speech_prob: Some(0.2),
            },
        ];
        let (lp, cr, ns) = f.extract_metrics(&segments);
        assert!((lp.unwrap() + 0.6).abs() < 1e-6);
        assert_eq!(cr, Some(1.5));
        assert_eq!(ns, Some(0.2));
    }

    #[test]
    fn extract_metrics_handles_missing_fields() {
        let f = filter();
        assert_eq!(f.extract_metrics(&[]), (None, None, None));

        let segments = vec![
            AsrSegmentInfo {
                avg_logprob: Some(-0.5),
                ..AsrSegmentInfo::default()
            },
            AsrSegmentInfo {
                compression_ratio: Some(1.5),
                ..AsrSegmentInfo::default()
            },
        ];
        let (lp, cr, ns) = f.extract_metrics(&segments);
        assert_eq!(lp, Some(-0.5));
        assert_eq!(cr, Some(1.5));
        assert_eq!(ns, None);
    }
}
