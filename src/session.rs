//! Session aggregate: transcribed segments, errors, summaries, and JSON
//! persistence.

use crate::error::Result;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A transcribed utterance.
#[derive(Debug, Clone)]
pub struct TranscriptionSegment {
    /// Transcribed text, stripped and non-empty.
    pub text: String,
    /// Wall-clock time recording started.
    pub start_time: DateTime<Local>,
    /// Wall-clock time recording ended.
    pub end_time: DateTime<Local>,
    /// Utterance length in seconds.
    pub audio_duration: f64,
    /// Transcription wall time in seconds, including retries.
    pub processing_time: f64,
    /// Mean token log-probability across engine segments.
    pub avg_logprob: Option<f32>,
    /// Maximum compression ratio across engine segments.
    pub compression_ratio: Option<f32>,
    /// Maximum no-speech probability across engine segments.
    pub no_speech_prob: Option<f32>,
}

/// A recorded quality problem or API failure.
#[derive(Debug, Clone)]
pub struct TranscriptionError {
    /// When the problem occurred.
    pub timestamp: DateTime<Local>,
    /// Human-readable description.
    pub message: String,
}

/// One generated summary, incremental or final.
#[derive(Debug, Clone)]
pub struct SummaryEntry {
    /// When the summary was generated.
    pub timestamp: DateTime<Local>,
    /// Markdown content.
    pub content: String,
}

/// Append-only record of one capture session.
///
/// Mutated only through the event-bus handlers; callers hold it behind
/// [`SharedSession`] so concurrent publishers serialize on one lock.
#[derive(Debug)]
pub struct Session {
    segments: Vec<TranscriptionSegment>,
    errors: Vec<TranscriptionError>,
    summaries: Vec<SummaryEntry>,
    final_summary: Option<SummaryEntry>,
    session_start: DateTime<Local>,
}

/// Session behind the single mutex that serializes event-bus mutation.
pub type SharedSession = Arc<Mutex<Session>>;

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            errors: Vec::new(),
            summaries: Vec::new(),
            final_summary: None,
            session_start: Local::now(),
        }
    }

    pub fn add_segment(&mut self, segment: TranscriptionSegment) {
        self.segments.push(segment);
    }

    pub fn add_error(&mut self, error: TranscriptionError) {
        self.errors.push(error);
    }

    /// Record a summary. A final summary replaces any previous final
    /// summary; incremental summaries append.
    pub fn add_summary(&mut self, content: String, is_final: bool) {
        let entry = SummaryEntry {
            timestamp: Local::now(),
            content,
        };
        if is_final {
            self.final_summary = Some(entry);
        } else {
            self.summaries.push(entry);
        }
    }

    pub fn segments(&self) -> &[TranscriptionSegment] {
        &self.segments
    }

    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn total_errors(&self) -> usize {
        self.errors.len()
    }

    pub fn session_start(&self) -> DateTime<Local> {
        self.session_start
    }

    /// Clone the segment list for use outside the lock (final summary
    /// prompt construction).
    pub fn snapshot_segments(&self) -> Vec<TranscriptionSegment> {
        self.segments.clone()
    }

    /// Serialize the session to the persisted JSON shape.
    ///
    /// Durations are rounded to 2 decimals and engine metrics to 3; metric
    /// keys are omitted when the engine did not supply them.
    pub fn export(&self, session_end: DateTime<Local>) -> serde_json::Value {
        let segments: Vec<serde_json::Value> = self
            .segments
            .iter()
            .map(|seg| {
                let mut map = serde_json::Map::new();
                map.insert("text".to_owned(), seg.text.clone().into());
                map.insert("start_time".to_owned(), seg.start_time.to_rfc3339().into());
                map.insert("end_time".to_owned(), seg.end_time.to_rfc3339().into());
                map.insert("audio_duration".to_owned(), round2(seg.audio_duration).into());
                map.insert("processing_time".to_owned(), round2(seg.processing_time).into());
                if let Some(p) = seg.avg_logprob {
                    map.insert("avg_logprob".to_owned(), round3(f64::from(p)).into());
                }
                if let Some(r) = seg.compression_ratio {
                    map.insert("compression_ratio".to_owned(), round3(f64::from(r)).into());
                }
                if let Some(p) = seg.no_speech_prob {
                    map.insert("no_speech_prob".to_owned(), round3(f64::from(p)).into());
                }
                serde_json::Value::Object(map)
            })
            .collect();

        let errors: Vec<serde_json::Value> = self
            .errors
            .iter()
            .map(|err| {
                serde_json::json!({
                    "timestamp": err.timestamp.to_rfc3339(),
                    "message": err.message,
                })
            })
            .collect();

        let summaries: Vec<serde_json::Value> = self
            .summaries
            .iter()
            .map(|s| {
                serde_json::json!({
                    "timestamp": s.timestamp.to_rfc3339(),
                    "content": s.content,
                })
            })
            .collect();

        let mut map = serde_json::Map::new();
        map.insert("session_start".to_owned(), self.session_start.to_rfc3339().into());
        map.insert("session_end".to_owned(), session_end.to_rfc3339().into());
        map.insert("total_segments".to_owned(), self.total_segments().into());
        map.insert("total_errors".to_owned(), self.total_errors().into());
        map.insert("segments".to_owned(), segments.into());
        map.insert("errors".to_owned(), errors.into());
        map.insert("summaries".to_owned(), summaries.into());
        if let Some(ref final_summary) = self.final_summary {
            map.insert(
                "final_summary".to_owned(),
                serde_json::json!({
                    "timestamp": final_summary.timestamp.to_rfc3339(),
                    "content": final_summary.content,
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Write the session JSON to `output_path`, or to
    /// `transcription_YYYYMMDD_HHMMSS.json` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, output_path: Option<&Path>) -> Result<PathBuf> {
        let path = match output_path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(format!(
                "transcription_{}.json",
                self.session_start.format("%Y%m%d_%H%M%S")
            )),
        };
        let json = serde_json::to_string_pretty(&self.export(Local::now()))
            .map_err(|e| crate::error::ScribeError::Session(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str) -> TranscriptionSegment {
        let now = Local::now();
        TranscriptionSegment {
            text: text.to_owned(),
            start_time: now,
            end_time: now,
            audio_duration: 1.23456,
            processing_time: 0.98765,
            avg_logprob: Some(-0.56789),
            compression_ratio: None,
            no_speech_prob: Some(0.01234),
        }
    }

    #[test]
    fn export_shape_and_rounding() {
        let mut session = Session::new();
        session.add_segment(segment("こんにちは、テストです"));
        session.add_error(TranscriptionError {
            timestamp: Local::now(),
            message: "Transcription failed".to_owned(),
        });
        session.add_summary("## 要約".to_owned(), false);
        session.add_summary("## 最終".to_owned(), true);

        let value = session.export(Local::now());
        assert_eq!(value["total_segments"], 1);
        assert_eq!(value["total_errors"], 1);

        let seg = &value["segments"][0];
        assert_eq!(seg["text"], "こんにちは、テストです");
        assert_eq!(seg["audio_duration"], 1.23);
        assert_eq!(seg["processing_time"], 0.99);
        assert_eq!(seg["avg_logprob"], -0.568);
        assert_eq!(seg["no_speech_prob"], 0.012);
        assert!(seg.get("compression_ratio").is_none());

        assert_eq!(value["summaries"][0]["content"], "## 要約");
        assert_eq!(value["final_summary"]["content"], "## 最終");
    }

    #[test]
    fn final_summary_replaces_previous_final() {
        let mut session = Session::new();
        session.add_summary("first".to_owned(), true);
        session.add_summary("second".to_owned(), true);
        let value = session.export(Local::now());
        assert_eq!(value["final_summary"]["content"], "second");
        assert_eq!(value["summaries"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn export_omits_final_summary_when_absent() {
        let session = Session::new();
        let value = session.export(Local::now());
        assert!(value.get("final_summary").is_none());
    }

    #[test]
    fn non_ascii_survives_serialization() {
        let mut session = Session::new();
        session.add_segment(segment("日本語のテキスト"));
        let json = serde_json::to_string(&session.export(Local::now())).unwrap();
        assert!(json.contains("日本語のテキスト"));
    }
}
