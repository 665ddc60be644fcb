//! Terminal status line and message rendering.
//!
//! A single indicatif spinner carries the live pipeline status (VAD
//! probability, recording state, worker gauges) while posted messages and
//! accepted segments print above it without tearing the line.

use crate::asr::TranscriberClient;
use crate::audio::StreamHandle;
use crate::config::AppConfig;
use crate::events::{EventBus, MessageLevel};
use crate::summary::SummarizerClient;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live terminal view of the running pipeline.
pub struct StatusUi {
    pb: ProgressBar,
}

fn level_tag(level: MessageLevel) -> &'static str {
    match level {
        MessageLevel::Info => "[info]",
        MessageLevel::Success => "[ok]",
        MessageLevel::Warning => "[warn]",
        MessageLevel::Error => "[error]",
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}…")
    }
}

impl StatusUi {
    /// Create the status line and hook message/segment printing onto the
    /// bus. Printing happens synchronously on the publisher's task.
    pub fn new(bus: &Arc<EventBus>, app_config: &AppConfig) -> Arc<Self> {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            pb.set_style(style);
        }

        let ui = Arc::new(Self { pb });

        {
            let ui = Arc::clone(&ui);
            bus.message_posted.subscribe(move |e| {
                ui.pb
                    .println(format!("{} {}", level_tag(e.level), e.message.trim_end()));
            });
        }
        {
            let ui = Arc::clone(&ui);
            let max = app_config.ui_text_truncate;
            bus.segment_transcribed.subscribe(move |e| {
                ui.pb.println(format!(
                    "[{}] {}",
                    e.segment.start_time.format("%H:%M:%S"),
                    truncate_chars(&e.segment.text, max)
                ));
            });
        }
        {
            let ui = Arc::clone(&ui);
            bus.summary_generated.subscribe(move |e| {
                let label = if e.is_final {
                    "Final summary"
                } else {
                    "Summary updated"
                };
                ui.pb.println(format!("--- {label} ---\n{}\n", e.summary));
            });
        }

        ui
    }

    /// Periodically refresh the status line from the pipeline gauges.
    pub fn spawn_refresh(
        self: Arc<Self>,
        stream: StreamHandle,
        transcriber: TranscriberClient,
        summarizer: Option<SummarizerClient>,
        interval_sec: f64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ui = self;
        tokio::spawn(async move {
            let interval = Duration::from_secs_f64(interval_sec);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let status = stream.status();
                let mut line = if status.is_recording {
                    format!(
                        "REC {:>5.1}s  p={:.2}  chunks={}",
                        status.elapsed_seconds, status.probability, status.speech_chunks
                    )
                } else {
                    format!("listening  p={:.2}", status.probability)
                };
                if stream.is_paused() {
                    line = "paused".to_owned();
                }
                if transcriber.is_transcribing() {
                    let depth = transcriber.queue_depth();
                    if depth > 0 {
                        line.push_str(&format!("  | transcribing ({depth} queued)"));
                    } else {
                        line.push_str("  | transcribing");
                    }
                }
                if let Some(ref s) = summarizer {
                    if s.is_summarizing() {
                        line.push_str("  | summarizing");
                    } else {
                        let chars = s.buffer_char_count();
                        if chars > 0 {
                            line.push_str(&format!("  | buffer {chars} chars"));
                        }
                    }
                }

                ui.pb.set_message(line);
                ui.pb.tick();
            }
            ui.pb.finish_and_clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("こんにちは", 10), "こんにちは");
        assert_eq!(truncate_chars("こんにちは世界のみなさん", 5), "こんにちは…");
    }
}
