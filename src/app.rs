//! Application wiring: component construction, event subscriptions, and
//! the session lifecycle.

use crate::asr::{AsrEngine, TranscriberClient, TranscriberHandle, TranscriptionWorker};
use crate::audio::{AudioChunk, AudioSource, AudioStreamProcessor, StreamHandle};
use crate::config::ScribeConfig;
use crate::error::Result;
use crate::events::{EventBus, MessageLevel};
use crate::session::{Session, SharedSession, TranscriptionError};
use crate::summary::{LlmClient, Summarizer, SummarizerClient, SummarizerHandle};
use crate::vad::VadModel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the chunk channel between the source and the stream
/// processor. The utterance queue behind it is unbounded; this only
/// cushions callback-thread bursts.
const AUDIO_CHANNEL_SIZE: usize = 64;

/// A running capture session.
pub struct App {
    config: ScribeConfig,
    bus: Arc<EventBus>,
    session: SharedSession,
    stream_handle: StreamHandle,
    source_task: JoinHandle<()>,
    processor_task: JoinHandle<()>,
    transcriber: TranscriberHandle,
    transcriber_client: TranscriberClient,
    summarizer: Option<SummarizerHandle>,
    cancel: CancellationToken,
}

impl App {
    /// Wire everything together and start the workers.
    ///
    /// The external collaborators (audio source, VAD model, ASR engine, LLM
    /// client) are injected; `llm` of `None` disables summarization.
    pub fn start(
        config: ScribeConfig,
        mut source: Box<dyn AudioSource>,
        vad: Box<dyn VadModel>,
        engine: Box<dyn AsrEngine>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> App {
        let bus = EventBus::new();
        let session: SharedSession = Arc::new(Mutex::new(Session::new()));
        let cancel = CancellationToken::new();

        let transcriber = TranscriptionWorker::spawn(&config, engine, Arc::clone(&bus));
        let transcriber_client = transcriber.client();

        let summarizer =
            llm.map(|llm| Summarizer::spawn(config.summary.clone(), llm, Arc::clone(&bus)));

        Self::subscribe_session_handlers(
            &bus,
            &session,
            &transcriber_client,
            summarizer.as_ref().map(SummarizerHandle::client),
        );

        let (processor, stream_handle) =
            AudioStreamProcessor::new(&config, vad, Arc::clone(&bus));

        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(AUDIO_CHANNEL_SIZE);
        let source_task = {
            let cancel = cancel.clone();
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                if let Err(e) = source.run(chunk_tx, cancel.clone()).await {
                    // A dead source cannot feed the pipeline; treat as fatal
                    // and let the main loop fall into fast shutdown.
                    error!("audio source failed: {e}");
                    bus.post_message(MessageLevel::Error, format!("Audio source failed: {e}"));
                    cancel.cancel();
                }
            })
        };
        let processor_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor.run(chunk_rx, cancel).await;
            })
        };

        App {
            config,
            bus,
            session,
            stream_handle,
            source_task,
            processor_task,
            transcriber,
            transcriber_client,
            summarizer,
            cancel,
        }
    }

    /// Register the four session handlers. Dispatch is synchronous, so the
    /// single session mutex serializes concurrent publishers.
    fn subscribe_session_handlers(
        bus: &Arc<EventBus>,
        session: &SharedSession,
        transcriber: &TranscriberClient,
        summarizer: Option<SummarizerClient>,
    ) {
        {
            let transcriber = transcriber.clone();
            bus.audio_recorded.subscribe(move |e| {
                transcriber.enqueue(e.samples.clone(), e.start_time, e.end_time);
            });
        }
        {
            let session = Arc::clone(session);
            bus.segment_transcribed.subscribe(move |e| {
                session
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .add_segment(e.segment.clone());
                if let Some(ref summarizer) = summarizer {
                    summarizer.add_segment(e.segment.clone());
                }
            });
        }
        {
            let session = Arc::clone(session);
            bus.summary_generated.subscribe(move |e| {
                session
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .add_summary(e.summary.clone(), e.is_final);
            });
        }
        {
            let session = Arc::clone(session);
            bus.message_posted.subscribe(move |e| {
                if e.level == MessageLevel::Error {
                    session
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .add_error(TranscriptionError {
                            timestamp: e.timestamp,
                            message: e.message.clone(),
                        });
                }
            });
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    pub fn stream_handle(&self) -> StreamHandle {
        self.stream_handle.clone()
    }

    pub fn transcriber_client(&self) -> TranscriberClient {
        self.transcriber_client.clone()
    }

    pub fn summarizer_client(&self) -> Option<SummarizerClient> {
        self.summarizer.as_ref().map(SummarizerHandle::client)
    }

    /// Fires when the pipeline has failed internally (e.g. the audio source
    /// died) and the application should stop.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause(&self) {
        self.stream_handle.pause();
    }

    pub fn resume(&self) {
        self.stream_handle.resume();
    }

    /// Wait until a finite source is fully consumed and every queued
    /// utterance has been transcribed. Used for file runs, which complete
    /// on their own rather than on user input.
    pub async fn wait_until_drained(&mut self) {
        let poll = Duration::from_secs_f64(
            self.config.app.transcription_progress_poll_interval_sec,
        );
        while !self.source_task.is_finished() || !self.processor_task.is_finished() {
            tokio::time::sleep(poll).await;
        }
        while self.transcriber_client.is_transcribing() {
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop everything.
    ///
    /// Graceful: finalize any in-progress utterance, drain the ASR queue
    /// (bounded by `whisper.shutdown_timeout_sec`, with progress messages),
    /// generate the final summary, persist the session. Fast: cancel all
    /// workers with one-second joins and skip persistence.
    pub async fn shutdown(self, graceful: bool) -> Result<()> {
        info!("shutting down ({})", if graceful { "graceful" } else { "fast" });
        let App {
            config,
            bus,
            session,
            source_task,
            processor_task,
            transcriber,
            summarizer,
            cancel,
            ..
        } = self;

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), source_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), processor_task).await;

        if !graceful {
            transcriber.shutdown(false, Duration::ZERO).await;
            if let Some(summarizer) = summarizer {
                summarizer.shutdown(None).await;
            }
            return Ok(());
        }

        // Drain the transcription queue, reporting progress, bounded by the
        // configured deadline.
        let drain_deadline =
            Instant::now() + Duration::from_secs_f64(config.whisper.shutdown_timeout_sec);
        if transcriber.is_transcribing() {
            bus.post_message(MessageLevel::Info, "Processing remaining audio...");
            let poll =
                Duration::from_secs_f64(config.app.transcription_progress_poll_interval_sec);
            let mut last_remaining = usize::MAX;
            while transcriber.is_transcribing() && Instant::now() < drain_deadline {
                let remaining = transcriber.queue_depth();
                if remaining > 0 && remaining != last_remaining {
                    bus.post_message(
                        MessageLevel::Warning,
                        format!("  Transcribing... ({remaining} segments remaining)"),
                    );
                    last_remaining = remaining;
                }
                tokio::time::sleep(poll).await;
            }
        }
        let remaining_budget = drain_deadline.saturating_duration_since(Instant::now());
        transcriber
            .shutdown(true, remaining_budget.max(Duration::from_millis(100)))
            .await;

        if let Some(summarizer) = summarizer {
            bus.post_message(MessageLevel::Info, "Generating final summary...");
            let segments = session
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .snapshot_segments();
            summarizer.shutdown(Some(segments)).await;
        }

        save_session(&config, &bus, &session);
        Ok(())
    }
}

/// Persist the session JSON when enabled and non-empty.
fn save_session(config: &ScribeConfig, bus: &Arc<EventBus>, session: &SharedSession) {
    let session = session.lock().unwrap_or_else(|p| p.into_inner());
    if !config.app.save_json || session.total_segments() == 0 {
        return;
    }
    match session.save_to_file(None) {
        Ok(path) => {
            bus.post_message(
                MessageLevel::Success,
                format!("Transcription saved to: {}", path.display()),
            );
        }
        Err(e) => {
            warn!("failed to save session: {e}");
            bus.post_message(MessageLevel::Error, format!("Failed to save session: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::{AsrEngine, AsrOutput, AsrSegmentInfo};
    use crate::config::WhisperParams;
    use crate::error::Result;
    use crate::summary::GenerationOptions;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    /// Source that plays a fixed probability script, one chunk per value.
    struct ScriptSource {
        script: Vec<f32>,
    }

    #[async_trait]
    impl AudioSource for ScriptSource {
        fn is_realtime(&self) -> bool {
            false
        }

        async fn run(
            &mut self,
            tx: mpsc::Sender<AudioChunk>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            for &p in &self.script {
                let chunk = AudioChunk {
                    samples: vec![p; 512],
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    /// VAD that echoes the first sample back as the probability.
    struct EchoVad;

    impl VadModel for EchoVad {
        fn probability(&mut self, chunk: &[f32]) -> Result<f32> {
            Ok(chunk.first().copied().unwrap_or(0.0))
        }

        fn reset_states(&mut self) {}
    }

    /// Engine that transcribes every non-silent utterance the same way.
    struct FixedEngine;

    impl AsrEngine for FixedEngine {
        fn transcribe(&mut self, samples: &[f32], _params: &WhisperParams) -> Result<AsrOutput> {
            if samples.iter().all(|&s| s == 0.0) {
                return Ok(AsrOutput::default());
            }
            Ok(AsrOutput {
                text: "発言がありました".to_owned(),
                segments: vec![AsrSegmentInfo {
                    avg_logprob: Some(-0.2),
                    compression_ratio: Some(1.1),
                    no_speech_prob: Some(0.05),
                }],
            })
        }
    }

    struct NullLlm;

    #[async_trait]
    impl crate::summary::LlmClient for NullLlm {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _options: &GenerationOptions,
        ) -> Result<Option<String>> {
            Ok(Some("## まとめ".to_owned()))
        }

        fn backend_info(&self) -> String {
            "null".to_owned()
        }
    }

    fn test_config() -> ScribeConfig {
        let mut config = ScribeConfig::default();
        config.app.save_json = false;
        config.app.transcription_progress_poll_interval_sec = 0.02;
        config.summary.queue_get_timeout_sec = 0.02;
        config.summary.shutdown_timeout_sec = 1.0;
        config.whisper.shutdown_timeout_sec = 5.0;
        config
    }

    #[tokio::test]
    async fn end_to_end_utterance_reaches_session() {
        // 5 speech chunks, 25 silence chunks: one utterance.
        let mut script = vec![0.9_f32; 5];
        script.extend(std::iter::repeat(0.1).take(25));

        let mut app = App::start(
            test_config(),
            Box::new(ScriptSource { script }),
            Box::new(EchoVad),
            Box::new(FixedEngine),
            None,
        );

        app.wait_until_drained().await;
        let session = app.session();
        app.shutdown(true).await.unwrap();

        let session = session.lock().unwrap();
        assert_eq!(session.total_segments(), 1);
        assert_eq!(session.segments()[0].text, "発言がありました");
        assert_eq!(session.total_errors(), 0);
    }

    #[tokio::test]
    async fn final_summary_lands_in_session() {
        let mut script = vec![0.9_f32; 5];
        script.extend(std::iter::repeat(0.1).take(25));

        let mut app = App::start(
            test_config(),
            Box::new(ScriptSource { script }),
            Box::new(EchoVad),
            Box::new(FixedEngine),
            Some(Arc::new(NullLlm) as Arc<dyn crate::summary::LlmClient>),
        );

        app.wait_until_drained().await;
        let session = app.session();
        app.shutdown(true).await.unwrap();

        let session = session.lock().unwrap();
        assert_eq!(session.total_segments(), 1);
        let exported = session.export(chrono::Local::now());
        assert_eq!(exported["final_summary"]["content"], "## まとめ");
    }

    #[tokio::test]
    async fn fast_shutdown_skips_drain_and_summary() {
        let mut script = vec![0.9_f32; 5];
        script.extend(std::iter::repeat(0.1).take(25));

        let app = App::start(
            test_config(),
            Box::new(ScriptSource { script }),
            Box::new(EchoVad),
            Box::new(FixedEngine),
            Some(Arc::new(NullLlm) as Arc<dyn crate::summary::LlmClient>),
        );
        let session = app.session();
        app.shutdown(false).await.unwrap();

        // No final summary in fast mode.
        let session = session.lock().unwrap();
        assert!(session
            .export(chrono::Local::now())
            .get("final_summary")
            .is_none());
    }
}
