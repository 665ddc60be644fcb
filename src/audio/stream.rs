//! VAD-driven audio stream processing.
//!
//! Consumes fixed-size chunks from an [`AudioSource`](super::AudioSource),
//! runs each through the speech-probability model and the hysteresis state
//! machine, maintains the pre-roll ring and recording buffers, and publishes
//! an `AudioRecordedEvent` for every completed utterance.

use crate::audio::AudioChunk;
use crate::config::ScribeConfig;
use crate::error::Result;
use crate::events::{AudioRecordedEvent, EventBus};
use crate::vad::{VadAction, VadModel, VadStateMachine};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live view of the audio stage for the UI.
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    /// Latest speech probability.
    pub probability: f32,
    /// Whether an utterance is currently being recorded.
    pub is_recording: bool,
    /// Seconds since the current recording started.
    pub elapsed_seconds: f64,
    /// Consecutive speech chunks observed.
    pub speech_chunks: usize,
}

/// Control/observation handle shared with the application and UI.
#[derive(Clone)]
pub struct StreamHandle {
    paused: Arc<AtomicBool>,
    status: watch::Receiver<StreamStatus>,
}

impl StreamHandle {
    /// Halt event production without tearing the source down.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume event production.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Latest status snapshot.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }
}

/// The audio stage: owns the probability model, state machine, pre-roll ring
/// and recording buffer. Driven by [`run`](Self::run) on its own task.
pub struct AudioStreamProcessor {
    vad: Box<dyn VadModel>,
    machine: VadStateMachine,
    bus: Arc<EventBus>,

    chunk_size: usize,
    min_speech_chunks: usize,
    queue_timeout: std::time::Duration,

    /// Ring of recent chunks, continuously refreshed while idle so the
    /// first syllable of an utterance is not clipped.
    pre_roll: VecDeque<Vec<f32>>,
    pre_roll_capacity: usize,

    recording: Vec<f32>,
    recording_start: Option<(DateTime<Local>, Instant)>,

    paused: Arc<AtomicBool>,
    status_tx: watch::Sender<StreamStatus>,
}

impl AudioStreamProcessor {
    pub fn new(
        config: &ScribeConfig,
        vad: Box<dyn VadModel>,
        bus: Arc<EventBus>,
    ) -> (Self, StreamHandle) {
        let paused = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(StreamStatus::default());

        let processor = Self {
            vad,
            machine: VadStateMachine::new(config.vad.detection.clone()),
            bus,
            chunk_size: config.core.chunk_size(),
            min_speech_chunks: config.vad.detection.min_speech_chunks,
            queue_timeout: std::time::Duration::from_secs_f64(
                config.audio.queue_get_timeout_sec,
            ),
            pre_roll: VecDeque::new(),
            pre_roll_capacity: config.vad.detection.pre_roll_chunks(config.core.chunk_ms),
            recording: Vec::new(),
            recording_start: None,
            paused: Arc::clone(&paused),
            status_tx,
        };
        let handle = StreamHandle {
            paused,
            status: status_rx,
        };
        (processor, handle)
    }

    /// Consume chunks until the source closes or the token fires. An
    /// in-progress utterance is finalized on either exit path.
    pub async fn run(mut self, mut rx: mpsc::Receiver<AudioChunk>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("audio stream cancelled");
                    break;
                }
                chunk = tokio::time::timeout(self.queue_timeout, rx.recv()) => {
                    match chunk {
                        Ok(Some(chunk)) => {
                            if self.paused.load(Ordering::Relaxed) {
                                continue;
                            }
                            if let Err(e) = self.process_chunk(&chunk.samples) {
                                warn!("chunk processing failed: {e}");
                            }
                        }
                        Ok(None) => {
                            debug!("audio source exhausted");
                            break;
                        }
                        // Quiet source; nothing to process this round.
                        Err(_elapsed) => {}
                    }
                }
            }
        }

        // Source EOF or stop while recording: synthesize the stop.
        if self.machine.is_recording() {
            self.finish_recording();
        }
        let _ = self.status_tx.send(StreamStatus::default());
        info!("audio stream processor stopped");
    }

    /// The per-chunk procedure. Deterministic: inference, status, pre-roll,
    /// state machine, buffer bookkeeping, in that order.
    fn process_chunk(&mut self, samples: &[f32]) -> Result<()> {
        let probability = self.vad.probability(samples)?;
        self.publish_status(probability);

        self.pre_roll.push_back(samples.to_vec());
        while self.pre_roll.len() > self.pre_roll_capacity {
            let _ = self.pre_roll.pop_front();
        }

        match self.machine.process(probability) {
            VadAction::StartRecording => self.start_recording(),
            VadAction::StopRecording => self.finish_recording(),
            VadAction::ResetVadModel => self.vad.reset_states(),
            VadAction::None => {}
        }

        if self.machine.is_recording() {
            self.recording.extend_from_slice(samples);
        }
        Ok(())
    }

    fn publish_status(&self, probability: f32) {
        let elapsed_seconds = match (self.machine.is_recording(), self.recording_start) {
            (true, Some((_, mono))) => mono.elapsed().as_secs_f64(),
            _ => 0.0,
        };
        let _ = self.status_tx.send(StreamStatus {
            probability,
            is_recording: self.machine.is_recording(),
            elapsed_seconds,
            speech_chunks: self.machine.speech_chunks(),
        });
    }

    /// Begin a recording: snapshot timestamps and seed the buffer with the
    /// whole pre-roll ring, oldest first.
    fn start_recording(&mut self) {
        self.recording_start = Some((Local::now(), Instant::now()));
        self.recording.clear();
        for chunk in &self.pre_roll {
            self.recording.extend_from_slice(chunk);
        }
        debug!(
            "recording started ({} pre-roll samples)",
            self.recording.len()
        );
    }

    /// Finish a recording and emit it if it carries more than the minimum
    /// amount of audio (strictly more; an exactly-minimal buffer is noise).
    fn finish_recording(&mut self) {
        let end_time = Local::now();
        let min_samples = self.min_speech_chunks * self.chunk_size;

        if self.recording.len() > min_samples {
            if let Some((start_time, _)) = self.recording_start {
                let samples = std::mem::take(&mut self.recording);
                debug!(
                    "utterance complete: {:.2}s",
                    samples.len() as f64 / 16_000.0
                );
                self.bus.audio_recorded.publish(&AudioRecordedEvent {
                    samples,
                    start_time,
                    end_time,
                });
            }
        } else if !self.recording.is_empty() {
            debug!("dropping {}-sample recording (too short)", self.recording.len());
        }

        self.recording.clear();
        self.recording_start = None;
        self.vad.reset_states();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageLevel;
    use std::sync::Mutex;

    /// Scripted model: reads the probability back out of the first sample of
    /// each chunk, so tests encode probability sequences as audio.
    struct ScriptedVad {
        resets: Arc<Mutex<usize>>,
    }

    impl VadModel for ScriptedVad {
        fn probability(&mut self, chunk: &[f32]) -> Result<f32> {
            Ok(chunk.first().copied().unwrap_or(0.0))
        }

        fn reset_states(&mut self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    fn chunk(probability: f32) -> AudioChunk {
        AudioChunk {
            samples: vec![probability; 512],
        }
    }

    struct Fixture {
        bus: Arc<EventBus>,
        events: Arc<Mutex<Vec<AudioRecordedEvent>>>,
        resets: Arc<Mutex<usize>>,
        processor: AudioStreamProcessor,
        handle: StreamHandle,
    }

    fn fixture() -> Fixture {
        let config = ScribeConfig::default();
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            bus.audio_recorded.subscribe(move |e: &AudioRecordedEvent| {
                events.lock().unwrap().push(e.clone());
            });
        }
        let resets = Arc::new(Mutex::new(0));
        let vad = Box::new(ScriptedVad {
            resets: Arc::clone(&resets),
        });
        let (processor, handle) = AudioStreamProcessor::new(&config, vad, Arc::clone(&bus));
        Fixture {
            bus,
            events,
            resets,
            processor,
            handle,
        }
    }

    async fn drive(fixture: Fixture, chunks: Vec<AudioChunk>) -> Fixture {
        let Fixture {
            bus,
            events,
            resets,
            processor,
            handle,
        } = fixture;
        let (tx, rx) = mpsc::channel(1024);
        for c in chunks {
            tx.send(c).await.unwrap();
        }
        drop(tx);
        processor.run(rx, CancellationToken::new()).await;
        // Processor is consumed by run; rebuild a fixture view for asserts.
        let config = ScribeConfig::default();
        let vad = Box::new(ScriptedVad {
            resets: Arc::clone(&resets),
        });
        let (processor, _) = AudioStreamProcessor::new(&config, vad, Arc::clone(&bus));
        Fixture {
            bus,
            events,
            resets,
            processor,
            handle,
        }
    }

    #[tokio::test]
    async fn utterance_includes_pre_roll() {
        let fixture = fixture();
        // 10 idle chunks fill the pre-roll, then speech, then silence.
        let mut chunks: Vec<AudioChunk> = (0..10).map(|_| chunk(0.1)).collect();
        chunks.extend((0..10).map(|_| chunk(0.9)));
        chunks.extend((0..25).map(|_| chunk(0.1)));

        let fixture = drive(fixture, chunks).await;
        let events = fixture.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        // 13 pre-roll chunks at start (10 idle + 3 speech), the start chunk
        // appended again, 7 more speech, 24 tolerated silence chunks: 45.
        assert_eq!(events[0].samples.len(), 45 * 512);
        assert!(events[0].end_time >= events[0].start_time);
    }

    #[tokio::test]
    async fn exactly_minimal_buffer_is_dropped() {
        let mut fixture = fixture();
        // The emit check is strict: a buffer of exactly
        // min_speech_chunks x chunk_size samples is treated as noise.
        fixture.processor.recording = vec![0.0; 3 * 512];
        fixture.processor.recording_start = Some((Local::now(), Instant::now()));
        fixture.processor.finish_recording();
        assert!(fixture.events.lock().unwrap().is_empty());

        // One more sample and it is emitted.
        fixture.processor.recording = vec![0.0; 3 * 512 + 1];
        fixture.processor.recording_start = Some((Local::now(), Instant::now()));
        fixture.processor.finish_recording();
        assert_eq!(fixture.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn eof_mid_recording_emits_final_event() {
        let fixture = fixture();
        let chunks: Vec<AudioChunk> = (0..10).map(|_| chunk(0.9)).collect();
        let fixture = drive(fixture, chunks).await;
        assert_eq!(fixture.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vad_reset_requested_after_stop() {
        let fixture = fixture();
        let mut chunks: Vec<AudioChunk> = (0..5).map(|_| chunk(0.9)).collect();
        chunks.extend((0..25).map(|_| chunk(0.1)));
        let fixture = drive(fixture, chunks).await;
        assert_eq!(fixture.events.lock().unwrap().len(), 1);
        assert!(*fixture.resets.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn paused_chunks_are_discarded() {
        let Fixture {
            bus: _bus,
            events,
            resets: _resets,
            processor,
            handle,
        } = fixture();

        handle.pause();
        let (tx, rx) = mpsc::channel(256);
        for _ in 0..50 {
            tx.send(chunk(0.9)).await.unwrap();
        }
        drop(tx);
        processor.run(rx, CancellationToken::new()).await;

        assert!(events.lock().unwrap().is_empty());
        // Pause then resume over silent input is observationally a no-op.
        handle.resume();
        assert!(!handle.is_paused());
    }

    #[tokio::test]
    async fn message_bus_untouched_by_audio_stage() {
        // The audio stage reports problems via tracing, not message_posted;
        // a clean run must not post messages.
        let fixture = fixture();
        let posted = Arc::new(Mutex::new(0usize));
        {
            let posted = Arc::clone(&posted);
            fixture.bus.message_posted.subscribe(move |e| {
                if e.level == MessageLevel::Error {
                    *posted.lock().unwrap() += 1;
                }
            });
        }
        let chunks: Vec<AudioChunk> = (0..30).map(|_| chunk(0.05)).collect();
        let _fixture = drive(fixture, chunks).await;
        assert_eq!(*posted.lock().unwrap(), 0);
    }
}
