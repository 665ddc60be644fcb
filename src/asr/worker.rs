//! The transcription worker: a single long-running task that drains the
//! utterance queue, runs the engine with quality-gated retries, and
//! publishes accepted segments.

use crate::asr::{AsrEngine, HallucinationFilter, RetryStrategy, StrategyDecision};
use crate::config::{ScribeConfig, WhisperParams};
use crate::events::{EventBus, MessageLevel, SegmentTranscribedEvent};
use crate::session::TranscriptionSegment;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One utterance awaiting transcription.
struct Job {
    samples: Arc<Vec<f32>>,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
}

struct Shared {
    /// Sender side of the queue. Taken (and dropped) at shutdown so the
    /// worker sees end-of-queue after draining.
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    /// Jobs enqueued but not yet picked up.
    depth: AtomicUsize,
    /// Whether a job is being processed right now.
    busy: AtomicBool,
}

impl Shared {
    fn is_transcribing(&self) -> bool {
        self.busy.load(Ordering::SeqCst) || self.depth.load(Ordering::SeqCst) > 0
    }
}

/// Cheap handle for enqueueing work and reading worker gauges; held by the
/// event-bus subscriber and the UI.
#[derive(Clone)]
pub struct TranscriberClient {
    shared: Arc<Shared>,
}

impl TranscriberClient {
    /// Queue an utterance. Silently dropped after shutdown has begun.
    pub fn enqueue(
        &self,
        samples: Vec<f32>,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
    ) {
        let guard = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            self.shared.depth.fetch_add(1, Ordering::SeqCst);
            let job = Job {
                samples: Arc::new(samples),
                start_time,
                end_time,
            };
            if tx.send(job).is_err() {
                self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// True while a job is in flight or queued. Drives shutdown draining
    /// and the UI busy indicator.
    pub fn is_transcribing(&self) -> bool {
        self.shared.is_transcribing()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }
}

/// Owner handle: gauges plus shutdown control.
pub struct TranscriberHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TranscriberHandle {
    pub fn client(&self) -> TranscriberClient {
        TranscriberClient {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_transcribing(&self) -> bool {
        self.shared.is_transcribing()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    /// Stop the worker.
    ///
    /// Graceful mode closes the queue and lets the worker finish whatever
    /// is already enqueued, bounded by `timeout`; fast mode abandons the
    /// queue and gives the in-flight job one second.
    pub async fn shutdown(self, graceful: bool, timeout: Duration) {
        {
            let mut guard = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
            let _ = guard.take();
        }

        if graceful {
            match tokio::time::timeout(timeout, self.join).await {
                Ok(_) => debug!("transcription worker drained"),
                Err(_) => {
                    warn!("transcription worker did not drain within {timeout:?}");
                    self.cancel.cancel();
                }
            }
        } else {
            self.cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.join).await;
        }
    }
}

/// Constructor for the worker task.
pub struct TranscriptionWorker;

impl TranscriptionWorker {
    /// Spawn the worker with the given engine.
    pub fn spawn(
        config: &ScribeConfig,
        engine: Box<dyn AsrEngine>,
        bus: Arc<EventBus>,
    ) -> TranscriberHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx: Mutex::new(Some(tx)),
            depth: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let join = tokio::spawn(run_worker(
            engine,
            config.whisper.params.clone(),
            HallucinationFilter::new(config.hallucination.clone()),
            f64::from(config.core.sample_rate),
            bus,
            Arc::clone(&shared),
            rx,
            cancel.clone(),
        ));

        TranscriberHandle {
            shared,
            cancel,
            join,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    engine: Box<dyn AsrEngine>,
    params: Vec<WhisperParams>,
    filter: HallucinationFilter,
    sample_rate: f64,
    bus: Arc<EventBus>,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    let Some(warm_params) = params.first().cloned() else {
        bus.post_message(MessageLevel::Error, "No whisper parameter phases configured");
        return;
    };

    // Pre-warm: one second of silence forces the model load up front so the
    // first real utterance is not delayed. Failure is not fatal.
    let mut engine = Some(engine);
    if let Some(eng) = engine.take() {
        bus.post_message(MessageLevel::Info, "Warming up ASR engine...");
        let warm = vec![0.0_f32; sample_rate as usize];
        match tokio::task::spawn_blocking(move || {
            let mut eng = eng;
            let result = eng.transcribe(&warm, &warm_params);
            (eng, result)
        })
        .await
        {
            Ok((eng, result)) => {
                engine = Some(eng);
                match result {
                    Ok(_) => bus.post_message(MessageLevel::Success, "ASR engine ready.\n"),
                    Err(e) => bus.post_message(
                        MessageLevel::Warning,
                        format!("ASR warm-up failed: {e} (model loads on first utterance)"),
                    ),
                }
            }
            Err(e) => {
                bus.post_message(MessageLevel::Error, format!("ASR warm-up panicked: {e}"));
                return;
            }
        }
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("transcription worker cancelled, dropping queue");
                break;
            }
            job = rx.recv() => {
                match job {
                    Some(job) => {
                        // busy flips on before the depth drops so
                        // `is_transcribing` never blinks false mid-handoff.
                        shared.busy.store(true, Ordering::SeqCst);
                        shared.depth.fetch_sub(1, Ordering::SeqCst);
                        process_job(&mut engine, &params, &filter, sample_rate, &bus, job).await;
                        shared.busy.store(false, Ordering::SeqCst);
                    }
                    None => {
                        debug!("transcription queue closed");
                        break;
                    }
                }
            }
        }
    }
    info!("transcription worker stopped");
}

/// Run one utterance through the retry ladder until acceptance, discard, or
/// an engine failure.
async fn process_job(
    engine: &mut Option<Box<dyn AsrEngine>>,
    params: &[WhisperParams],
    filter: &HallucinationFilter,
    sample_rate: f64,
    bus: &Arc<EventBus>,
    job: Job,
) {
    let processing_start = Instant::now();
    let audio_duration = job.samples.len() as f64 / sample_rate;
    let mut strategy = RetryStrategy::new(params.to_vec());

    loop {
        let decode_params = strategy.current_params().clone();
        let Some(eng) = engine.take() else {
            bus.post_message(MessageLevel::Error, "Transcription failed: engine unavailable");
            return;
        };
        let samples = Arc::clone(&job.samples);

        let joined = tokio::task::spawn_blocking(move || {
            let mut eng = eng;
            let result = eng.transcribe(&samples, &decode_params);
            (eng, result)
        })
        .await;

        let (eng, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                bus.post_message(MessageLevel::Error, format!("Transcription failed: {e}"));
                return;
            }
        };
        *engine = Some(eng);

        // Engine-level failures are structural; no parameter change fixes
        // them, so there is no retry.
        let output = match result {
            Ok(o) => o,
            Err(e) => {
                bus.post_message(MessageLevel::Error, format!("Transcription failed: {e}"));
                return;
            }
        };

        let text = output.text.trim().to_owned();
        let (avg_logprob, compression_ratio, no_speech_prob) =
            filter.extract_metrics(&output.segments);
        let filter_reason = filter.evaluate(&text, avg_logprob, Some(audio_duration));

        match strategy.evaluate(&text, filter_reason.as_deref()) {
            StrategyDecision::Accept => {
                let segment = TranscriptionSegment {
                    text,
                    start_time: job.start_time,
                    end_time: job.end_time,
                    audio_duration,
                    processing_time: processing_start.elapsed().as_secs_f64(),
                    avg_logprob,
                    compression_ratio,
                    no_speech_prob,
                };
                bus.segment_transcribed
                    .publish(&SegmentTranscribedEvent { segment });
                return;
            }
            StrategyDecision::Retry { reason, .. } => {
                let (attempt, max_attempts) = strategy.attempt_info();
                bus.post_message(
                    MessageLevel::Error,
                    format!(
                        "Quality issue detected (attempt {}/{max_attempts}): {reason} | \
                         Retrying with stricter parameters...",
                        attempt - 1
                    ),
                );
            }
            StrategyDecision::Discard { reason } => {
                if filter_reason.is_some() {
                    let (attempt, max_attempts) = strategy.attempt_info();
                    let preview: String = text.chars().take(50).collect();
                    bus.post_message(
                        MessageLevel::Error,
                        format!(
                            "Quality issue filtered (attempt {attempt}/{max_attempts}): \
                             {reason} | Text: '{preview}...'"
                        ),
                    );
                }
                return;
            }
        }
    }
}
