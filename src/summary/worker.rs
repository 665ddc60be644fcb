//! The summarizer worker: batches transcribed segments and maintains a
//! rolling structured summary.
//!
//! A round fires when enough new text has accumulated or when the speaker
//! has gone quiet with text still pending. Each round folds the pending
//! batch into the rolling summary, keeping a small window of already
//! summarized segments as conversational context for the next round.

use crate::config::SummaryConfig;
use crate::events::{EventBus, MessageLevel, SummaryGeneratedEvent};
use crate::session::TranscriptionSegment;
use crate::summary::prompts::{
    FinalSummaryPromptStrategy, PromptContext, PromptStrategy, RealtimePromptStrategy,
};
use crate::summary::{GenerationOptions, LlmClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Segment buffers guarded by one lock.
#[derive(Default)]
struct Buffers {
    /// Segments folded into `current_summary`, truncated to the context
    /// window.
    summarized: Vec<TranscriptionSegment>,
    /// Segments received since the last summary round.
    pending: Vec<TranscriptionSegment>,
    /// When the newest pending segment arrived.
    last_segment_time: Option<Instant>,
}

struct State {
    config: SummaryConfig,
    buffers: Mutex<Buffers>,
    current_summary: Mutex<String>,
    is_summarizing: AtomicBool,
    running: AtomicBool,
    trigger: Notify,
}

impl State {
    fn pending_chars(&self) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .pending
            .iter()
            .map(|seg| seg.text.chars().count())
            .sum()
    }

    fn should_summarize(&self) -> bool {
        let (chars, last_time) = {
            let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let chars: usize = buffers
                .pending
                .iter()
                .map(|seg| seg.text.chars().count())
                .sum();
            (chars, buffers.last_segment_time)
        };

        if chars >= self.config.trigger_threshold {
            return true;
        }
        if chars > 0 {
            if let Some(last) = last_time {
                return last.elapsed().as_secs_f64() >= self.config.silence_timeout_sec;
            }
        }
        false
    }
}

/// Feeding/observation handle held by the event-bus subscriber and the UI.
#[derive(Clone)]
pub struct SummarizerClient {
    state: Arc<State>,
}

impl SummarizerClient {
    /// Buffer a freshly transcribed segment and wake the worker.
    pub fn add_segment(&self, segment: TranscriptionSegment) {
        if !self.state.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut buffers = self.state.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.pending.push(segment);
            buffers.last_segment_time = Some(Instant::now());
        }
        self.state.trigger.notify_one();
    }

    /// Characters of text waiting for the next round.
    pub fn buffer_char_count(&self) -> usize {
        self.state.pending_chars()
    }

    /// Whether an LLM call is in flight.
    pub fn is_summarizing(&self) -> bool {
        self.state.is_summarizing.load(Ordering::SeqCst)
    }
}

/// Owner handle: client access plus shutdown.
pub struct SummarizerHandle {
    state: Arc<State>,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    join: JoinHandle<()>,
}

impl SummarizerHandle {
    pub fn client(&self) -> SummarizerClient {
        SummarizerClient {
            state: Arc::clone(&self.state),
        }
    }

    /// Stop the worker and, when a session snapshot is supplied, generate
    /// the final whole-session summary.
    ///
    /// The configured shutdown timeout bounds only the worker join; the
    /// final LLM call itself runs to completion.
    pub async fn shutdown(self, session_segments: Option<Vec<TranscriptionSegment>>) {
        self.state.running.store(false, Ordering::SeqCst);
        {
            let mut buffers = self.state.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.pending.clear();
        }
        self.state.trigger.notify_one();

        let join_timeout = Duration::from_secs_f64(self.state.config.shutdown_timeout_sec);
        if tokio::time::timeout(join_timeout, self.join).await.is_err() {
            warn!("summarizer worker did not stop within {join_timeout:?}");
        }

        let Some(segments) = session_segments else {
            return;
        };
        if segments.is_empty() {
            return;
        }

        let strategy = FinalSummaryPromptStrategy;
        let user_prompt = strategy.build_user_prompt(&PromptContext {
            previous_summary: None,
            processed_segments: &[],
            new_segments: &segments,
        });
        let options = GenerationOptions {
            temperature: self.state.config.final_temperature,
            top_p: self.state.config.final_top_p,
            max_tokens: None,
        };

        match self
            .llm
            .generate(strategy.system_prompt(), &user_prompt, &options)
            .await
        {
            Ok(Some(summary)) => {
                self.bus.summary_generated.publish(&SummaryGeneratedEvent {
                    summary,
                    is_final: true,
                });
            }
            Ok(None) => debug!("final summary came back empty"),
            Err(e) => {
                self.bus.post_message(
                    MessageLevel::Error,
                    format!("Final summary generation failed: {e}"),
                );
            }
        }
    }
}

/// Constructor for the summarizer worker.
pub struct Summarizer;

impl Summarizer {
    pub fn spawn(
        config: SummaryConfig,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
    ) -> SummarizerHandle {
        let state = Arc::new(State {
            config,
            buffers: Mutex::new(Buffers::default()),
            current_summary: Mutex::new(String::new()),
            is_summarizing: AtomicBool::new(false),
            running: AtomicBool::new(true),
            trigger: Notify::new(),
        });

        let join = tokio::spawn(run_worker(
            Arc::clone(&state),
            Arc::clone(&llm),
            Arc::clone(&bus),
        ));

        SummarizerHandle {
            state,
            llm,
            bus,
            join,
        }
    }
}

async fn run_worker(state: Arc<State>, llm: Arc<dyn LlmClient>, bus: Arc<EventBus>) {
    let strategy = RealtimePromptStrategy;
    let wake_timeout = Duration::from_secs_f64(state.config.queue_get_timeout_sec);

    while state.running.load(Ordering::SeqCst) {
        tokio::select! {
            () = state.trigger.notified() => {}
            () = tokio::time::sleep(wake_timeout) => {}
        }

        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        if state.should_summarize() {
            if let Some(summary) = process_buffer(&state, &strategy, llm.as_ref(), &bus).await {
                bus.summary_generated.publish(&SummaryGeneratedEvent {
                    summary,
                    is_final: false,
                });
            }
        }
    }
    info!("summarizer worker stopped");
}

/// Run one summary round. Returns the new rolling summary, or `None` when
/// there was nothing to do or the round failed.
async fn process_buffer(
    state: &Arc<State>,
    strategy: &dyn PromptStrategy,
    llm: &dyn LlmClient,
    bus: &Arc<EventBus>,
) -> Option<String> {
    let (new_segments, context_segments) = {
        let mut buffers = state.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.pending.is_empty() {
            return None;
        }
        let new_segments = std::mem::take(&mut buffers.pending);
        (new_segments, buffers.summarized.clone())
    };

    let previous_summary = {
        let current = state
            .current_summary
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if current.is_empty() {
            None
        } else {
            Some(current.clone())
        }
    };

    let user_prompt = strategy.build_user_prompt(&PromptContext {
        previous_summary: previous_summary.as_deref(),
        processed_segments: &context_segments,
        new_segments: &new_segments,
    });
    let options = GenerationOptions {
        temperature: state.config.realtime_temperature,
        top_p: state.config.realtime_top_p,
        max_tokens: None,
    };

    state.is_summarizing.store(true, Ordering::SeqCst);
    let result = llm
        .generate(strategy.system_prompt(), &user_prompt, &options)
        .await;
    state.is_summarizing.store(false, Ordering::SeqCst);

    match result {
        Ok(Some(summary)) => {
            {
                let mut current = state
                    .current_summary
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                current.clone_from(&summary);
            }
            let mut buffers = state.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.summarized.extend(new_segments);
            let window = state.config.recent_segments_for_context;
            let len = buffers.summarized.len();
            if len > window {
                buffers.summarized.drain(..len - window);
            }
            Some(summary)
        }
        Ok(None) => {
            debug!("summary round produced no text");
            None
        }
        Err(e) => {
            bus.post_message(
                MessageLevel::Error,
                format!("Summary generation failed: {e}"),
            );
            // Keep the batch for the next trigger instead of losing it.
            let mut buffers = state.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let mut restored = new_segments;
            restored.append(&mut buffers.pending);
            buffers.pending = restored;
            None
        }
    }
}
