//! Typed publish/subscribe topics wiring the pipeline stages together.
//!
//! Dispatch is synchronous on the publisher's task, which keeps per-topic
//! ordering identical to publish order. A bus instance is passed to the
//! components that need it; there is no global singleton.

use crate::session::TranscriptionSegment;
use chrono::{DateTime, Local};
use std::sync::{Arc, RwLock};

/// Severity of a posted message. The UI renders all levels; the session
/// records only `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A finished utterance leaving the audio stage.
#[derive(Debug, Clone)]
pub struct AudioRecordedEvent {
    /// Concatenated samples, pre-roll included.
    pub samples: Vec<f32>,
    /// Wall-clock start of the recording.
    pub start_time: DateTime<Local>,
    /// Wall-clock end of the recording.
    pub end_time: DateTime<Local>,
}

/// A segment accepted by the transcription worker.
#[derive(Debug, Clone)]
pub struct SegmentTranscribedEvent {
    pub segment: TranscriptionSegment,
}

/// A summary produced by the summarizer.
#[derive(Debug, Clone)]
pub struct SummaryGeneratedEvent {
    pub summary: String,
    pub is_final: bool,
}

/// A status or problem report from any stage.
#[derive(Debug, Clone)]
pub struct MessagePostedEvent {
    pub message: String,
    pub level: MessageLevel,
    pub timestamp: DateTime<Local>,
}

impl MessagePostedEvent {
    pub fn new(level: MessageLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: Local::now(),
        }
    }
}

/// One event topic with a thread-safe subscriber set.
pub struct Topic<E> {
    subscribers: RwLock<Vec<Box<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> Default for Topic<E> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Topic<E> {
    /// Register a handler. Handlers run synchronously on the publisher's
    /// thread, in subscription order.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: &E) {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for handler in subscribers.iter() {
            handler(event);
        }
    }
}

/// The four pipeline topics.
#[derive(Default)]
pub struct EventBus {
    pub audio_recorded: Topic<AudioRecordedEvent>,
    pub segment_transcribed: Topic<SegmentTranscribedEvent>,
    pub summary_generated: Topic<SummaryGeneratedEvent>,
    pub message_posted: Topic<MessagePostedEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post a message at the given level.
    pub fn post_message(&self, level: MessageLevel, message: impl Into<String>) {
        self.message_posted
            .publish(&MessagePostedEvent::new(level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn publish_reaches_all_subscribers_in_order() {
        let topic: Topic<MessagePostedEvent> = Topic::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            topic.subscribe(move |e: &MessagePostedEvent| {
                seen.lock().unwrap().push(format!("{tag}:{}", e.message));
            });
        }

        topic.publish(&MessagePostedEvent::new(MessageLevel::Info, "x"));
        topic.publish(&MessagePostedEvent::new(MessageLevel::Error, "y"));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["a:x", "b:x", "a:y", "b:y"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.post_message(MessageLevel::Warning, "nobody listening");
    }
}
