//! Audio input: source abstraction and the VAD-driven stream processor.

pub mod source;
pub mod stream;

pub use source::{list_input_devices, AudioDevice, AudioSource, FileSource, MicSource};
pub use stream::{AudioStreamProcessor, StreamHandle, StreamStatus};

/// One fixed-size window of mono f32 samples at the pipeline sample rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
}
