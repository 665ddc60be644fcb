//! Audio sources: live microphone capture and file playback.
//!
//! Both sources deliver fixed-size mono chunks at the pipeline sample rate
//! into an `mpsc` channel and stop when the cancellation token fires.

use crate::audio::AudioChunk;
use crate::config::{AudioConfig, CoreConfig};
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A chunk producer feeding the stream processor.
#[async_trait]
pub trait AudioSource: Send {
    /// Whether the source is paced by a real device (true) or replayable
    /// data (false).
    fn is_realtime(&self) -> bool;

    /// Produce chunks into `tx` until exhausted or cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying device or file fails.
    async fn run(&mut self, tx: mpsc::Sender<AudioChunk>, cancel: CancellationToken) -> Result<()>;
}

/// An input device as shown by `--list-devices`.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: usize,
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input devices with a default marker.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_input_devices() -> Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.description().ok().map(|desc| desc.name().to_owned()));

    let devices = host
        .input_devices()
        .map_err(|e| ScribeError::Audio(format!("cannot enumerate devices: {e}")))?;

    let mut result = Vec::new();
    for (id, device) in devices.enumerate() {
        if let Ok(desc) = device.description() {
            let name = desc.name().to_owned();
            let is_default = default_name.as_deref() == Some(name.as_str());
            result.push(AudioDevice {
                id,
                name,
                is_default,
            });
        }
    }
    Ok(result)
}

/// Regroups arbitrary-length device buffers into fixed-size pipeline chunks.
///
/// Device callbacks deliver whatever block size the backend chose; the VAD
/// needs exactly 512 samples at a time, so leftovers carry over to the next
/// callback.
struct ChunkAssembler {
    held: Vec<f32>,
    chunk_size: usize,
}

impl ChunkAssembler {
    fn new(chunk_size: usize) -> Self {
        Self {
            held: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        self.held.extend_from_slice(samples);
    }

    /// Detach one full chunk, or `None` while not enough samples are held.
    fn take_chunk(&mut self) -> Option<Vec<f32>> {
        if self.held.len() < self.chunk_size {
            return None;
        }
        let remainder = self.held.split_off(self.chunk_size);
        Some(std::mem::replace(&mut self.held, remainder))
    }

    fn discard(&mut self) {
        self.held.clear();
    }
}

/// Microphone capture via cpal.
///
/// Opens the device with its native configuration, then mixes to mono and
/// resamples to the pipeline rate in software.
pub struct MicSource {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    chunk_size: usize,
}

impl MicSource {
    /// Open the input device selected by index, or the system default.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable input device is available.
    pub fn new(device_id: Option<usize>, core: &CoreConfig, audio: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = match device_id {
            Some(id) => host
                .input_devices()
                .map_err(|e| ScribeError::Audio(format!("cannot enumerate devices: {e}")))?
                .nth(id)
                .ok_or_else(|| ScribeError::Audio(format!("no input device with id {id}")))?,
            None => host
                .default_input_device()
                .ok_or_else(|| ScribeError::Audio("no default input device".into()))?,
        };

        let device_name = match device.description() {
            Ok(d) => d.name().to_owned(),
            Err(_) => "<unknown>".into(),
        };
        info!("input device: {device_name}");

        let native = device
            .default_input_config()
            .map_err(|e| ScribeError::Audio(format!("no default input config: {e}")))?;

        // Request callback blocks of `block_sec` worth of frames; run()
        // falls back to the backend's own size if the request is refused.
        let requested_frames = (f64::from(native.sample_rate()) * audio.block_sec) as u32;
        let stream_config = StreamConfig {
            channels: native.channels(),
            sample_rate: native.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(requested_frames),
        };

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: core.sample_rate,
            chunk_size: core.chunk_size(),
        })
    }
}

#[async_trait]
impl AudioSource for MicSource {
    fn is_realtime(&self) -> bool {
        true
    }

    async fn run(&mut self, tx: mpsc::Sender<AudioChunk>, cancel: CancellationToken) -> Result<()> {
        let device_rate = self.stream_config.sample_rate;
        let device_channels = self.stream_config.channels as usize;
        let pipeline_rate = self.target_sample_rate;
        let chunk_size = self.chunk_size.max(1);

        // All capture state lives inside the data callback; cpal invokes it
        // from a single device thread, so plain mutable locals suffice.
        let make_data_callback = || {
            let tx = tx.clone();
            let mut assembler = ChunkAssembler::new(chunk_size);
            let mut receiver_gone = false;
            let mut dropped: u64 = 0;
            let mut last_drop_report = Instant::now();

            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if receiver_gone {
                    return;
                }

                let mono = downmix(data, device_channels);
                if device_rate == pipeline_rate {
                    assembler.push(&mono);
                } else {
                    assembler.push(&resample(&mono, device_rate, pipeline_rate));
                }

                while let Some(samples) = assembler.take_chunk() {
                    // The device thread must never block on the pipeline;
                    // a full channel costs us the chunk instead.
                    match tx.try_send(AudioChunk { samples }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            receiver_gone = true;
                            assembler.discard();
                            return;
                        }
                    }
                }

                if dropped > 0 && last_drop_report.elapsed() >= Duration::from_secs(5) {
                    warn!("pipeline is behind: {dropped} chunks dropped in the last 5s");
                    dropped = 0;
                    last_drop_report = Instant::now();
                }
            }
        };

        let build = |buffer_size: cpal::BufferSize| {
            let stream_config = StreamConfig {
                channels: self.stream_config.channels,
                sample_rate: device_rate,
                buffer_size,
            };
            self.device.build_input_stream(
                &stream_config,
                make_data_callback(),
                |err| error!("input stream error: {err}"),
                None,
            )
        };

        // Not every backend accepts a fixed block size.
        let stream = match build(self.stream_config.buffer_size) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("fixed buffer size rejected ({e}), using device default");
                build(cpal::BufferSize::Default)
                    .map_err(|e| ScribeError::Audio(format!("failed to build input stream: {e}")))?
            }
        };

        stream
            .play()
            .map_err(|e| ScribeError::Audio(format!("failed to start input stream: {e}")))?;

        info!(
            "capturing at {device_rate}Hz/{device_channels}ch, delivering {pipeline_rate}Hz mono"
        );

        // The device stays open for as long as the stream object lives.
        cancel.cancelled().await;
        drop(stream);

        info!("microphone capture stopped");
        Ok(())
    }
}

/// Playback of an audio file (mp3/wav and friends) as a chunk stream.
///
/// Decodes the whole file up front, mixes to mono, and resamples to the
/// pipeline rate. With `realtime_simulation` the chunks are paced at the
/// rate a live device would deliver them.
pub struct FileSource {
    path: PathBuf,
    realtime_simulation: bool,
    target_sample_rate: u32,
    chunk_size: usize,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, realtime_simulation: bool, core: &CoreConfig) -> Self {
        Self {
            path: path.into(),
            realtime_simulation,
            target_sample_rate: core.sample_rate,
            chunk_size: core.chunk_size(),
        }
    }

    /// Decode the file into mono f32 samples at the pipeline rate.
    fn load(&self) -> Result<Vec<f32>> {
        let decoded = read_audio_file(&self.path)?;
        if decoded.sample_rate == self.target_sample_rate {
            Ok(decoded.samples)
        } else {
            Ok(resample(
                &decoded.samples,
                decoded.sample_rate,
                self.target_sample_rate,
            ))
        }
    }
}

#[async_trait]
impl AudioSource for FileSource {
    fn is_realtime(&self) -> bool {
        false
    }

    async fn run(&mut self, tx: mpsc::Sender<AudioChunk>, cancel: CancellationToken) -> Result<()> {
        let audio = self.load()?;
        let chunk_duration =
            Duration::from_secs_f64(self.chunk_size as f64 / f64::from(self.target_sample_rate));
        info!(
            "streaming {} ({:.1}s of audio)",
            self.path.display(),
            audio.len() as f64 / f64::from(self.target_sample_rate)
        );

        for window in audio.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                break;
            }

            // Zero-pad the trailing partial chunk.
            let mut samples = window.to_vec();
            samples.resize(self.chunk_size, 0.0);

            if tx.send(AudioChunk { samples }).await.is_err() {
                break;
            }

            if self.realtime_simulation {
                tokio::time::sleep(chunk_duration).await;
            }
        }

        info!("file source finished");
        Ok(())
    }
}

/// Decoded file content at its native rate, already mixed to one channel.
struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// Decode a media file to mono f32 samples.
///
/// Symphonia probes the container, then each packet of the primary track is
/// decoded, converted to interleaved f32, and averaged down to one channel.
fn read_audio_file(path: &std::path::Path) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path)
        .map_err(|e| ScribeError::Audio(format!("cannot open {}: {e}", path.display())))?;

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let mut reader = symphonia::default::get_probe()
        .format(
            &hint,
            MediaSourceStream::new(Box::new(file), Default::default()),
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ScribeError::Audio(format!("unrecognized audio format: {e}")))?
        .format;

    let (selected_track, decoder_params) = {
        let track = reader
            .default_track()
            .ok_or_else(|| ScribeError::Audio(format!("{}: no audio track", path.display())))?;
        (track.id, track.codec_params.clone())
    };
    let sample_rate = decoder_params.sample_rate.ok_or_else(|| {
        ScribeError::Audio(format!("{}: sample rate not declared", path.display()))
    })?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&decoder_params, &DecoderOptions::default())
        .map_err(|e| ScribeError::Audio(format!("unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            // End of stream surfaces as an unexpected EOF.
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(ScribeError::Audio(format!("packet read failed: {e}"))),
        };
        if packet.track_id() != selected_track {
            continue;
        }

        let audio = match decoder.decode(&packet) {
            Ok(audio) => audio,
            // A damaged packet is recoverable; pick up at the next one.
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(ScribeError::Audio(format!("decode failed: {e}"))),
        };

        let layout = *audio.spec();
        let mut interleaved = SampleBuffer::<f32>::new(audio.frames() as u64, layout);
        interleaved.copy_interleaved_ref(audio);
        samples.extend(downmix(
            interleaved.samples(),
            layout.channels.count(),
        ));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Mix interleaved frames down to one channel by averaging.
fn downmix(frames: &[f32], channel_count: usize) -> Vec<f32> {
    if channel_count <= 1 {
        return frames.to_vec();
    }
    let mut mono = Vec::with_capacity(frames.len() / channel_count);
    let mut offset = 0;
    while offset + channel_count <= frames.len() {
        let frame = &frames[offset..offset + channel_count];
        mono.push(frame.iter().sum::<f32>() / channel_count as f32);
        offset += channel_count;
    }
    mono
}

/// Resample by linear interpolation between neighboring input samples.
///
/// Adequate for speech: the phonetic band ends well below the 8kHz Nyquist
/// limit of the 16kHz target, so no anti-alias filtering is needed.
fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let step = f64::from(from_rate) / f64::from(to_rate);
    let output_len = (input.len() as f64 / step) as usize;

    (0..output_len)
        .map(|n| {
            let position = n as f64 * step;
            let left = position as usize;
            let right = (left + 1).min(input.len() - 1);
            let between = (position - left as f64) as f32;
            input[left] + (input[right] - input[left]) * between
        })
        .collect()
}
