// Microphone capture
//
// cpal delivers f32 samples on its own callback thread; they are converted to
// S16 and handed to the audio worker through a lock-free ring buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};

/// Error type for audio capture
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Audio encoder error: {0}")]
    Encoder(#[from] crate::encoding::EncoderError),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Blocking source of fixed-size interleaved S16 frames
pub trait AudioSource {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Fill `frame` completely. Returns `Ok(false)` if not enough samples
    /// arrived within `timeout`; nothing is consumed in that case.
    fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<bool>;

    /// Interleaved samples lost since the last call because the reader fell
    /// behind. Resets the count.
    fn take_dropped_samples(&mut self) -> u64 {
        0
    }
}

/// Seconds of audio the ring buffer can hold before the callback drops samples
const RING_SECONDS: usize = 2;

/// Poll interval while waiting for the callback to deliver samples
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// cpal input stream.
///
/// `cpal::Stream` is not `Send`, so this source must be created on the thread
/// that reads from it.
pub struct CpalAudioSource {
    _stream: cpal::Stream,
    consumer: HeapCons<i16>,
    sample_rate: u32,
    channels: u16,
    dropped: Arc<AtomicU64>,
}

impl CpalAudioSource {
    /// Open `device_name` (empty selects the default input) at the requested format
    pub fn open(device_name: &str, sample_rate: u32, channels: u16) -> Result<Self> {
        let host = cpal::default_host();

        let device = if device_name.is_empty() {
            host.default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("default input".into()))?
        } else {
            host.input_devices()
                .map_err(|e| AudioError::Stream(e.to_string()))?
                .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()))?
        };
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = HeapRb::<i16>::new(sample_rate as usize * channels as usize * RING_SECONDS);
        let (mut producer, consumer) = ring.split();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_callback = dropped.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for (i, &sample) in data.iter().enumerate() {
                        // Full ring: the worker is stalled, newest samples are lost
                        if producer.try_push(f32_to_i16(sample)).is_err() {
                            dropped_in_callback.fetch_add((data.len() - i) as u64, Ordering::Relaxed);
                            break;
                        }
                    }
                },
                |err| {
                    log::warn!("[Audio] Stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::Stream(format!("{}: {}", name, e)))?;

        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("{}: {}", name, e)))?;

        log::info!("[Audio] Capturing from {} ({} Hz, {} ch)", name, sample_rate, channels);

        Ok(Self {
            _stream: stream,
            consumer,
            sample_rate,
            channels,
            dropped,
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.consumer.occupied_len() < frame.len() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        let read = self.consumer.pop_slice(frame);
        Ok(read == frame.len())
    }

    fn take_dropped_samples(&mut self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
