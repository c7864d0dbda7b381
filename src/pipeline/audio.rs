// Audio worker: capture -> AAC -> packet queues
//
// Audio shares the pipeline clock with video. Timestamps advance by the
// number of encoded samples from the moment the first frame was read, so
// they never drift with scheduling jitter. Samples the source had to drop
// still count towards that total.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::clock::PipelineClock;
use super::queue::{MediaKind, PacketQueue};
use crate::audio::{AudioError, AudioSource};
use crate::encoding::AudioEncoder;

/// How long one read may block before the running flag is checked again
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A capture source and its encoder, created on the audio thread
pub struct AudioStages {
    pub source: Box<dyn AudioSource>,
    pub encoder: Box<dyn AudioEncoder>,
}

/// Opens the audio stages for one run
pub trait AudioFactory: Send + Sync {
    fn open(&self) -> Result<AudioStages, AudioError>;
}

impl<F> AudioFactory for F
where
    F: Fn() -> Result<AudioStages, AudioError> + Send + Sync,
{
    fn open(&self) -> Result<AudioStages, AudioError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub frames_read: u64,
    pub units_encoded: u64,
    pub encode_errors: u64,
    pub dropped_samples: u64,
}

/// Audio worker body. Runs until `running` is cleared.
pub fn run_audio(
    factory: Arc<dyn AudioFactory>,
    running: Arc<AtomicBool>,
    clock: PipelineClock,
    outputs: Vec<Arc<PacketQueue>>,
) -> AudioStats {
    let mut stats = AudioStats::default();

    let AudioStages { mut source, mut encoder } = match factory.open() {
        Ok(stages) => stages,
        Err(e) => {
            log::error!("[Audio] Init failed, continuing without audio: {}", e);
            return stats;
        }
    };

    let rate = source.sample_rate().max(1) as u64;
    let channels = source.channels().max(1) as u64;
    let frame_samples = encoder.frame_samples();
    let mut pcm = vec![0i16; frame_samples * source.channels() as usize];
    let mut base_ms: Option<u64> = None;
    let mut encoded_samples: u64 = 0;

    log::info!("[Audio] Worker started ({} Hz, {} ch)", rate, source.channels());

    while running.load(Ordering::SeqCst) {
        match source.read_frame(&mut pcm, READ_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::error!("[Audio] Capture failed: {}", e);
                break;
            }
        }
        stats.frames_read += 1;
        let base = *base_ms.get_or_insert_with(|| clock.elapsed_ms());

        // Frames still in the ring predate the overrun, so the gap is
        // applied after this frame's units
        let dropped = source.take_dropped_samples();
        let gap = dropped / channels;
        if dropped > 0 {
            stats.dropped_samples += dropped;
            log::warn!("[Audio] Capture overrun, {} ms of samples lost", gap * 1000 / rate);
        }

        match encoder.encode(&pcm) {
            Ok(units) => {
                for unit in units {
                    let timestamp_ms = base + encoded_samples * 1000 / rate;
                    encoded_samples += frame_samples as u64;
                    stats.units_encoded += 1;
                    for queue in &outputs {
                        queue.push_copy(&unit, timestamp_ms, true, MediaKind::Audio);
                    }
                }
            }
            Err(e) => {
                stats.encode_errors += 1;
                log::warn!("[Audio] Encode failed: {}", e);
            }
        }
        encoded_samples += gap;
    }

    log::info!(
        "[Audio] Worker stopped: {} frames read, {} units encoded",
        stats.frames_read,
        stats.units_encoded
    );
    stats
}
