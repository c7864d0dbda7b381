// Frame pipeline orchestrator
//
// One `step()` per captured frame:
//   acquire -> convert (pass-through or detect+draw) -> release -> encode -> publish
//
// The capture buffer goes back to the driver as soon as the conversion reads
// are done, whatever happens afterwards. Per-frame failures skip the frame.

use std::time::{Duration, Instant};

use super::clock::PipelineClock;
use super::overlay;
use super::queue::{MediaKind, PacketQueue};
use crate::devices::{
    CaptureDevice, CaptureError, Detection, Detector, FrameConverter, ImageFormat, PixelFormat,
    Surface, SurfaceMut,
};
use crate::encoding::VideoEncoder;

/// Interval between two status lines
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Hardware owned by the capture loop
pub struct FrameHardware {
    pub capture: Box<dyn CaptureDevice>,
    pub converter: Box<dyn FrameConverter>,
    pub encoder: Box<dyn VideoEncoder>,
    pub detector: Option<Box<dyn Detector>>,
}

/// Downstream queues fed by one step
#[derive(Clone, Copy, Default)]
pub struct FrameOutputs<'a> {
    pub stream: Option<&'a PacketQueue>,
    pub record: Option<&'a PacketQueue>,
}

/// Why a frame produced no packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CaptureTimeout,
    CaptureFailed,
    ConvertFailed,
    EncodeFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Encoded {
        bytes: usize,
        keyframe: bool,
        detections: usize,
    },
    Skipped(SkipReason),
}

/// Feature flags shown in the status line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub stream: bool,
    pub record: bool,
    pub ai: bool,
}

/// Rolling frame/byte counters for the periodic status line
#[derive(Debug)]
pub struct FrameStats {
    pub frames_total: u64,
    pub bytes_total: u64,
    pub skipped_total: u64,
    window_start: Instant,
    window_frames: u64,
    window_bytes: u64,
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            frames_total: 0,
            bytes_total: 0,
            skipped_total: 0,
            window_start: Instant::now(),
            window_frames: 0,
            window_bytes: 0,
        }
    }

    pub fn record_frame(&mut self, bytes: usize) {
        self.frames_total += 1;
        self.bytes_total += bytes as u64;
        self.window_frames += 1;
        self.window_bytes += bytes as u64;
    }

    pub fn record_skip(&mut self) {
        self.skipped_total += 1;
    }

    /// Status line for the current window once `STATUS_INTERVAL` has elapsed.
    /// Resets the window when it fires.
    pub fn poll_status(&mut self, flags: StatusFlags, now: Instant) -> Option<String> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < STATUS_INTERVAL {
            return None;
        }
        let line = format_status(flags, self.window_frames, self.window_bytes, elapsed);
        self.window_start = now;
        self.window_frames = 0;
        self.window_bytes = 0;
        Some(line)
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

/// `[SRT:ON] [REC:ON] [AI:--] | fps: 30 | bitrate: 2048.00 kbps`
pub fn format_status(flags: StatusFlags, frames: u64, bytes: u64, elapsed: Duration) -> String {
    let on = |enabled: bool| if enabled { "ON" } else { "--" };
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let fps = (frames as f64 / secs).round() as u64;
    let kbps = bytes as f64 * 8.0 / 1000.0 / secs;
    format!(
        "[SRT:{}] [REC:{}] [AI:{}] | fps: {} | bitrate: {:.2} kbps",
        on(flags.stream),
        on(flags.record),
        on(flags.ai),
        fps,
        kbps
    )
}

/// Application ownership of one capture buffer; returns it to the driver on drop
struct CaptureLease<'a> {
    device: &'a mut dyn CaptureDevice,
    index: usize,
}

impl CaptureLease<'_> {
    fn surface(&self) -> Result<Surface<'_>, CaptureError> {
        self.device.buffer(self.index)
    }
}

impl Drop for CaptureLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.release(self.index) {
            log::error!("[V4L2] Failed to return buffer {}: {}", self.index, e);
        }
    }
}

/// The capture/convert/encode loop body
pub struct FramePipeline {
    capture: Box<dyn CaptureDevice>,
    converter: Box<dyn FrameConverter>,
    encoder: Box<dyn VideoEncoder>,
    detector: Option<Box<dyn Detector>>,
    capture_timeout: Duration,
    /// Detector input, RGB at the model resolution
    ai_input: Vec<u8>,
    /// Display-resolution RGB frame the overlay is drawn on
    annotated: Vec<u8>,
    stats: FrameStats,
}

impl FramePipeline {
    pub fn new(hardware: FrameHardware, capture_timeout: Duration) -> Self {
        let FrameHardware {
            capture,
            converter,
            encoder,
            detector,
        } = hardware;

        // Augmented-path buffers are allocated once, never per frame
        let (ai_input, annotated) = match &detector {
            Some(detector) => {
                let (w, h) = detector.input_size();
                let display = encoder.input_format();
                (
                    vec![0u8; PixelFormat::Rgb24.frame_size(w, h)],
                    vec![0u8; PixelFormat::Rgb24.frame_size(display.width, display.height)],
                )
            }
            None => (Vec::new(), Vec::new()),
        };

        Self {
            capture,
            converter,
            encoder,
            detector,
            capture_timeout,
            ai_input,
            annotated,
            stats: FrameStats::new(),
        }
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut FrameStats {
        &mut self.stats
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        self.capture.start()
    }

    /// Stop streaming but keep the device open for another run
    pub fn stop_capture(&mut self) {
        self.capture.stop();
    }

    /// Run one iteration. Never blocks on downstream consumers.
    pub fn step(&mut self, clock: &PipelineClock, ai_enabled: bool, outputs: FrameOutputs<'_>) -> StepOutcome {
        let outcome = self.process_frame(clock, ai_enabled && self.detector.is_some(), outputs);
        if let StepOutcome::Skipped(_) = outcome {
            self.stats.record_skip();
        }
        outcome
    }

    fn process_frame(&mut self, clock: &PipelineClock, augmented: bool, outputs: FrameOutputs<'_>) -> StepOutcome {
        let index = match self.capture.wait_frame(self.capture_timeout) {
            Ok(index) => index,
            Err(CaptureError::Timeout) => {
                log::warn!("[V4L2] No frame within {} ms", self.capture_timeout.as_millis());
                return StepOutcome::Skipped(SkipReason::CaptureTimeout);
            }
            Err(e) => {
                log::error!("[V4L2] Capture failed: {}", e);
                return StepOutcome::Skipped(SkipReason::CaptureFailed);
            }
        };
        let capture_format = self.capture.format();
        let encoder_format = self.encoder.input_format();

        let lease = CaptureLease {
            device: self.capture.as_mut(),
            index,
        };
        let source = match lease.surface() {
            Ok(surface) => surface,
            Err(e) => {
                log::error!("[V4L2] Buffer {} unreadable: {}", index, e);
                return StepOutcome::Skipped(SkipReason::CaptureFailed);
            }
        };

        let mut detections = 0;
        if augmented {
            let Some(detector) = self.detector.as_mut() else {
                return StepOutcome::Skipped(SkipReason::ConvertFailed);
            };
            let (ai_w, ai_h) = detector.input_size();
            let ai_format = ImageFormat::new(ai_w, ai_h, PixelFormat::Rgb24);
            let display_format = ImageFormat::new(encoder_format.width, encoder_format.height, PixelFormat::Rgb24);

            let mut converted =
                self.converter
                    .convert(source, capture_format, SurfaceMut::Cpu(&mut self.ai_input), ai_format);
            if converted.is_ok() {
                converted = self.converter.convert(
                    source,
                    capture_format,
                    SurfaceMut::Cpu(&mut self.annotated),
                    display_format,
                );
            }
            // Both reads are done, the driver can refill the buffer
            drop(lease);
            if let Err(e) = converted {
                log::warn!("[AI] Conversion failed: {}", e);
                return StepOutcome::Skipped(SkipReason::ConvertFailed);
            }

            let found: Vec<Detection> = match detector.detect(&self.ai_input) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("[AI] Detection failed: {}", e);
                    Vec::new()
                }
            };
            detections = overlay::draw_detections(
                &mut self.annotated,
                display_format.width,
                display_format.height,
                (ai_w, ai_h),
                &found,
            );

            if let Err(e) = self.converter.convert(
                Surface::Cpu(&self.annotated),
                display_format,
                self.encoder.input_surface(),
                encoder_format,
            ) {
                log::warn!("[AI] Conversion to encoder input failed: {}", e);
                return StepOutcome::Skipped(SkipReason::ConvertFailed);
            }
        } else {
            let converted = self.converter.convert(
                source,
                capture_format,
                self.encoder.input_surface(),
                encoder_format,
            );
            drop(lease);
            if let Err(e) = converted {
                log::warn!("[Video] Conversion failed: {}", e);
                return StepOutcome::Skipped(SkipReason::ConvertFailed);
            }
        }

        let timestamp_ms = clock.elapsed_ms();
        let unit = match self.encoder.encode() {
            Ok(unit) => unit,
            Err(e) => {
                log::warn!("[Encoder] Encode failed: {}", e);
                return StepOutcome::Skipped(SkipReason::EncodeFailed);
            }
        };

        // One independent copy per consumer
        for queue in [outputs.stream, outputs.record].into_iter().flatten() {
            queue.push_copy(unit.data, timestamp_ms, unit.keyframe, MediaKind::Video);
        }

        let bytes = unit.data.len();
        let keyframe = unit.keyframe;
        self.stats.record_frame(bytes);
        StepOutcome::Encoded {
            bytes,
            keyframe,
            detections,
        }
    }

    /// Release hardware in dependency order: detector, encoder, capture
    pub fn shutdown(self) {
        let FramePipeline {
            mut capture,
            converter,
            encoder,
            detector,
            ..
        } = self;

        if let Some(detector) = detector {
            drop(detector);
            log::info!("[AI] Detector released");
        }
        drop(encoder);
        drop(converter);
        capture.stop();
        drop(capture);
        log::info!("[Video] Capture device released");
    }
}
