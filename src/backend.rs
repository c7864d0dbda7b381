// Default collaborator set built from the configuration
//
// V4L2 capture, CPU color conversion, GStreamer H.264/AAC encoders, cpal
// audio input and an SRT or UDP transport. Detectors come from a loader
// supplied by the caller since no inference runtime is linked in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::{AudioError, CpalAudioSource};
use crate::config::{AiConfig, Config, TransportProtocol};
use crate::devices::{CaptureError, DetectError, Detector, SoftwareConverter, V4l2Capture};
use crate::encoding::aac::GstAacEncoder;
use crate::encoding::encoder::{EncoderConfig, GstH264Encoder};
use crate::encoding::EncoderError;
use crate::pipeline::{AudioFactory, AudioStages, FrameHardware, Services};
use crate::transport::{SrtTransport, Transport, TransportFactory, UdpTransport};

/// AAC target bitrate in bit/s
const AAC_BITRATE: u32 = 128_000;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Capture init failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Encoder init failed: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("No detector backend is built in (model {})", .0.display())]
    NoDetector(PathBuf),

    #[error("Detector init failed: {0}")]
    Detector(#[from] DetectError),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Builds a detector from a model file for a given input resolution
pub trait DetectorLoader {
    fn load(&self, model: &Path, input_size: (u32, u32)) -> std::result::Result<Box<dyn Detector>, DetectError>;
}

impl<F> DetectorLoader for F
where
    F: Fn(&Path, (u32, u32)) -> std::result::Result<Box<dyn Detector>, DetectError>,
{
    fn load(&self, model: &Path, input_size: (u32, u32)) -> std::result::Result<Box<dyn Detector>, DetectError> {
        self(model, input_size)
    }
}

/// Load the detector named by `[ai]`. `None` when the overlay is disabled.
pub fn load_detector(ai: &AiConfig, loader: Option<&dyn DetectorLoader>) -> Result<Option<Box<dyn Detector>>> {
    if !ai.enabled {
        return Ok(None);
    }
    if !ai.model_path.is_file() {
        return Err(BackendError::ModelNotFound(ai.model_path.clone()));
    }
    let Some(loader) = loader else {
        return Err(BackendError::NoDetector(ai.model_path.clone()));
    };
    let detector = loader.load(&ai.model_path, (ai.input_width, ai.input_height))?;
    log::info!(
        "[AI] Loaded {} ({}x{} input)",
        ai.model_path.display(),
        ai.input_width,
        ai.input_height
    );
    Ok(Some(detector))
}

/// Load the detector, then open the capture device and the video encoder.
/// Any failure here is fatal.
pub fn open_hardware(config: &Config, loader: Option<&dyn DetectorLoader>) -> Result<FrameHardware> {
    let detector = load_detector(&config.ai, loader)?;

    let video = &config.video;
    let capture = V4l2Capture::open(
        &video.device,
        video.width,
        video.height,
        video.fps,
        video.capture_buffers,
    )?;

    let encoder = GstH264Encoder::new(&EncoderConfig {
        width: video.width,
        height: video.height,
        fps: video.fps,
        bitrate_kbps: config.encoder.bitrate_kbps,
        keyframe_interval: config.encoder.keyframe_interval,
        element: config.encoder.element.clone(),
        ..EncoderConfig::default()
    })?;

    Ok(FrameHardware {
        capture: Box::new(capture),
        converter: Box::new(SoftwareConverter::new()),
        encoder: Box::new(encoder),
        detector,
    })
}

/// Per-run factories for the transport and the audio stages
pub fn services(config: &Config) -> Services {
    let transport: Option<Arc<dyn TransportFactory>> = config.stream.enabled.then(|| {
        let factory: Arc<dyn TransportFactory> = match config.stream.protocol {
            TransportProtocol::Srt => {
                let latency = config.stream.latency_ms;
                Arc::new(move || -> Box<dyn Transport> { Box::new(SrtTransport::new(latency)) })
            }
            TransportProtocol::Udp => {
                Arc::new(|| -> Box<dyn Transport> { Box::new(UdpTransport::new()) })
            }
        };
        factory
    });

    let audio: Option<Arc<dyn AudioFactory>> = config.audio.enabled.then(|| {
        let device = config.audio.device.clone();
        let rate = config.audio.sample_rate;
        let channels = config.audio.channels;
        let factory: Arc<dyn AudioFactory> = Arc::new(move || -> std::result::Result<AudioStages, AudioError> {
            let source = CpalAudioSource::open(&device, rate, channels)?;
            let encoder = GstAacEncoder::new(rate, channels, AAC_BITRATE)?;
            Ok(AudioStages {
                source: Box::new(source),
                encoder: Box::new(encoder),
            })
        });
        factory
    });

    Services { transport, audio }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_follow_enabled_outputs() {
        let mut config = Config::default();
        config.stream.enabled = false;
        config.audio.enabled = false;
        let none = services(&config);
        assert!(none.transport.is_none());
        assert!(none.audio.is_none());

        config.stream.enabled = true;
        config.stream.protocol = TransportProtocol::Udp;
        config.audio.enabled = true;
        let both = services(&config);
        assert!(both.transport.is_some());
        assert!(both.audio.is_some());
    }

    struct Square(u32);

    impl Detector for Square {
        fn input_size(&self) -> (u32, u32) {
            (self.0, self.0)
        }

        fn detect(&mut self, _rgb: &[u8]) -> std::result::Result<Vec<crate::devices::Detection>, DetectError> {
            Ok(Vec::new())
        }
    }

    fn ai_config(model_path: PathBuf) -> AiConfig {
        AiConfig {
            enabled: true,
            model_path,
            input_width: 320,
            input_height: 320,
        }
    }

    #[test]
    fn disabled_overlay_loads_nothing() {
        let ai = AiConfig::default();
        assert!(load_detector(&ai, None).unwrap().is_none());
    }

    #[test]
    fn missing_model_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ai = ai_config(dir.path().join("absent.rknn"));
        assert!(matches!(open_hardware(&config, None), Err(BackendError::ModelNotFound(_))));
    }

    #[test]
    fn model_without_loader_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("yolo.rknn");
        std::fs::write(&model, b"weights").unwrap();
        let result = load_detector(&ai_config(model.clone()), None);
        assert!(matches!(result, Err(BackendError::NoDetector(path)) if path == model));
    }

    #[test]
    fn loader_receives_model_path_and_input_size() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("yolo.rknn");
        std::fs::write(&model, b"weights").unwrap();

        let seen = std::cell::RefCell::new(None);
        let loader = |path: &Path, size: (u32, u32)| -> std::result::Result<Box<dyn Detector>, DetectError> {
            *seen.borrow_mut() = Some((path.to_path_buf(), size));
            Ok(Box::new(Square(size.0)))
        };
        let detector = load_detector(&ai_config(model.clone()), Some(&loader)).unwrap().unwrap();
        assert_eq!(detector.input_size(), (320, 320));
        assert_eq!(seen.into_inner(), Some((model, (320, 320))));

        let failing = |_: &Path, _: (u32, u32)| -> std::result::Result<Box<dyn Detector>, DetectError> {
            Err(DetectError::Model("bad header".into()))
        };
        let dir_model = ai_config(dir.path().join("yolo.rknn"));
        assert!(matches!(load_detector(&dir_model, Some(&failing)), Err(BackendError::Detector(_))));
    }
}
