// Configuration management for Edgecast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::queue::DEFAULT_QUEUE_CAPACITY;

/// Error type for configuration handling
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub stream: StreamConfig,
    pub record: RecordConfig,
    pub ai: AiConfig,
    pub audio: AudioConfig,
    pub encoder: EncoderSettings,

    /// Depth of each packet queue (streaming and recording)
    pub queue_capacity: usize,
}

/// Capture device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// V4L2 device node
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Number of driver buffers negotiated with the capture device
    pub capture_buffers: usize,
    /// How long one frame wait may block before the iteration is skipped
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Srt,
    Udp,
}

/// Live stream output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub protocol: TransportProtocol,
    pub host: String,
    pub port: u16,
    /// SRT stream id, forwarded as-is to the receiver
    pub stream_id: String,
    pub latency_ms: u32,
}

/// Local segmented recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub enabled: bool,
    /// Root folder; segments land in `<root>/<YYYYMMDD>/<HHMMSS>.ts`
    pub root: PathBuf,
    pub segment_secs: u64,
}

/// Object detection overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Initial state of the overlay; can be toggled at runtime
    pub enabled: bool,
    pub model_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// cpal input device name; empty selects the host default
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// H.264 encoder tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// GStreamer element name; empty picks the best available one
    pub element: String,
    pub bitrate_kbps: u32,
    /// Frames between IDR pictures
    pub keyframe_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            stream: StreamConfig::default(),
            record: RecordConfig::default(),
            ai: AiConfig::default(),
            audio: AudioConfig::default(),
            encoder: EncoderSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            fps: 30,
            capture_buffers: 4,
            capture_timeout_ms: 2000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: TransportProtocol::Srt,
            host: "127.0.0.1".into(),
            port: 8890,
            stream_id: "publish:live/stream".into(),
            latency_ms: 200,
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("video"),
            segment_secs: 300,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: PathBuf::from("model/yolov5s-640-640.rknn"),
            input_width: 640,
            input_height: 640,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: String::new(),
            sample_rate: 44100,
            channels: 2,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            element: String::new(),
            bitrate_kbps: 2048,
            keyframe_interval: 60,
        }
    }
}

impl Config {
    /// Load and validate config from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::info!("[Config] No config at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[Config] {} ({}), using defaults", e, path.display());
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let v = &self.video;
        if v.width == 0 || v.height == 0 {
            return Err(ConfigError::Invalid(format!("video size {}x{}", v.width, v.height)));
        }
        // NV12 and YUYV both need even dimensions
        if v.width % 2 != 0 || v.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "video size {}x{} must be even",
                v.width, v.height
            )));
        }
        if v.fps == 0 {
            return Err(ConfigError::Invalid("fps must be positive".into()));
        }
        if v.capture_buffers == 0 {
            return Err(ConfigError::Invalid("capture_buffers must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.stream.enabled && self.stream.host.is_empty() {
            return Err(ConfigError::Invalid("stream host is empty".into()));
        }
        if self.record.enabled && self.record.segment_secs == 0 {
            return Err(ConfigError::Invalid("segment_secs must be positive".into()));
        }
        if self.ai.input_width == 0 || self.ai.input_height == 0 {
            return Err(ConfigError::Invalid("ai input size must be positive".into()));
        }
        if self.audio.enabled && (self.audio.sample_rate == 0 || self.audio.channels == 0) {
            return Err(ConfigError::Invalid("audio rate and channels must be positive".into()));
        }
        Ok(())
    }

    pub fn segment_duration_ms(&self) -> u64 {
        self.record.segment_secs.saturating_mul(1000)
    }
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edgecast")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [video]
            width = 1920
            height = 1080

            [stream]
            protocol = "udp"
            "#,
        )
        .unwrap();

        assert_eq!(config.video.width, 1920);
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.stream.protocol, TransportProtocol::Udp);
        assert_eq!(config.stream.latency_ms, 200);
        assert_eq!(config.queue_capacity, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.record.segment_secs = 60;
        config.ai.enabled = true;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let mut config = Config::default();
        config.video.width = 641;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "queue_capacity = \"lots\"").unwrap();
        assert_eq!(Config::load_or_default(&path), Config::default());
    }
}
