// Video and audio encoding
//
// The frame loop and the audio worker drive encoders through the traits
// below. GStreamer-backed implementations live in `encoder` (H.264) and
// `aac` (AAC/ADTS).

pub mod aac;
pub mod encoder;

use crate::devices::{ImageFormat, SurfaceMut};

pub use aac::GstAacEncoder;
pub use encoder::GstH264Encoder;

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("Encoder not available: {0}")]
    NotAvailable(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Encoder produced no output within {0} ms")]
    NoOutput(u64),

    #[error("Input must be {expected} samples, got {actual}")]
    InputSize { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// One encoded access unit, borrowed from the encoder until the next call
#[derive(Debug, Clone, Copy)]
pub struct EncodedUnit<'a> {
    pub data: &'a [u8],
    pub keyframe: bool,
}

/// H.264 encoder with a single reusable input frame
pub trait VideoEncoder: Send {
    /// Layout of the input frame (NV12 at the output resolution)
    fn input_format(&self) -> ImageFormat;

    /// The encoder-owned input frame, overwritten by the converter every cycle
    fn input_surface(&mut self) -> SurfaceMut<'_>;

    /// Encode the current input frame into one access unit
    fn encode(&mut self) -> Result<EncodedUnit<'_>>;
}

/// AAC encoder consuming fixed-size interleaved S16 frames
pub trait AudioEncoder {
    /// Samples per channel in one input frame
    fn frame_samples(&self) -> usize;

    /// Encode one frame; returns every ADTS frame that became available
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>>;
}

/// H.264 encoder elements in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264EncoderKind {
    /// Rockchip MPP
    Mpp,
    /// V4L2 stateful M2M (Raspberry Pi, i.MX, ...)
    V4l2,
    /// VA (new plugin)
    Va,
    /// VA-API (legacy plugin)
    VaApi,
    /// NVIDIA NVENC
    Nvenc,
    /// Software fallback
    X264,
}

impl H264EncoderKind {
    pub const ALL: &'static [H264EncoderKind] = &[
        H264EncoderKind::Mpp,
        H264EncoderKind::V4l2,
        H264EncoderKind::Va,
        H264EncoderKind::VaApi,
        H264EncoderKind::Nvenc,
        H264EncoderKind::X264,
    ];

    pub fn element_name(&self) -> &'static str {
        match self {
            H264EncoderKind::Mpp => "mpph264enc",
            H264EncoderKind::V4l2 => "v4l2h264enc",
            H264EncoderKind::Va => "vah264enc",
            H264EncoderKind::VaApi => "vaapih264enc",
            H264EncoderKind::Nvenc => "nvh264enc",
            H264EncoderKind::X264 => "x264enc",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            H264EncoderKind::Mpp => "Rockchip MPP",
            H264EncoderKind::V4l2 => "V4L2 M2M",
            H264EncoderKind::Va => "VA",
            H264EncoderKind::VaApi => "VA-API",
            H264EncoderKind::Nvenc => "NVIDIA NVENC",
            H264EncoderKind::X264 => "Software (x264)",
        }
    }

    pub fn is_hardware(&self) -> bool {
        *self != H264EncoderKind::X264
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.element_name() == name)
    }
}

/// Pick the H.264 encoder element.
///
/// `preferred` names an element explicitly; empty selects the first
/// installed element in preference order. `is_installed` is consulted for
/// each candidate.
pub fn select_h264_encoder(
    preferred: &str,
    is_installed: impl Fn(&str) -> bool,
) -> Result<H264EncoderKind> {
    if !preferred.is_empty() {
        let kind = H264EncoderKind::from_element_name(preferred)
            .ok_or_else(|| EncoderError::NotAvailable(format!("unknown H.264 encoder {}", preferred)))?;
        if !is_installed(preferred) {
            return Err(EncoderError::NotAvailable(format!("{} is not installed", preferred)));
        }
        return Ok(kind);
    }

    H264EncoderKind::ALL
        .iter()
        .copied()
        .find(|kind| is_installed(kind.element_name()))
        .ok_or_else(|| EncoderError::NotAvailable("no H.264 encoder element installed".into()))
}

/// Detect the best installed H.264 encoder
pub fn detect_best_encoder() -> Option<H264EncoderKind> {
    select_h264_encoder("", crate::gstreamer_init::has_element).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_encoders_win_over_software() {
        let installed = ["x264enc", "vaapih264enc"];
        let kind = select_h264_encoder("", |name| installed.contains(&name)).unwrap();
        assert_eq!(kind, H264EncoderKind::VaApi);
        assert!(kind.is_hardware());
    }

    #[test]
    fn explicit_choice_must_be_installed_and_known() {
        let installed = ["x264enc", "mpph264enc"];
        assert_eq!(
            select_h264_encoder("x264enc", |name| installed.contains(&name)).unwrap(),
            H264EncoderKind::X264
        );
        assert!(select_h264_encoder("nvh264enc", |name| installed.contains(&name)).is_err());
        assert!(select_h264_encoder("openh264enc", |_| true).is_err());
    }

    #[test]
    fn nothing_installed_is_an_error() {
        assert!(matches!(
            select_h264_encoder("", |_| false),
            Err(EncoderError::NotAvailable(_))
        ));
    }
}
