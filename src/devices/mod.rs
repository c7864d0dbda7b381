// Capture, conversion and detection collaborators
//
// The frame loop only sees these traits. Buffers cross the boundary either as
// kernel DMA handles (hardware paths) or as CPU slices (software paths).

pub mod convert;
pub mod v4l2;

use std::time::Duration;

use gstreamer as gst;
use gstreamer_video as gst_video;

pub use convert::SoftwareConverter;
pub use v4l2::V4l2Capture;

/// Kernel DMA buffer file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaHandle(pub i32);

/// Pixel layouts moved through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Planar Y followed by interleaved UV at quarter resolution
    Nv12,
    /// Packed 8-bit R G B
    Rgb24,
}

impl PixelFormat {
    /// Bytes needed for one `width` x `height` image
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Nv12 => pixels + pixels / 2,
            PixelFormat::Rgb24 => pixels * 3,
        }
    }

    /// Matching GStreamer raw video format
    pub fn video_format(&self) -> gst_video::VideoFormat {
        match self {
            PixelFormat::Yuyv => gst_video::VideoFormat::Yuy2,
            PixelFormat::Nv12 => gst_video::VideoFormat::Nv12,
            PixelFormat::Rgb24 => gst_video::VideoFormat::Rgb,
        }
    }
}

/// Geometry plus pixel layout of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub width: u32,
    pub height: u32,
    pub pixel: PixelFormat,
}

impl ImageFormat {
    pub const fn new(width: u32, height: u32, pixel: PixelFormat) -> Self {
        Self { width, height, pixel }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel.frame_size(self.width, self.height)
    }

    /// Raw video caps for this image at `fps` frames per second
    pub fn video_caps(&self, fps: u32) -> Result<gst::Caps, gst::glib::BoolError> {
        gst_video::VideoInfo::builder(self.pixel.video_format(), self.width, self.height)
            .fps(gst::Fraction::new(fps as i32, 1))
            .build()?
            .to_caps()
    }

    /// GStreamer layout (plane offsets and padded strides) of this image
    pub fn video_info(&self) -> Result<gst_video::VideoInfo, gst::glib::BoolError> {
        gst_video::VideoInfo::builder(self.pixel.video_format(), self.width, self.height).build()
    }
}

/// Read side of a conversion
#[derive(Debug, Clone, Copy)]
pub enum Surface<'a> {
    Dma(DmaHandle),
    Cpu(&'a [u8]),
}

/// Write side of a conversion
#[derive(Debug)]
pub enum SurfaceMut<'a> {
    Dma(DmaHandle),
    Cpu(&'a mut [u8]),
}

impl SurfaceMut<'_> {
    pub fn reborrow(&mut self) -> SurfaceMut<'_> {
        match self {
            SurfaceMut::Dma(handle) => SurfaceMut::Dma(*handle),
            SurfaceMut::Cpu(bytes) => SurfaceMut::Cpu(&mut **bytes),
        }
    }
}

/// Error type for capture devices
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture device not found: {0}")]
    NotFound(String),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Capture device is not streaming")]
    NotStreaming,

    #[error("Every capture buffer is held by the application")]
    Exhausted,

    #[error("Invalid buffer index {0}")]
    InvalidIndex(usize),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

/// Error type for color/format conversion
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Unsupported conversion: {0}")]
    Unsupported(String),

    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Conversion pipeline error: {0}")]
    Pipeline(String),
}

/// Error type for detectors
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Model load failed: {0}")]
    Model(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Input must be {expected} bytes, got {actual}")]
    InputSize { expected: usize, actual: usize },
}

/// Fixed pool of driver buffers with acquire/return semantics.
///
/// A buffer index returned by `wait_frame` belongs to the application until
/// it is passed to `release`; the driver never writes it in between.
pub trait CaptureDevice: Send {
    /// Format delivered by every buffer
    fn format(&self) -> ImageFormat;

    /// Number of buffers negotiated with the driver
    fn buffer_count(&self) -> usize;

    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self);

    /// Block until a filled buffer is available, returning its index
    fn wait_frame(&mut self, timeout: Duration) -> Result<usize, CaptureError>;

    /// Readable view of an application-owned buffer
    fn buffer(&self, index: usize) -> Result<Surface<'_>, CaptureError>;

    /// Hand a buffer back to the driver
    fn release(&mut self, index: usize) -> Result<(), CaptureError>;
}

/// Synchronous pixel-format and scale conversion
pub trait FrameConverter: Send {
    fn convert(
        &mut self,
        src: Surface<'_>,
        src_format: ImageFormat,
        dst: SurfaceMut<'_>,
        dst_format: ImageFormat,
    ) -> Result<(), ConvertError>;
}

/// Axis-aligned box in detector input coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Object detector fed with packed RGB at a fixed resolution
pub trait Detector: Send {
    /// Resolution the model expects; pixel format is always RGB24
    fn input_size(&self) -> (u32, u32);

    fn detect(&mut self, rgb: &[u8]) -> Result<Vec<Detection>, DetectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_follow_layout() {
        assert_eq!(PixelFormat::Yuyv.frame_size(4, 2), 16);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), 12);
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), 24);
        assert_eq!(ImageFormat::new(1280, 720, PixelFormat::Nv12).frame_size(), 1_382_400);
    }

    #[test]
    fn pixel_formats_map_to_raw_video_formats() {
        assert_eq!(PixelFormat::Yuyv.video_format(), gst_video::VideoFormat::Yuy2);
        assert_eq!(PixelFormat::Nv12.video_format(), gst_video::VideoFormat::Nv12);
        assert_eq!(PixelFormat::Rgb24.video_format(), gst_video::VideoFormat::Rgb);
    }

    #[test]
    fn video_info_pads_rows_to_four_bytes() {
        crate::gstreamer_init::init_gstreamer().unwrap();
        let info = ImageFormat::new(6, 2, PixelFormat::Rgb24).video_info().unwrap();
        assert_eq!(info.stride()[0], 20);
        let info = ImageFormat::new(8, 4, PixelFormat::Nv12).video_info().unwrap();
        assert_eq!(info.offset()[1], 32);
    }
}
