// Color conversion and scaling on CPU buffers through GStreamer
//
// appsrc -> videoconvert -> videoscale -> capsfilter -> appsink, one pipeline
// per (source, destination) format pair, built on first use and driven
// synchronously. Fallback for boards without a 2D accelerator.

use std::collections::HashMap;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{ConvertError, FrameConverter, ImageFormat, PixelFormat, Surface, SurfaceMut};

/// How long one conversion may wait for its output
const CONVERT_TIMEOUT: Duration = Duration::from_secs(1);

/// Converter operating on CPU-visible buffers only
#[derive(Default)]
pub struct SoftwareConverter {
    conversions: HashMap<(ImageFormat, ImageFormat), Conversion>,
}

impl SoftwareConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversion(&mut self, src: ImageFormat, dst: ImageFormat) -> Result<&mut Conversion, ConvertError> {
        use std::collections::hash_map::Entry;
        match self.conversions.entry((src, dst)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(Conversion::new(src, dst)?)),
        }
    }
}

impl FrameConverter for SoftwareConverter {
    fn convert(
        &mut self,
        src: Surface<'_>,
        src_format: ImageFormat,
        dst: SurfaceMut<'_>,
        dst_format: ImageFormat,
    ) -> Result<(), ConvertError> {
        let (src, dst) = match (src, dst) {
            (Surface::Cpu(src), SurfaceMut::Cpu(dst)) => (src, dst),
            _ => {
                return Err(ConvertError::Unsupported(
                    "DMA handles need a hardware converter".into(),
                ))
            }
        };

        check_len(src.len(), src_format)?;
        check_len(dst.len(), dst_format)?;
        for format in [src_format, dst_format] {
            if format.width == 0 || format.height == 0 {
                return Err(ConvertError::Unsupported("empty image".into()));
            }
        }

        self.conversion(src_format, dst_format)?.run(src, dst)
    }
}

fn check_len(actual: usize, format: ImageFormat) -> Result<(), ConvertError> {
    let needed = format.frame_size();
    if actual < needed {
        return Err(ConvertError::BufferTooSmall { needed, actual });
    }
    Ok(())
}

/// One running conversion pipeline
struct Conversion {
    src_format: ImageFormat,
    dst_format: ImageFormat,
    src_info: gst_video::VideoInfo,
    dst_info: gst_video::VideoInfo,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    frames: u64,
}

impl Conversion {
    fn new(src_format: ImageFormat, dst_format: ImageFormat) -> Result<Self, ConvertError> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| ConvertError::Pipeline(format!("GStreamer init failed: {}", e)))?;

        let src_info = src_format
            .video_info()
            .map_err(|e| ConvertError::Pipeline(format!("Invalid source format: {}", e)))?;
        let dst_info = dst_format
            .video_info()
            .map_err(|e| ConvertError::Pipeline(format!("Invalid output format: {}", e)))?;
        let src_caps = src_info
            .to_caps()
            .map_err(|e| ConvertError::Pipeline(format!("Invalid source caps: {}", e)))?;
        let dst_caps = dst_info
            .to_caps()
            .map_err(|e| ConvertError::Pipeline(format!("Invalid output caps: {}", e)))?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("convert_src")
            .caps(&src_caps)
            .format(gst::Format::Time)
            .build();

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| ConvertError::Pipeline(format!("Failed to create videoconvert: {}", e)))?;
        // Stretch to the requested size instead of letterboxing
        let videoscale = gst::ElementFactory::make("videoscale")
            .property("add-borders", false)
            .build()
            .map_err(|e| ConvertError::Pipeline(format!("Failed to create videoscale: {}", e)))?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &dst_caps)
            .build()
            .map_err(|e| ConvertError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;
        let appsink = gst_app::AppSink::builder()
            .name("convert_sink")
            .sync(false)
            .build();

        let elements = [appsrc.upcast_ref(), &videoconvert, &videoscale, &capsfilter, appsink.upcast_ref()];
        pipeline
            .add_many(elements)
            .map_err(|e| ConvertError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| ConvertError::Pipeline(format!("Failed to link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ConvertError::Pipeline(format!("Failed to start converter: {:?}", e)))?;

        log::debug!(
            "[Convert] {}x{} {:?} -> {}x{} {:?}",
            src_format.width,
            src_format.height,
            src_format.pixel,
            dst_format.width,
            dst_format.height,
            dst_format.pixel
        );

        Ok(Self {
            src_format,
            dst_format,
            src_info,
            dst_info,
            pipeline,
            appsrc,
            appsink,
            frames: 0,
        })
    }

    fn run(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(), ConvertError> {
        let mut buffer = gst::Buffer::with_size(self.src_info.size())
            .map_err(|e| ConvertError::Pipeline(format!("Failed to allocate buffer: {}", e)))?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| ConvertError::Pipeline("Buffer is not writable".into()))?;
            buffer_ref.set_pts(gst::ClockTime::from_mseconds(self.frames));
            let mut map = buffer_ref
                .map_writable()
                .map_err(|e| ConvertError::Pipeline(format!("Failed to map buffer: {}", e)))?;
            for (plane, tight, padded) in plane_rows(self.src_format, &self.src_info) {
                padded_plane_mut(map.as_mut_slice(), padded)?.copy_from_tight(src, tight, plane);
            }
        }
        self.frames += 1;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| ConvertError::Pipeline(format!("Failed to push buffer: {:?}", e)))?;

        let timeout = gst::ClockTime::from_nseconds(CONVERT_TIMEOUT.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            return Err(ConvertError::Pipeline(
                self.bus_error().unwrap_or_else(|| "conversion produced no frame".into()),
            ));
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| ConvertError::Pipeline("Sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| ConvertError::Pipeline(format!("Failed to map output: {}", e)))?;

        for (plane, tight, padded) in plane_rows(self.dst_format, &self.dst_info) {
            let out = map.as_slice();
            let needed = padded.offset + padded.stride * (plane.rows.max(1) - 1) + plane.row_bytes;
            if out.len() < needed {
                return Err(ConvertError::BufferTooSmall { needed, actual: out.len() });
            }
            for row in 0..plane.rows {
                let from = padded.offset + row * padded.stride;
                let to = tight + row * plane.row_bytes;
                dst[to..to + plane.row_bytes].copy_from_slice(&out[from..from + plane.row_bytes]);
            }
        }
        Ok(())
    }

    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
            _ => None,
        }
    }
}

impl Drop for Conversion {
    fn drop(&mut self) {
        if let Err(e) = self.appsrc.end_of_stream() {
            log::debug!("[Convert] EOS send failed: {:?}", e);
        }
        self.pipeline.set_state(gst::State::Null).ok();
    }
}

/// Geometry of one plane in the tightly packed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneRows {
    row_bytes: usize,
    rows: usize,
}

/// Placement of one plane inside a GStreamer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PaddedPlane {
    offset: usize,
    stride: usize,
}

/// Planes of `format`: packed geometry, offset in the packed buffer and
/// placement in the GStreamer layout described by `info`
fn plane_rows(format: ImageFormat, info: &gst_video::VideoInfo) -> Vec<(PlaneRows, usize, PaddedPlane)> {
    let (w, h) = (format.width as usize, format.height as usize);
    let planes = match format.pixel {
        PixelFormat::Yuyv => vec![PlaneRows { row_bytes: w * 2, rows: h }],
        PixelFormat::Nv12 => vec![
            PlaneRows { row_bytes: w, rows: h },
            PlaneRows { row_bytes: w, rows: h / 2 },
        ],
        PixelFormat::Rgb24 => vec![PlaneRows { row_bytes: w * 3, rows: h }],
    };

    let mut tight = 0;
    planes
        .into_iter()
        .enumerate()
        .map(|(i, plane)| {
            let padded = PaddedPlane {
                offset: info.offset()[i],
                stride: info.stride()[i] as usize,
            };
            let entry = (plane, tight, padded);
            tight += plane.row_bytes * plane.rows;
            entry
        })
        .collect()
}

struct PaddedPlaneMut<'a> {
    data: &'a mut [u8],
    stride: usize,
}

impl PaddedPlaneMut<'_> {
    fn copy_from_tight(&mut self, src: &[u8], tight: usize, plane: PlaneRows) {
        for row in 0..plane.rows {
            let from = tight + row * plane.row_bytes;
            let to = row * self.stride;
            self.data[to..to + plane.row_bytes].copy_from_slice(&src[from..from + plane.row_bytes]);
        }
    }
}

fn padded_plane_mut(buffer: &mut [u8], padded: PaddedPlane) -> Result<PaddedPlaneMut<'_>, ConvertError> {
    let actual = buffer.len();
    let data = buffer
        .get_mut(padded.offset..)
        .ok_or(ConvertError::BufferTooSmall { needed: padded.offset, actual })?;
    Ok(PaddedPlaneMut { data, stride: padded.stride })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter_available() -> bool {
        let available = crate::gstreamer_init::elements_available(&[
            "appsrc",
            "videoconvert",
            "videoscale",
            "capsfilter",
            "appsink",
        ]);
        if !available {
            eprintln!("videoconvert not installed, skipping");
        }
        available
    }

    fn yuyv_frame(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let mut frame = Vec::new();
        for _ in 0..(width * height / 2) {
            frame.extend_from_slice(&[y, u, y, v]);
        }
        frame
    }

    fn close_to(actual: u8, expected: u8) -> bool {
        actual.abs_diff(expected) <= 1
    }

    #[test]
    fn yuyv_to_nv12_keeps_samples() {
        if !converter_available() {
            return;
        }
        let src_fmt = ImageFormat::new(8, 4, PixelFormat::Yuyv);
        let dst_fmt = ImageFormat::new(8, 4, PixelFormat::Nv12);
        let src = yuyv_frame(8, 4, 100, 90, 160);
        let mut dst = vec![0u8; dst_fmt.frame_size()];

        SoftwareConverter::new()
            .convert(Surface::Cpu(&src), src_fmt, SurfaceMut::Cpu(&mut dst), dst_fmt)
            .unwrap();

        let (luma, chroma) = dst.split_at(32);
        assert!(luma.iter().all(|&y| close_to(y, 100)), "luma {:?}", luma);
        for uv in chroma.chunks(2) {
            assert!(close_to(uv[0], 90) && close_to(uv[1], 160), "chroma {:?}", chroma);
        }
    }

    #[test]
    fn white_yuv_becomes_white_rgb() {
        if !converter_available() {
            return;
        }
        let src_fmt = ImageFormat::new(8, 4, PixelFormat::Yuyv);
        let dst_fmt = ImageFormat::new(8, 4, PixelFormat::Rgb24);
        let src = yuyv_frame(8, 4, 235, 128, 128);
        let mut dst = vec![0u8; dst_fmt.frame_size()];

        SoftwareConverter::new()
            .convert(Surface::Cpu(&src), src_fmt, SurfaceMut::Cpu(&mut dst), dst_fmt)
            .unwrap();

        assert!(dst.iter().all(|&c| c >= 254), "rgb {:?}", &dst[..12]);
    }

    #[test]
    fn scaling_fills_the_requested_geometry() {
        if !converter_available() {
            return;
        }
        // Width 6 makes the RGB row stride (18) differ from the padded one (20)
        let src_fmt = ImageFormat::new(12, 6, PixelFormat::Rgb24);
        let dst_fmt = ImageFormat::new(6, 3, PixelFormat::Rgb24);
        let src: Vec<u8> = std::iter::repeat([200u8, 40, 10]).take(72).flatten().collect();
        let mut dst = vec![0u8; dst_fmt.frame_size()];

        let mut converter = SoftwareConverter::new();
        for _ in 0..2 {
            dst.fill(0);
            converter
                .convert(Surface::Cpu(&src), src_fmt, SurfaceMut::Cpu(&mut dst), dst_fmt)
                .unwrap();
            for px in dst.chunks(3) {
                assert!(close_to(px[0], 200) && close_to(px[1], 40) && close_to(px[2], 10), "{:?}", px);
            }
        }
        assert_eq!(converter.conversions.len(), 1);
    }

    #[test]
    fn dma_handles_are_rejected() {
        let fmt = ImageFormat::new(2, 2, PixelFormat::Nv12);
        let mut dst = vec![0u8; fmt.frame_size()];
        let result = SoftwareConverter::new().convert(
            Surface::Dma(super::super::DmaHandle(3)),
            fmt,
            SurfaceMut::Cpu(&mut dst),
            fmt,
        );
        assert!(matches!(result, Err(ConvertError::Unsupported(_))));
    }

    #[test]
    fn short_destination_is_an_error() {
        let src_fmt = ImageFormat::new(4, 2, PixelFormat::Yuyv);
        let dst_fmt = ImageFormat::new(4, 2, PixelFormat::Rgb24);
        let src = yuyv_frame(4, 2, 16, 128, 128);
        let mut dst = vec![0u8; 5];
        let result = SoftwareConverter::new().convert(
            Surface::Cpu(&src),
            src_fmt,
            SurfaceMut::Cpu(&mut dst),
            dst_fmt,
        );
        assert!(matches!(result, Err(ConvertError::BufferTooSmall { needed: 24, actual: 5 })));
    }
}
