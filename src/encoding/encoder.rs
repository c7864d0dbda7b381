//! GStreamer H.264 encoder
//!
//! `appsrc (NV12) -> encoder -> h264parse -> appsink`, driven synchronously:
//! every `encode()` pushes the shared input frame and pulls one Annex-B
//! access unit back out.
//!
//! h264parse re-sends SPS/PPS before each IDR so any keyframe can start a
//! recording segment or a late-joining stream receiver.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{select_h264_encoder, EncodedUnit, EncoderError, H264EncoderKind, Result, VideoEncoder};
use crate::devices::{ImageFormat, PixelFormat, SurfaceMut};

/// Configuration for video encoding
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in kbit/s (0 = encoder default)
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames (0 = encoder default)
    pub keyframe_interval: u32,
    /// Element name; empty picks the best installed encoder
    pub element: String,
    /// How long one encode may wait for its output
    pub output_timeout: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2048,
            keyframe_interval: 60,
            element: String::new(),
            output_timeout: Duration::from_millis(500),
        }
    }
}

/// Synchronous H.264 encoder over a GStreamer pipeline
pub struct GstH264Encoder {
    format: ImageFormat,
    frame_duration: gst::ClockTime,
    output_timeout: Duration,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    input: Vec<u8>,
    output: Vec<u8>,
    frames_in: u64,
}

impl GstH264Encoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| EncoderError::Gst(format!("GStreamer init failed: {}", e)))?;

        let kind = select_h264_encoder(&config.element, crate::gstreamer_init::has_element)?;
        let format = ImageFormat::new(config.width, config.height, PixelFormat::Nv12);
        let (pipeline, appsrc, appsink) = Self::create_pipeline(config, kind)?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to start encoder: {:?}", e)))?;

        log::info!(
            "[Encoder] Using {} ({}) for {}x{} @ {} fps, {} kbps",
            kind.display_name(),
            kind.element_name(),
            config.width,
            config.height,
            config.fps,
            config.bitrate_kbps
        );

        Ok(Self {
            format,
            frame_duration: gst::ClockTime::from_nseconds(1_000_000_000 / config.fps.max(1) as u64),
            output_timeout: config.output_timeout,
            pipeline,
            appsrc,
            appsink,
            input: vec![0u8; format.frame_size()],
            output: Vec::new(),
            frames_in: 0,
        })
    }

    fn create_pipeline(
        config: &EncoderConfig,
        kind: H264EncoderKind,
    ) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink)> {
        let pipeline = gst::Pipeline::new();

        let caps = ImageFormat::new(config.width, config.height, PixelFormat::Nv12)
            .video_caps(config.fps)
            .map_err(|e| EncoderError::Pipeline(format!("Invalid input format: {}", e)))?;

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();

        let encoder = Self::create_encoder(kind, config)?;

        let parser = gst::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to create h264parse: {}", e)))?;

        let out_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("enc_sink")
            .caps(&out_caps)
            .sync(false)
            .build();

        pipeline
            .add_many([appsrc.upcast_ref(), &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to link elements: {}", e)))?;

        Ok((pipeline, appsrc, appsink))
    }

    /// Create the encoder element with rate control and GOP settings
    fn create_encoder(kind: H264EncoderKind, config: &EncoderConfig) -> Result<gst::Element> {
        let name = kind.element_name();
        let encoder = gst::ElementFactory::make(name)
            .build()
            .map_err(|e| EncoderError::NotAvailable(format!("Failed to create {}: {}", name, e)))?;

        let kbps = config.bitrate_kbps;
        let gop = config.keyframe_interval;

        match kind {
            H264EncoderKind::Mpp => {
                // MPP takes bits per second
                if kbps > 0 {
                    encoder.set_property_from_str("bps", &(kbps as u64 * 1000).to_string());
                }
                if gop > 0 {
                    encoder.set_property_from_str("gop", &gop.to_string());
                }
            }
            H264EncoderKind::V4l2 => {
                let mut controls = String::from("controls");
                if kbps > 0 {
                    controls.push_str(&format!(",video_bitrate={}", kbps as u64 * 1000));
                }
                if gop > 0 {
                    controls.push_str(&format!(",h264_i_frame_period={}", gop));
                }
                encoder.set_property_from_str("extra-controls", &controls);
            }
            H264EncoderKind::Va | H264EncoderKind::X264 => {
                if kbps > 0 {
                    encoder.set_property_from_str("bitrate", &kbps.to_string());
                }
                if gop > 0 {
                    encoder.set_property_from_str("key-int-max", &gop.to_string());
                }
                if kind == H264EncoderKind::X264 {
                    encoder.set_property_from_str("tune", "zerolatency");
                    encoder.set_property_from_str("speed-preset", "ultrafast");
                }
            }
            H264EncoderKind::VaApi => {
                if kbps > 0 {
                    encoder.set_property_from_str("bitrate", &kbps.to_string());
                }
                if gop > 0 {
                    encoder.set_property_from_str("keyframe-period", &gop.to_string());
                }
            }
            H264EncoderKind::Nvenc => {
                if kbps > 0 {
                    encoder.set_property_from_str("bitrate", &kbps.to_string());
                }
                if gop > 0 {
                    encoder.set_property_from_str("gop-size", &gop.to_string());
                }
                encoder.set_property_from_str("zerolatency", "true");
            }
        }

        Ok(encoder)
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

impl VideoEncoder for GstH264Encoder {
    fn input_format(&self) -> ImageFormat {
        self.format
    }

    fn input_surface(&mut self) -> SurfaceMut<'_> {
        SurfaceMut::Cpu(&mut self.input)
    }

    fn encode(&mut self) -> Result<EncodedUnit<'_>> {
        let mut buffer = gst::Buffer::with_size(self.input.len())
            .map_err(|e| EncoderError::Gst(format!("Failed to allocate buffer: {}", e)))?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| EncoderError::Gst("Buffer is not writable".into()))?;
            buffer_ref.set_pts(self.frame_duration * self.frames_in);
            buffer_ref.set_duration(self.frame_duration);
            let mut map = buffer_ref
                .map_writable()
                .map_err(|e| EncoderError::Gst(format!("Failed to map buffer: {}", e)))?;
            map.copy_from_slice(&self.input);
        }
        self.frames_in += 1;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to push buffer: {:?}", e)))?;

        let timeout = gst::ClockTime::from_nseconds(self.output_timeout.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if let Some(err) = self.bus_error() {
                return Err(EncoderError::Pipeline(err));
            }
            return Err(EncoderError::NoOutput(self.output_timeout.as_millis() as u64));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| EncoderError::Gst("Sample without buffer".into()))?;
        let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
        let map = buffer
            .map_readable()
            .map_err(|e| EncoderError::Gst(format!("Failed to map output: {}", e)))?;

        self.output.clear();
        self.output.extend_from_slice(map.as_slice());

        Ok(EncodedUnit {
            data: &self.output,
            keyframe,
        })
    }
}

impl Drop for GstH264Encoder {
    fn drop(&mut self) {
        if let Err(e) = self.appsrc.end_of_stream() {
            log::debug!("[Encoder] EOS send failed: {:?}", e);
        }
        self.pipeline.set_state(gst::State::Null).ok();
        log::info!("[Encoder] Released after {} frames", self.frames_in);
    }
}
