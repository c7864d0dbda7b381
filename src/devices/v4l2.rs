// V4L2 camera capture through GStreamer
//
// v4l2src -> capsfilter(YUY2) -> appsink. Each pulled sample is parked in one
// of a fixed set of slots until the frame loop releases it, which returns the
// underlying buffer to the source's pool.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{CaptureDevice, CaptureError, ImageFormat, PixelFormat, Surface};

type Slot = Option<gst::MappedBuffer<gst::buffer::Readable>>;

/// Camera opened on a V4L2 device node
pub struct V4l2Capture {
    device: String,
    format: ImageFormat,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    slots: Vec<Slot>,
    streaming: bool,
}

impl V4l2Capture {
    /// Build the capture pipeline for `device` without starting it
    pub fn open(
        device: &str,
        width: u32,
        height: u32,
        fps: u32,
        buffer_count: usize,
    ) -> Result<Self, CaptureError> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| CaptureError::Pipeline(format!("GStreamer init failed: {}", e)))?;

        if !std::path::Path::new(device).exists() {
            return Err(CaptureError::NotFound(device.to_string()));
        }

        let format = ImageFormat::new(width, height, PixelFormat::Yuyv);
        let buffer_count = buffer_count.max(1);
        let pipeline = gst::Pipeline::new();

        let source = gst::ElementFactory::make("v4l2src")
            .property("device", device)
            .build()
            .map_err(|e| CaptureError::Pipeline(format!("Failed to create v4l2src: {}", e)))?;

        let caps = format
            .video_caps(fps)
            .map_err(|e| CaptureError::Pipeline(format!("Invalid capture format: {}", e)))?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| CaptureError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;

        let appsink = gst_app::AppSink::builder()
            .name("capture")
            .max_buffers(buffer_count as u32)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([&source, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| CaptureError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([&source, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| CaptureError::Pipeline(format!("Failed to link pipeline: {}", e)))?;

        log::info!(
            "[V4L2] Opened {} ({}x{} YUYV @ {} fps, {} buffers)",
            device,
            width,
            height,
            fps,
            buffer_count
        );

        Ok(Self {
            device: device.to_string(),
            format,
            pipeline,
            appsink,
            slots: (0..buffer_count).map(|_| None).collect(),
            streaming: false,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn check_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(CaptureError::Pipeline(format!(
                    "{} ({:?})",
                    err.error(),
                    err.debug()
                )));
            }
        }
        Ok(())
    }
}

impl CaptureDevice for V4l2Capture {
    fn format(&self) -> ImageFormat {
        self.format
    }

    fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.streaming {
            return Ok(());
        }
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CaptureError::Pipeline(format!("Failed to start {}: {:?}", self.device, e)))?;
        self.streaming = true;
        log::info!("[V4L2] Streaming from {}", self.device);
        Ok(())
    }

    fn stop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
        if self.streaming {
            self.pipeline.set_state(gst::State::Null).ok();
            self.streaming = false;
            log::info!("[V4L2] Stopped {}", self.device);
        }
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<usize, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(CaptureError::Exhausted)?;

        let timeout = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            self.check_bus()?;
            return Err(CaptureError::Timeout);
        };

        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| CaptureError::Pipeline("Sample without buffer".into()))?;
        let mapped = buffer
            .into_mapped_buffer_readable()
            .map_err(|_| CaptureError::Pipeline("Failed to map capture buffer".into()))?;

        self.slots[index] = Some(mapped);
        Ok(index)
    }

    fn buffer(&self, index: usize) -> Result<Surface<'_>, CaptureError> {
        match self.slots.get(index) {
            Some(Some(mapped)) => Ok(Surface::Cpu(mapped.as_slice())),
            _ => Err(CaptureError::InvalidIndex(index)),
        }
    }

    fn release(&mut self, index: usize) -> Result<(), CaptureError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(CaptureError::InvalidIndex(index))?;
        // Dropping the mapping returns the buffer to v4l2src's pool
        match slot.take() {
            Some(_) => Ok(()),
            None => Err(CaptureError::InvalidIndex(index)),
        }
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        self.stop();
        self.pipeline.set_state(gst::State::Null).ok();
    }
}
