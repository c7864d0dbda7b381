// GStreamer AAC encoder producing ADTS frames
//
// appsrc (S16LE interleaved) -> audioconvert -> AAC encoder -> aacparse ->
// appsink (audio/mpeg, stream-format=adts)

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_audio as gst_audio;

use super::{AudioEncoder, EncoderError, Result};

/// Samples per channel in one AAC-LC frame
pub const AAC_FRAME_SAMPLES: usize = 1024;

/// AAC elements in order of preference
const AAC_ELEMENTS: &[&str] = &["avenc_aac", "voaacenc", "fdkaacenc", "faac"];

pub struct GstAacEncoder {
    element: &'static str,
    sample_rate: u32,
    channels: u16,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    samples_in: u64,
}

impl GstAacEncoder {
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| EncoderError::Gst(format!("GStreamer init failed: {}", e)))?;

        let element = AAC_ELEMENTS
            .iter()
            .copied()
            .find(|name| crate::gstreamer_init::has_element(name))
            .ok_or_else(|| EncoderError::NotAvailable("no AAC encoder element installed".into()))?;

        let pipeline = gst::Pipeline::new();

        let caps = gst_audio::AudioInfo::builder(gst_audio::AudioFormat::S16le, sample_rate, channels as u32)
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| EncoderError::Pipeline(format!("Invalid PCM format: {}", e)))?;
        let appsrc = gst_app::AppSrc::builder()
            .name("pcm_src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let convert = gst::ElementFactory::make("audioconvert")
            .build()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to create audioconvert: {}", e)))?;

        let encoder = gst::ElementFactory::make(element)
            .build()
            .map_err(|e| EncoderError::NotAvailable(format!("Failed to create {}: {}", element, e)))?;
        if bitrate > 0 {
            encoder.set_property_from_str("bitrate", &bitrate.to_string());
        }

        let parser = gst::ElementFactory::make("aacparse")
            .build()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to create aacparse: {}", e)))?;

        let out_caps = gst::Caps::builder("audio/mpeg")
            .field("mpegversion", 4i32)
            .field("stream-format", "adts")
            .build();
        let appsink = gst_app::AppSink::builder()
            .name("aac_sink")
            .caps(&out_caps)
            .sync(false)
            .build();

        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &encoder, &parser, appsink.upcast_ref()])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to start AAC encoder: {:?}", e)))?;

        log::info!("[Audio] AAC encoder {} ({} Hz, {} ch)", element, sample_rate, channels);

        Ok(Self {
            element,
            sample_rate,
            channels,
            pipeline,
            appsrc,
            appsink,
            samples_in: 0,
        })
    }

    pub fn element(&self) -> &str {
        self.element
    }
}

impl AudioEncoder for GstAacEncoder {
    fn frame_samples(&self) -> usize {
        AAC_FRAME_SAMPLES
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>> {
        let expected = AAC_FRAME_SAMPLES * self.channels as usize;
        if pcm.len() != expected {
            return Err(EncoderError::InputSize {
                expected,
                actual: pcm.len(),
            });
        }

        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut buffer = gst::Buffer::from_mut_slice(bytes);
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| EncoderError::Gst("Buffer is not writable".into()))?;
            let rate = self.sample_rate as u64;
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(self.samples_in * 1_000_000_000 / rate));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(
                AAC_FRAME_SAMPLES as u64 * 1_000_000_000 / rate,
            ));
        }
        self.samples_in += AAC_FRAME_SAMPLES as u64;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to push audio: {:?}", e)))?;

        // Encoders hold back a frame or two; take whatever is ready
        let mut frames = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            if let Some(buffer) = sample.buffer() {
                if let Ok(map) = buffer.map_readable() {
                    frames.push(map.as_slice().to_vec());
                }
            }
        }
        Ok(frames)
    }
}

impl Drop for GstAacEncoder {
    fn drop(&mut self) {
        self.appsrc.end_of_stream().ok();
        self.pipeline.set_state(gst::State::Null).ok();
    }
}
