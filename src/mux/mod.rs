// MPEG-TS container muxing
//
// `TsMuxer` feeds timestamped H.264 and AAC access units into
// `appsrc(video) + appsrc(audio) -> mpegtsmux -> appsink` and forwards every
// pulled buffer to a `ByteSink` it owns. mpegtsmux interleaves the streams by
// timestamp. The network pusher and the segment recorder each drive their
// own instance.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

/// Size of one transport packet
pub const TS_PACKET_SIZE: usize = 188;

/// PID carrying the H.264 stream
pub const VIDEO_PID: u16 = 0x0100;

/// PID carrying the AAC stream
pub const AUDIO_PID: u16 = 0x0101;

/// Annex-B start code every video access unit must begin with
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// H.264 access unit delimiter (primary_pic_type = any)
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// Seven TS packets, the payload size SRT and UDP senders expect per datagram
pub const DATAGRAM_SIZE: usize = 7 * TS_PACKET_SIZE;

/// mpegtsmux emits buffers of this many packets
const PACKETS_PER_BUFFER: i32 = 7;

/// PAT/PMT repetition in 90 kHz ticks (100 ms)
const TABLE_INTERVAL_TICKS: &str = "9000";

/// Video may run this far past the last audio frame before the audio
/// stream is ended so mpegtsmux stops waiting for it
const AUDIO_STALL_MS: u64 = 2000;

/// Upper bound on waiting for mpegtsmux to drain on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for muxing operations
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Muxer is closed")]
    Closed,

    #[error("Muxer has no audio stream")]
    NoAudioStream,

    #[error("Empty access unit")]
    EmptyUnit,

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Destination for container bytes
pub trait ByteSink {
    /// Accept `bytes`, returning how many were consumed
    fn accept(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Called once when the owning muxer closes
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ByteSink for Vec<u8> {
    fn accept(&mut self, bytes: &[u8]) -> Result<usize> {
        self.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Stream parameters for a muxer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// 0 disables the audio stream
    pub audio_sample_rate: u32,
    /// 0 disables the audio stream
    pub audio_channels: u16,
}

impl MuxerConfig {
    pub fn has_audio(&self) -> bool {
        self.audio_sample_rate > 0 && self.audio_channels > 0
    }
}

/// MPEG-TS writer bound to one sink
pub struct TsMuxer<S: ByteSink> {
    sink: Option<S>,
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: Option<gst_app::AppSrc>,
    appsink: gst_app::AppSink,
    audio_ended: bool,
    first_video_ms: Option<u64>,
    last_audio_ms: Option<u64>,
    bytes_out: u64,
}

impl<S: ByteSink> TsMuxer<S> {
    /// Open a container with one H.264 stream and, when the audio parameters
    /// are non-zero, one AAC/ADTS stream.
    pub fn new(config: MuxerConfig, sink: S) -> Result<Self> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| MuxError::Gst(format!("GStreamer init failed: {}", e)))?;

        let (pipeline, video_src, audio_src, appsink) = Self::create_pipeline(&config)?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MuxError::Gst(format!("Failed to start muxer: {:?}", e)))?;

        log::debug!(
            "[Mux] Opened TS muxer {}x{}@{} ({})",
            config.width,
            config.height,
            config.frame_rate,
            if config.has_audio() { "video+audio" } else { "video only" }
        );

        Ok(Self {
            sink: Some(sink),
            pipeline,
            video_src,
            audio_src,
            appsink,
            audio_ended: false,
            first_video_ms: None,
            last_audio_ms: None,
            bytes_out: 0,
        })
    }

    fn create_pipeline(
        config: &MuxerConfig,
    ) -> Result<(gst::Pipeline, gst_app::AppSrc, Option<gst_app::AppSrc>, gst_app::AppSink)> {
        let pipeline = gst::Pipeline::new();

        let video_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .field("width", config.width as i32)
            .field("height", config.height as i32)
            .field("framerate", gst::Fraction::new(config.frame_rate.max(1) as i32, 1))
            .build();
        let video_src = gst_app::AppSrc::builder()
            .name("video_src")
            .caps(&video_caps)
            .format(gst::Format::Time)
            .build();

        let muxer = gst::ElementFactory::make("mpegtsmux")
            .property("alignment", PACKETS_PER_BUFFER)
            .property_from_str("pat-interval", TABLE_INTERVAL_TICKS)
            .property_from_str("pmt-interval", TABLE_INTERVAL_TICKS)
            .build()
            .map_err(|e| MuxError::Gst(format!("Failed to create mpegtsmux: {}", e)))?;

        let out_caps = gst::Caps::builder("video/mpegts").build();
        let appsink = gst_app::AppSink::builder()
            .name("ts_sink")
            .caps(&out_caps)
            .sync(false)
            .build();

        pipeline
            .add_many([video_src.upcast_ref(), &muxer, appsink.upcast_ref()])
            .map_err(|e| MuxError::Gst(format!("Failed to add elements: {}", e)))?;
        link_stream(&video_src, &muxer, VIDEO_PID)?;
        muxer
            .link(&appsink)
            .map_err(|e| MuxError::Gst(format!("Failed to link mpegtsmux: {}", e)))?;

        let audio_src = if config.has_audio() {
            let audio_caps = gst::Caps::builder("audio/mpeg")
                .field("mpegversion", 4i32)
                .field("stream-format", "adts")
                .field("rate", config.audio_sample_rate as i32)
                .field("channels", config.audio_channels as i32)
                .build();
            let audio_src = gst_app::AppSrc::builder()
                .name("audio_src")
                .caps(&audio_caps)
                .format(gst::Format::Time)
                .build();
            pipeline
                .add(&audio_src)
                .map_err(|e| MuxError::Gst(format!("Failed to add audio source: {}", e)))?;
            link_stream(&audio_src, &muxer, AUDIO_PID)?;
            Some(audio_src)
        } else {
            None
        };

        Ok((pipeline, video_src, audio_src, appsink))
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Container bytes delivered to the sink so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_out
    }

    /// Write one H.264 access unit.
    ///
    /// A missing Annex-B start code is prepended, as is an access unit
    /// delimiter when the unit does not open with one.
    pub fn write_video(&mut self, data: &[u8], timestamp_ms: u64, is_key: bool) -> Result<()> {
        if self.sink.is_none() {
            return Err(MuxError::Closed);
        }
        if data.is_empty() {
            return Err(MuxError::EmptyUnit);
        }

        let body: &[u8] = if has_start_code(data) { &data[ANNEX_B_START_CODE.len()..] } else { data };
        let starts_with_aud = body.first().map_or(false, |b| b & 0x1F == 9);

        let mut unit = Vec::with_capacity(ACCESS_UNIT_DELIMITER.len() + ANNEX_B_START_CODE.len() + body.len());
        if !starts_with_aud {
            unit.extend_from_slice(&ACCESS_UNIT_DELIMITER);
        }
        unit.extend_from_slice(&ANNEX_B_START_CODE);
        unit.extend_from_slice(body);

        self.first_video_ms.get_or_insert(timestamp_ms);
        self.end_stalled_audio(timestamp_ms);

        let buffer = timed_buffer(unit, timestamp_ms, !is_key)?;
        self.video_src
            .push_buffer(buffer)
            .map_err(|e| MuxError::Gst(format!("Failed to push video: {:?}", e)))?;
        self.drain_ready()
    }

    /// Write one ADTS frame. The payload is passed through unmodified.
    pub fn write_audio(&mut self, data: &[u8], timestamp_ms: u64) -> Result<()> {
        if self.sink.is_none() {
            return Err(MuxError::Closed);
        }
        let Some(audio_src) = self.audio_src.as_ref() else {
            return Err(MuxError::NoAudioStream);
        };
        if data.is_empty() {
            return Err(MuxError::EmptyUnit);
        }
        if self.audio_ended {
            return Ok(());
        }

        self.last_audio_ms = Some(timestamp_ms);
        let buffer = timed_buffer(data.to_vec(), timestamp_ms, false)?;
        audio_src
            .push_buffer(buffer)
            .map_err(|e| MuxError::Gst(format!("Failed to push audio: {:?}", e)))?;
        self.drain_ready()
    }

    /// True once the audio stream was ended because it stopped keeping up
    pub fn audio_ended(&self) -> bool {
        self.audio_ended
    }

    /// mpegtsmux holds video until every stream has data; an audio stream
    /// that never starts or stalls would block the container indefinitely.
    fn end_stalled_audio(&mut self, video_ms: u64) {
        if self.audio_ended {
            return;
        }
        let Some(audio_src) = self.audio_src.as_ref() else {
            return;
        };
        let reference = match (self.last_audio_ms, self.first_video_ms) {
            (Some(audio), _) => audio,
            (None, Some(video)) => video,
            (None, None) => return,
        };
        if video_ms.saturating_sub(reference) <= AUDIO_STALL_MS {
            return;
        }
        log::warn!(
            "[Mux] No audio for {} ms at video {} ms, continuing video only",
            video_ms - reference,
            video_ms
        );
        if let Err(e) = audio_src.end_of_stream() {
            log::debug!("[Mux] Audio EOS failed: {:?}", e);
        }
        self.audio_ended = true;
    }

    /// Forward whatever mpegtsmux has produced so far
    fn drain_ready(&mut self) -> Result<()> {
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            self.deliver(&sample)?;
        }
        match self.bus_error() {
            Some(err) => Err(MuxError::Gst(err)),
            None => Ok(()),
        }
    }

    fn deliver(&mut self, sample: &gst::Sample) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(MuxError::Closed);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| MuxError::Gst("Sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| MuxError::Gst(format!("Failed to map output: {}", e)))?;
        let bytes = map.as_slice();

        let mut offset = 0;
        while offset < bytes.len() {
            let consumed = sink.accept(&bytes[offset..])?;
            if consumed == 0 {
                return Err(MuxError::Sink("sink accepted no bytes".into()));
            }
            offset += consumed;
        }
        self.bytes_out += bytes.len() as u64;
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

    /// Send EOS and forward everything mpegtsmux still holds
    fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.video_src.end_of_stream() {
            log::debug!("[Mux] Video EOS failed: {:?}", e);
        }
        if let Some(audio_src) = self.audio_src.as_ref() {
            if !self.audio_ended {
                if let Err(e) = audio_src.end_of_stream() {
                    log::debug!("[Mux] Audio EOS failed: {:?}", e);
                }
            }
        }

        let deadline = Instant::now() + CLOSE_TIMEOUT;
        while !self.appsink.is_eos() {
            if let Some(err) = self.bus_error() {
                return Err(MuxError::Gst(err));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MuxError::Gst("Timed out draining mpegtsmux".into()));
            }
            let timeout = gst::ClockTime::from_nseconds(remaining.as_nanos() as u64);
            if let Some(sample) = self.appsink.try_pull_sample(timeout) {
                self.deliver(&sample)?;
            }
        }
        Ok(())
    }

    /// Flush buffered packets and release the sink. No-op once closed.
    pub fn close(&mut self) -> Result<Option<S>> {
        if self.sink.is_none() {
            return Ok(None);
        }
        let flushed = self.flush();
        self.pipeline.set_state(gst::State::Null).ok();

        let mut sink = self.sink.take();
        let finished = match sink.as_mut() {
            Some(s) => s.finish(),
            None => Ok(()),
        };
        log::debug!("[Mux] Closed TS muxer after {} bytes", self.bytes_out);
        flushed?;
        finished?;
        Ok(sink)
    }
}

impl<S: ByteSink> Drop for TsMuxer<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("[Mux] Failed to finalize container: {}", e);
        }
    }
}

/// Request the mpegtsmux pad whose number becomes the stream's PID
fn link_stream(src: &gst_app::AppSrc, muxer: &gst::Element, pid: u16) -> Result<()> {
    let pad_name = format!("sink_{}", pid);
    let sink_pad = muxer
        .request_pad_simple(&pad_name)
        .ok_or_else(|| MuxError::Gst(format!("mpegtsmux refused pad {}", pad_name)))?;
    let src_pad = src
        .static_pad("src")
        .ok_or_else(|| MuxError::Gst("appsrc has no src pad".into()))?;
    src_pad
        .link(&sink_pad)
        .map_err(|e| MuxError::Gst(format!("Failed to link {}: {:?}", pad_name, e)))?;
    Ok(())
}

fn timed_buffer(data: Vec<u8>, timestamp_ms: u64, delta: bool) -> Result<gst::Buffer> {
    let mut buffer = gst::Buffer::from_mut_slice(data);
    {
        let buffer_ref = buffer
            .get_mut()
            .ok_or_else(|| MuxError::Gst("Buffer is not writable".into()))?;
        let ts = gst::ClockTime::from_mseconds(timestamp_ms);
        buffer_ref.set_pts(ts);
        buffer_ref.set_dts(ts);
        if delta {
            buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
        }
    }
    Ok(buffer)
}

/// True when `data` begins with a 4-byte Annex-B start code
pub fn has_start_code(data: &[u8]) -> bool {
    data.len() > ANNEX_B_START_CODE.len() && data[..4] == ANNEX_B_START_CODE
}

/// Sink writing container bytes to a file
pub struct FileSink {
    writer: BufWriter<File>,
    bytes: u64,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

impl ByteSink for FileSink {
    fn accept(&mut self, bytes: &[u8]) -> Result<usize> {
        self.writer.write_all(bytes)?;
        self.bytes += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_ONLY: MuxerConfig = MuxerConfig {
        width: 1280,
        height: 720,
        frame_rate: 30,
        audio_sample_rate: 0,
        audio_channels: 0,
    };

    const WITH_AUDIO: MuxerConfig = MuxerConfig {
        audio_sample_rate: 44100,
        audio_channels: 2,
        ..VIDEO_ONLY
    };

    const ADTS_FRAME: [u8; 7] = [0xFF, 0xF1, 0x50, 0x80, 0x01, 0x7F, 0xFC];

    fn mpegtsmux_available() -> bool {
        let available = crate::gstreamer_init::elements_available(&["appsrc", "mpegtsmux", "appsink"]);
        if !available {
            eprintln!("mpegtsmux not installed, skipping");
        }
        available
    }

    fn idr_unit() -> Vec<u8> {
        let mut unit = vec![0x65, 0x88, 0x84];
        unit.extend(std::iter::repeat(0x5A).take(700));
        unit
    }

    fn mux_units(config: MuxerConfig, units: &[(&[u8], u64, bool)]) -> Vec<u8> {
        let mut muxer = TsMuxer::new(config, Vec::new()).unwrap();
        for (data, ts, key) in units {
            muxer.write_video(data, *ts, *key).unwrap();
        }
        muxer.close().unwrap().unwrap()
    }

    fn pid(packet: &[u8]) -> u16 {
        (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
    }

    /// Index of the first packet starting a PES on `wanted`
    fn first_unit_start(stream: &[u8], wanted: u16) -> Option<usize> {
        stream
            .chunks(TS_PACKET_SIZE)
            .position(|p| pid(p) == wanted && p[1] & 0x40 != 0)
    }

    #[test]
    fn start_code_is_normalized_to_exactly_one_prefix() {
        if !mpegtsmux_available() {
            return;
        }
        let bare = idr_unit();
        let mut prefixed = ANNEX_B_START_CODE.to_vec();
        prefixed.extend_from_slice(&bare);

        let a = mux_units(VIDEO_ONLY, &[(&bare, 0, true), (&bare[..100], 33, false)]);
        let mut second = ANNEX_B_START_CODE.to_vec();
        second.extend_from_slice(&bare[..100]);
        let b = mux_units(VIDEO_ONLY, &[(&prefixed, 0, true), (&second, 33, false)]);

        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn output_is_whole_ts_packets_starting_with_tables() {
        if !mpegtsmux_available() {
            return;
        }
        let unit = idr_unit();
        let out = mux_units(VIDEO_ONLY, &[(&unit, 0, true)]);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert!(out.chunks(TS_PACKET_SIZE).all(|p| p[0] == 0x47));
        let pat = out.chunks(TS_PACKET_SIZE).position(|p| pid(p) == 0x0000).expect("PAT");
        let video = first_unit_start(&out, VIDEO_PID).expect("video PES");
        assert!(pat < video);
    }

    #[test]
    fn streams_are_interleaved_by_timestamp_not_call_order() {
        if !mpegtsmux_available() {
            return;
        }
        let mut muxer = TsMuxer::new(WITH_AUDIO, Vec::new()).unwrap();
        muxer.write_video(&idr_unit(), 200, true).unwrap();
        muxer.write_audio(&ADTS_FRAME, 100).unwrap();
        let out = muxer.close().unwrap().unwrap();

        let audio = first_unit_start(&out, AUDIO_PID).expect("audio PES");
        let video = first_unit_start(&out, VIDEO_PID).expect("video PES");
        assert!(audio < video, "audio at packet {} should precede video at {}", audio, video);
    }

    #[test]
    fn audio_requires_an_audio_stream() {
        if !mpegtsmux_available() {
            return;
        }
        let mut muxer = TsMuxer::new(VIDEO_ONLY, Vec::new()).unwrap();
        assert!(matches!(muxer.write_audio(&ADTS_FRAME, 0), Err(MuxError::NoAudioStream)));

        let mut muxer = TsMuxer::new(WITH_AUDIO, Vec::new()).unwrap();
        muxer.write_audio(&ADTS_FRAME, 0).unwrap();
        let out = muxer.close().unwrap().unwrap();
        assert!(first_unit_start(&out, AUDIO_PID).is_some());
    }

    #[test]
    fn missing_audio_does_not_hold_back_video() {
        if !mpegtsmux_available() {
            return;
        }
        let mut muxer = TsMuxer::new(WITH_AUDIO, Vec::new()).unwrap();
        let unit = idr_unit();
        for i in 0..100u64 {
            muxer.write_video(&unit, i * 33, i % 30 == 0).unwrap();
        }
        assert!(muxer.audio_ended());
        muxer.write_audio(&ADTS_FRAME, 3300).unwrap();
        let out = muxer.close().unwrap().unwrap();
        assert!(first_unit_start(&out, VIDEO_PID).is_some());
        assert!(first_unit_start(&out, AUDIO_PID).is_none());
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_writes() {
        if !mpegtsmux_available() {
            return;
        }
        let mut muxer = TsMuxer::new(VIDEO_ONLY, Vec::new()).unwrap();
        muxer.write_video(&idr_unit(), 0, true).unwrap();
        assert!(muxer.close().unwrap().is_some());
        assert!(muxer.close().unwrap().is_none());
        assert!(muxer.is_closed());
        assert!(matches!(muxer.write_video(&idr_unit(), 40, false), Err(MuxError::Closed)));
    }

    #[test]
    fn output_is_delivered_in_datagram_multiples() {
        if !mpegtsmux_available() {
            return;
        }
        struct Recording(Vec<usize>);
        impl ByteSink for Recording {
            fn accept(&mut self, bytes: &[u8]) -> Result<usize> {
                self.0.push(bytes.len());
                Ok(bytes.len())
            }
        }

        let mut muxer = TsMuxer::new(VIDEO_ONLY, Recording(Vec::new())).unwrap();
        let unit = vec![0x41; 20_000];
        for i in 0..10 {
            muxer.write_video(&unit, i * 33, i == 0).unwrap();
        }
        let sink = muxer.close().unwrap().unwrap();
        assert!(!sink.0.is_empty());
        assert!(sink.0.iter().all(|len| len % DATAGRAM_SIZE == 0));
        assert!(muxer.bytes_written() > 10 * 20_000);
    }

    #[test]
    fn file_sink_persists_container() {
        if !mpegtsmux_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ts");
        let mut muxer = TsMuxer::new(VIDEO_ONLY, FileSink::create(&path).unwrap()).unwrap();
        muxer.write_video(&idr_unit(), 0, true).unwrap();
        let sink = muxer.close().unwrap().unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len() as u64, sink.bytes_written());
        assert_eq!(on_disk[0], 0x47);
    }

    #[test]
    fn start_code_detection() {
        assert!(has_start_code(&[0, 0, 0, 1, 0x65]));
        assert!(!has_start_code(&[0, 0, 0, 1]));
        assert!(!has_start_code(&[0, 0, 1, 0x65]));
    }
}
