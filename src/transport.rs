// Live stream transports
//
// A transport carries the finished MPEG-TS byte stream to a remote receiver.
// Both implementations send seven TS packets (1316 bytes) per datagram.

use std::net::UdpSocket;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::mux::{ByteSink, MuxError, DATAGRAM_SIZE};

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Where the stream goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    pub host: String,
    pub port: u16,
    pub stream_id: String,
}

impl std::fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if !self.stream_id.is_empty() {
            write!(f, " ({})", self.stream_id)?;
        }
        Ok(())
    }
}

/// Connection-oriented byte pipe to a stream receiver
pub trait Transport: Send {
    fn connect(&mut self, target: &TransportTarget) -> Result<()>;

    /// Send `bytes`, split into datagram-sized chunks. Returns bytes sent.
    fn send(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Creates a fresh transport for every pipeline start
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Box<dyn Transport> {
        self()
    }
}

/// SRT caller through GStreamer's `srtsink`
pub struct SrtTransport {
    latency_ms: u32,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    bytes_sent: u64,
}

impl SrtTransport {
    pub fn new(latency_ms: u32) -> Self {
        Self {
            latency_ms,
            pipeline: None,
            appsrc: None,
            bytes_sent: 0,
        }
    }

    fn build(&self, target: &TransportTarget) -> std::result::Result<(gst::Pipeline, gst_app::AppSrc), String> {
        crate::gstreamer_init::init_gstreamer().map_err(|e| format!("GStreamer init failed: {}", e))?;

        let pipeline = gst::Pipeline::new();
        let caps = gst::Caps::builder("video/mpegts")
            .field("systemstream", true)
            .field("packetsize", 188i32)
            .build();
        let appsrc = gst_app::AppSrc::builder()
            .name("ts_src")
            .caps(&caps)
            .format(gst::Format::Bytes)
            .is_live(true)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();

        let uri = format!("srt://{}:{}?mode=caller", target.host, target.port);
        let sink = gst::ElementFactory::make("srtsink")
            .property("uri", uri.as_str())
            .property("latency", self.latency_ms as i32)
            .property("wait-for-connection", false)
            .property("sync", false)
            .build()
            .map_err(|e| format!("Failed to create srtsink: {}", e))?;
        if !target.stream_id.is_empty() {
            if sink.has_property("streamid") {
                sink.set_property("streamid", target.stream_id.as_str());
            } else {
                log::warn!("[SRT] srtsink has no streamid property, stream id ignored");
            }
        }

        pipeline
            .add_many([appsrc.upcast_ref(), &sink])
            .map_err(|e| format!("Failed to add elements: {}", e))?;
        gst::Element::link_many([appsrc.upcast_ref(), &sink])
            .map_err(|e| format!("Failed to link elements: {}", e))?;

        Ok((pipeline, appsrc))
    }

    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.as_ref()?.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
            _ => None,
        }
    }
}

impl Transport for SrtTransport {
    fn connect(&mut self, target: &TransportTarget) -> Result<()> {
        let fail = |reason: String| TransportError::Connect {
            target: target.to_string(),
            reason,
        };

        let (pipeline, appsrc) = self.build(target).map_err(fail)?;
        // srtsink connects while going to PLAYING; a refused caller fails here
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            pipeline.set_state(gst::State::Null).ok();
            return Err(fail(format!("{:?}", e)));
        }

        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        if let Some(err) = self.bus_error() {
            self.close();
            return Err(fail(err));
        }

        log::info!("[SRT] Connected to {} (latency {} ms)", target, self.latency_ms);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let appsrc = self.appsrc.as_ref().ok_or(TransportError::NotConnected)?;
        for chunk in bytes.chunks(DATAGRAM_SIZE) {
            appsrc
                .push_buffer(gst::Buffer::from_slice(chunk.to_vec()))
                .map_err(|e| TransportError::Send(format!("{:?}", e)))?;
        }
        if let Some(err) = self.bus_error() {
            return Err(TransportError::Send(err));
        }
        self.bytes_sent += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        if let Some(appsrc) = self.appsrc.take() {
            appsrc.end_of_stream().ok();
        }

        // Let srtsink drain what is queued before tearing the socket down
        if let Some(bus) = pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(2)) {
                match msg.view() {
                    gst::MessageView::Eos(..) | gst::MessageView::Error(..) => break,
                    _ => {}
                }
            }
        }
        pipeline.set_state(gst::State::Null).ok();
        log::info!("[SRT] Closed after {} bytes", self.bytes_sent);
    }
}

impl Drop for SrtTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Plain UDP datagrams (MPEG-TS over UDP)
#[derive(Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    bytes_sent: u64,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, target: &TransportTarget) -> Result<()> {
        let fail = |e: std::io::Error| TransportError::Connect {
            target: target.to_string(),
            reason: e.to_string(),
        };
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(fail)?;
        socket.connect((target.host.as_str(), target.port)).map_err(fail)?;
        log::info!("[UDP] Sending to {}", target);
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        for chunk in bytes.chunks(DATAGRAM_SIZE) {
            socket.send(chunk)?;
        }
        self.bytes_sent += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("[UDP] Closed after {} bytes", self.bytes_sent);
        }
    }
}

/// Muxer sink forwarding container bytes to a connected transport.
///
/// Closing the owning muxer closes the transport.
pub struct TransportSink {
    transport: Box<dyn Transport>,
    open: bool,
}

impl TransportSink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport, open: true }
    }
}

impl ByteSink for TransportSink {
    fn accept(&mut self, bytes: &[u8]) -> std::result::Result<usize, MuxError> {
        self.transport
            .send(bytes)
            .map_err(|e| MuxError::Sink(e.to_string()))
    }

    fn finish(&mut self) -> std::result::Result<(), MuxError> {
        if self.open {
            self.transport.close();
            self.open = false;
        }
        Ok(())
    }
}

impl Drop for TransportSink {
    fn drop(&mut self) {
        if self.open {
            self.transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_transport_sends_datagram_sized_chunks() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut transport = UdpTransport::new();
        transport
            .connect(&TransportTarget {
                host: "127.0.0.1".into(),
                port,
                stream_id: String::new(),
            })
            .unwrap();

        let payload = vec![0x47u8; DATAGRAM_SIZE + 188];
        assert_eq!(transport.send(&payload).unwrap(), payload.len());

        let mut buf = [0u8; 2048];
        assert_eq!(receiver.recv(&mut buf).unwrap(), DATAGRAM_SIZE);
        assert_eq!(receiver.recv(&mut buf).unwrap(), 188);

        transport.close();
        assert!(matches!(transport.send(&payload), Err(TransportError::NotConnected)));
    }

    #[test]
    fn target_display_includes_stream_id() {
        let target = TransportTarget {
            host: "10.0.0.2".into(),
            port: 8890,
            stream_id: "publish:cam".into(),
        };
        assert_eq!(target.to_string(), "10.0.0.2:8890 (publish:cam)");
    }
}
