// Network pusher worker
//
// One connection per run, no reconnect: if the connect fails or the link
// drops, only this worker exits and the rest of the pipeline carries on.

use std::sync::Arc;

use super::queue::{MediaKind, PacketQueue};
use crate::mux::{MuxError, MuxerConfig, TsMuxer};
use crate::transport::{Transport, TransportSink, TransportTarget};

/// Counters reported when the pusher exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PusherStats {
    pub connected: bool,
    pub video_units: u64,
    pub audio_units: u64,
    pub bytes: u64,
}

/// Network worker body: connect, then mux packets from `queue` into the
/// transport until the queue ends. The muxer is closed before the transport.
pub fn run_pusher(
    queue: Arc<PacketQueue>,
    mut transport: Box<dyn Transport>,
    target: TransportTarget,
    mux_config: MuxerConfig,
) -> PusherStats {
    let mut stats = PusherStats::default();

    if let Err(e) = transport.connect(&target) {
        log::error!("[SRT] {}, network output disabled for this run", e);
        return stats;
    }
    stats.connected = true;

    // On failure the sink is dropped here, which closes the transport
    let mut muxer = match TsMuxer::new(mux_config, TransportSink::new(transport)) {
        Ok(muxer) => muxer,
        Err(e) => {
            log::error!("[SRT] Failed to open TS muxer ({}), network output disabled", e);
            return stats;
        }
    };

    while let Some(packet) = queue.pop() {
        let result = match packet.kind {
            MediaKind::Video => muxer.write_video(packet.data(), packet.timestamp_ms, packet.keyframe),
            MediaKind::Audio if mux_config.has_audio() => {
                muxer.write_audio(packet.data(), packet.timestamp_ms)
            }
            MediaKind::Audio => Ok(()),
        };

        match result {
            Ok(()) => match packet.kind {
                MediaKind::Video => stats.video_units += 1,
                MediaKind::Audio => stats.audio_units += 1,
            },
            Err(MuxError::Sink(reason)) => {
                log::error!("[SRT] Send failed ({}), stopping network output", reason);
                break;
            }
            Err(e) => log::warn!("[SRT] Dropped packet at {} ms: {}", packet.timestamp_ms, e),
        }
    }

    let closed = muxer.close();
    stats.bytes = muxer.bytes_written();
    if let Err(e) = closed {
        log::warn!("[SRT] Failed to flush stream: {}", e);
    }
    log::info!(
        "[SRT] Pusher stopped: {} video, {} audio units, {} bytes",
        stats.video_units,
        stats.audio_units,
        stats.bytes
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::MediaPacket;
    use crate::transport::{Result as TransportResult, TransportError};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Wire {
        events: Vec<&'static str>,
        bytes: Vec<u8>,
    }

    struct FakeTransport {
        wire: Arc<Mutex<Wire>>,
        refuse: bool,
    }

    impl Transport for FakeTransport {
        fn connect(&mut self, target: &TransportTarget) -> TransportResult<()> {
            self.wire.lock().events.push("connect");
            if self.refuse {
                return Err(TransportError::Connect {
                    target: target.to_string(),
                    reason: "refused".into(),
                });
            }
            Ok(())
        }

        fn send(&mut self, bytes: &[u8]) -> TransportResult<usize> {
            self.wire.lock().bytes.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn close(&mut self) {
            self.wire.lock().events.push("close");
        }
    }

    fn target() -> TransportTarget {
        TransportTarget {
            host: "127.0.0.1".into(),
            port: 9000,
            stream_id: "cam".into(),
        }
    }

    const CONFIG: MuxerConfig = MuxerConfig {
        width: 640,
        height: 480,
        frame_rate: 30,
        audio_sample_rate: 44100,
        audio_channels: 2,
    };

    #[test]
    fn streams_every_packet_then_closes_once() {
        if !crate::gstreamer_init::elements_available(&["appsrc", "mpegtsmux", "appsink"]) {
            eprintln!("mpegtsmux not installed, skipping");
            return;
        }
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = Arc::new(PacketQueue::new("StreamQueue", 16));
        queue.push(MediaPacket::copy_from(&[0x65; 400], 0, true, MediaKind::Video).unwrap());
        queue.push(MediaPacket::copy_from(&[0xFF, 0xF1, 0x50, 0x80], 10, true, MediaKind::Audio).unwrap());
        queue.push(MediaPacket::copy_from(&[0x41; 200], 33, false, MediaKind::Video).unwrap());
        queue.stop();

        let transport = Box::new(FakeTransport { wire: wire.clone(), refuse: false });
        let stats = run_pusher(queue, transport, target(), CONFIG);

        assert!(stats.connected);
        assert_eq!(stats.video_units, 2);
        assert_eq!(stats.audio_units, 1);

        let wire = wire.lock();
        assert_eq!(wire.events, vec!["connect", "close"]);
        assert!(!wire.bytes.is_empty());
        assert_eq!(wire.bytes.len() % 188, 0);
    }

    #[test]
    fn refused_connection_exits_without_consuming() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = Arc::new(PacketQueue::new("StreamQueue", 16));
        queue.push(MediaPacket::copy_from(&[0x65; 64], 0, true, MediaKind::Video).unwrap());

        let transport = Box::new(FakeTransport { wire: wire.clone(), refuse: true });
        let stats = run_pusher(queue.clone(), transport, target(), CONFIG);

        assert!(!stats.connected);
        assert_eq!(queue.len(), 1);
        assert_eq!(wire.lock().events, vec!["connect"]);
    }
}
