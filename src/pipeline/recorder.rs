// Segmented MPEG-TS recording
//
// Segments always begin on a keyframe. A segment is rotated once it has run
// for the configured duration and the next keyframe arrives. Segment age is
// measured on packet timestamps, file names come from local wall-clock time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};

use super::queue::{MediaKind, MediaPacket, PacketQueue};
use crate::mux::{FileSink, MuxError, MuxerConfig, TsMuxer};

/// Error type for the recorder
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Failed to create segment {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    NoFile,
    Recording,
}

/// What happened to one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Written,
    /// Opened a new segment (first one or a rotation) and wrote the packet
    Opened,
    /// No segment open and the packet cannot start one
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub segments: u64,
    pub written: u64,
    pub discarded: u64,
}

/// Source of local wall-clock time for segment names
pub type WallClock = Box<dyn Fn() -> NaiveDateTime + Send>;

struct Segment {
    muxer: TsMuxer<FileSink>,
    path: PathBuf,
    started_ms: u64,
}

pub struct SegmentRecorder {
    root: PathBuf,
    segment_ms: u64,
    mux_config: MuxerConfig,
    wall_clock: WallClock,
    segment: Option<Segment>,
    finished: Vec<PathBuf>,
    stats: RecorderStats,
}

impl SegmentRecorder {
    pub fn new(root: impl Into<PathBuf>, segment_ms: u64, mux_config: MuxerConfig) -> Self {
        Self::with_wall_clock(root, segment_ms, mux_config, Box::new(|| Local::now().naive_local()))
    }

    pub fn with_wall_clock(
        root: impl Into<PathBuf>,
        segment_ms: u64,
        mux_config: MuxerConfig,
        wall_clock: WallClock,
    ) -> Self {
        Self {
            root: root.into(),
            segment_ms,
            mux_config,
            wall_clock,
            segment: None,
            finished: Vec::new(),
            stats: RecorderStats::default(),
        }
    }

    pub fn state(&self) -> RecorderState {
        if self.segment.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::NoFile
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.segment.as_ref().map(|s| s.path.as_path())
    }

    /// Segments closed so far, oldest first
    pub fn finished_segments(&self) -> &[PathBuf] {
        &self.finished
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Route one packet through the state machine. The packet is released
    /// before this returns, whatever the outcome.
    pub fn handle(&mut self, packet: MediaPacket) -> Result<PacketOutcome> {
        let starts_segment = packet.kind == MediaKind::Video && packet.keyframe;

        let age = self
            .segment
            .as_ref()
            .map(|s| packet.timestamp_ms.saturating_sub(s.started_ms));

        let opened = match age {
            None if !starts_segment => {
                self.stats.discarded += 1;
                return Ok(PacketOutcome::Discarded);
            }
            None => {
                self.open_segment(packet.timestamp_ms)?;
                true
            }
            Some(age) if starts_segment && age >= self.segment_ms => {
                self.close_segment()?;
                self.open_segment(packet.timestamp_ms)?;
                true
            }
            Some(_) => false,
        };

        if let Err(e) = self.write(&packet) {
            // A broken file is abandoned; the next keyframe starts a fresh one
            if let Some(segment) = self.segment.take() {
                log::error!("[REC] Write to {} failed, closing segment", segment.path.display());
                self.retire(segment).ok();
            }
            return Err(e);
        }

        self.stats.written += 1;
        Ok(if opened { PacketOutcome::Opened } else { PacketOutcome::Written })
    }

    fn write(&mut self, packet: &MediaPacket) -> Result<()> {
        let Some(segment) = self.segment.as_mut() else {
            return Ok(());
        };
        match packet.kind {
            MediaKind::Video => {
                segment
                    .muxer
                    .write_video(packet.data(), packet.timestamp_ms, packet.keyframe)?;
            }
            MediaKind::Audio => {
                if self.mux_config.has_audio() {
                    segment.muxer.write_audio(packet.data(), packet.timestamp_ms)?;
                }
            }
        }
        Ok(())
    }

    fn open_segment(&mut self, timestamp_ms: u64) -> Result<()> {
        let path = segment_path(&self.root, (self.wall_clock)());
        if let Some(parent) = path.parent() {
            create_dir_all_permissive(parent).map_err(|source| RecorderError::Create {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let sink = FileSink::create(&path).map_err(|e| match e {
            MuxError::Io(source) => RecorderError::Create {
                path: path.clone(),
                source,
            },
            other => RecorderError::Mux(other),
        })?;

        let muxer = match TsMuxer::new(self.mux_config, sink) {
            Ok(muxer) => muxer,
            Err(e) => {
                std::fs::remove_file(&path).ok();
                return Err(e.into());
            }
        };

        log::info!("[REC] New segment: {}", path.display());
        self.segment = Some(Segment {
            muxer,
            path,
            started_ms: timestamp_ms,
        });
        self.stats.segments += 1;
        Ok(())
    }

    fn close_segment(&mut self) -> Result<()> {
        match self.segment.take() {
            Some(segment) => self.retire(segment),
            None => Ok(()),
        }
    }

    fn retire(&mut self, mut segment: Segment) -> Result<()> {
        let result = segment.muxer.close();
        let bytes = segment.muxer.bytes_written();
        log::info!("[REC] Closed segment {} ({} bytes)", segment.path.display(), bytes);
        self.finished.push(segment.path);
        result?;
        Ok(())
    }

    /// Finalize the open segment, if any
    pub fn finish(&mut self) -> Result<()> {
        self.close_segment()
    }
}

impl Drop for SegmentRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("[REC] Failed to finalize segment: {}", e);
        }
    }
}

/// `<root>/<YYYYMMDD>/<HHMMSS>.ts`, suffixed `_1`, `_2`, ... if taken
pub fn segment_path(root: &Path, now: NaiveDateTime) -> PathBuf {
    let dir = root.join(now.format("%Y%m%d").to_string());
    let stem = now.format("%H%M%S").to_string();

    let mut candidate = dir.join(format!("{}.ts", stem));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.ts", stem, n));
        n += 1;
    }
    candidate
}

fn create_dir_all_permissive(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    builder.create(dir)
}

/// Recording worker body: drain `queue` into `recorder` until the queue ends
pub fn run_recorder(queue: Arc<PacketQueue>, mut recorder: SegmentRecorder) {
    log::info!("[REC] Recorder started");

    while let Some(packet) = queue.pop() {
        if let Err(e) = recorder.handle(packet) {
            log::error!("[REC] {}", e);
        }
    }

    if let Err(e) = recorder.finish() {
        log::error!("[REC] {}", e);
    }
    let stats = recorder.stats();
    log::info!(
        "[REC] Recorder stopped: {} segments, {} packets written, {} discarded",
        stats.segments,
        stats.written,
        stats.discarded
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{TS_PACKET_SIZE, VIDEO_PID};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    const VIDEO_ONLY: MuxerConfig = MuxerConfig {
        width: 640,
        height: 480,
        frame_rate: 30,
        audio_sample_rate: 0,
        audio_channels: 0,
    };

    fn ticking_clock() -> WallClock {
        let seconds = AtomicU32::new(0);
        Box::new(move || {
            let s = seconds.fetch_add(1, Ordering::SeqCst);
            NaiveDate::from_ymd_opt(2026, 3, 14)
                .and_then(|d| d.and_hms_opt(9, 30, s))
                .unwrap()
        })
    }

    fn packet(ts: u64, key: bool) -> MediaPacket {
        let nal = if key { 0x65 } else { 0x41 };
        let mut data = vec![0, 0, 0, 1, nal];
        data.extend(std::iter::repeat(ts as u8).take(300));
        MediaPacket::copy_from(&data, ts, key, MediaKind::Video).unwrap()
    }

    fn muxer_available() -> bool {
        let available = crate::gstreamer_init::elements_available(&["appsrc", "mpegtsmux", "appsink"]);
        if !available {
            eprintln!("mpegtsmux not installed, skipping");
        }
        available
    }

    /// Number of video PES packets (access units) in a TS file
    fn video_units(path: &Path) -> usize {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(bytes.len() % TS_PACKET_SIZE, 0);
        bytes
            .chunks(TS_PACKET_SIZE)
            .filter(|p| {
                let pid = (((p[1] & 0x1F) as u16) << 8) | p[2] as u16;
                pid == VIDEO_PID && p[1] & 0x40 != 0
            })
            .count()
    }

    #[test]
    fn segments_start_only_on_keyframes() {
        if !muxer_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SegmentRecorder::with_wall_clock(dir.path(), 60_000, VIDEO_ONLY, ticking_clock());

        assert_eq!(recorder.handle(packet(0, false)).unwrap(), PacketOutcome::Discarded);
        assert_eq!(recorder.handle(packet(33, false)).unwrap(), PacketOutcome::Discarded);
        assert_eq!(recorder.state(), RecorderState::NoFile);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        assert_eq!(recorder.handle(packet(66, true)).unwrap(), PacketOutcome::Opened);
        assert_eq!(recorder.handle(packet(99, false)).unwrap(), PacketOutcome::Written);
        assert_eq!(recorder.state(), RecorderState::Recording);
        recorder.finish().unwrap();

        let segments = recorder.finished_segments().to_vec();
        assert_eq!(segments.len(), 1);
        assert_eq!(video_units(&segments[0]), 2);
        assert_eq!(recorder.stats().discarded, 2);
    }

    #[test]
    fn rotation_waits_for_a_keyframe_after_the_duration() {
        if !muxer_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SegmentRecorder::with_wall_clock(dir.path(), 1000, VIDEO_ONLY, ticking_clock());

        assert_eq!(recorder.handle(packet(0, true)).unwrap(), PacketOutcome::Opened);
        assert_eq!(recorder.handle(packet(500, false)).unwrap(), PacketOutcome::Written);
        assert_eq!(recorder.handle(packet(1100, true)).unwrap(), PacketOutcome::Opened);
        assert_eq!(recorder.handle(packet(1200, false)).unwrap(), PacketOutcome::Written);
        recorder.finish().unwrap();

        let segments = recorder.finished_segments().to_vec();
        assert_eq!(segments.len(), 2);
        assert_eq!(video_units(&segments[0]), 2);
        assert_eq!(video_units(&segments[1]), 2);
    }

    #[test]
    fn keyframes_inside_the_duration_do_not_rotate() {
        if !muxer_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SegmentRecorder::with_wall_clock(dir.path(), 1000, VIDEO_ONLY, ticking_clock());

        recorder.handle(packet(0, true)).unwrap();
        assert_eq!(recorder.handle(packet(400, true)).unwrap(), PacketOutcome::Written);
        assert_eq!(recorder.handle(packet(1500, false)).unwrap(), PacketOutcome::Written);
        recorder.finish().unwrap();
        assert_eq!(recorder.finished_segments().len(), 1);
    }

    #[test]
    fn segment_paths_use_date_folders_and_avoid_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let now = NaiveDate::from_ymd_opt(2026, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .unwrap();

        let first = segment_path(dir.path(), now);
        assert_eq!(first, dir.path().join("20260102").join("030405.ts"));

        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"").unwrap();
        assert_eq!(segment_path(dir.path(), now), dir.path().join("20260102").join("030405_1.ts"));
    }

    #[test]
    fn worker_drains_queue_and_finalizes() {
        if !muxer_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(PacketQueue::new("RecordQueue", 16));
        for (ts, key) in [(0, true), (33, false), (66, false)] {
            queue.push(packet(ts, key));
        }
        queue.stop();

        let recorder = SegmentRecorder::with_wall_clock(dir.path(), 60_000, VIDEO_ONLY, ticking_clock());
        run_recorder(queue.clone(), recorder);

        assert!(queue.is_empty());
        let day = dir.path().join("20260314");
        let files: Vec<_> = std::fs::read_dir(&day).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert_eq!(video_units(&path), 3);
    }
}
