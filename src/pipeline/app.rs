// Pipeline lifecycle controller
//
// Owns the hardware, the two packet queues and every worker thread handle.
// Teardown always runs in the same order: network worker, recording worker,
// audio worker, then hardware (detector, encoder, capture).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use super::audio::{run_audio, AudioFactory, AudioStats};
use super::clock::PipelineClock;
use super::frame_loop::{FrameHardware, FrameOutputs, FramePipeline, StatusFlags, StepOutcome};
use super::pusher::{run_pusher, PusherStats};
use super::queue::PacketQueue;
use super::recorder::{run_recorder, SegmentRecorder};
use crate::config::{Config, ConfigError};
use crate::devices::CaptureError;
use crate::mux::MuxerConfig;
use crate::transport::{TransportFactory, TransportTarget};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("AI overlay enabled but no detector backend is available")]
    MissingDetector,

    #[error("Detector takes {actual:?} input but [ai] is configured for {configured:?}")]
    DetectorInput {
        configured: (u32, u32),
        actual: (u32, u32),
    },

    #[error("{0} output enabled but no {0} backend was supplied")]
    MissingService(&'static str),

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Pipeline hardware has been released")]
    Released,

    #[error("Failed to start capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Collaborators that are created per run rather than once
#[derive(Clone, Default)]
pub struct Services {
    pub transport: Option<Arc<dyn TransportFactory>>,
    pub audio: Option<Arc<dyn AudioFactory>>,
}

/// Asynchronous stop request.
///
/// `request_stop` only performs an atomic store, so it is safe to call from a
/// signal handler or any other thread.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runtime switch for the detection overlay
#[derive(Clone, Debug, Default)]
pub struct AiToggle(Arc<AtomicBool>);

impl AiToggle {
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    /// Flip the switch, returning the new state
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

/// Console/control requests handled by the main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleAi,
    Status,
    Stop,
}

/// Snapshot returned by [`StreamerApp::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppStatus {
    pub running: bool,
    pub flags: StatusFlags,
    pub frames: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub stream_queued: usize,
    pub record_queued: usize,
}

struct Workers {
    running: Arc<AtomicBool>,
    net: Option<JoinHandle<PusherStats>>,
    rec: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<AudioStats>>,
}

fn is_alive<T>(handle: &Option<JoinHandle<T>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

pub struct StreamerApp {
    config: Config,
    frames: Option<FramePipeline>,
    services: Services,
    stream_queue: Arc<PacketQueue>,
    record_queue: Arc<PacketQueue>,
    stop: StopHandle,
    ai: AiToggle,
    clock: PipelineClock,
    workers: Option<Workers>,
}

impl StreamerApp {
    /// Validate the configuration against the supplied collaborators.
    /// Nothing is started yet.
    pub fn new(config: Config, hardware: FrameHardware, services: Services) -> Result<Self> {
        config.validate()?;

        if config.ai.enabled && hardware.detector.is_none() {
            return Err(AppError::MissingDetector);
        }
        if let Some(detector) = hardware.detector.as_ref() {
            let configured = (config.ai.input_width, config.ai.input_height);
            let actual = detector.input_size();
            if actual != configured {
                return Err(AppError::DetectorInput { configured, actual });
            }
        }
        if config.stream.enabled && services.transport.is_none() {
            return Err(AppError::MissingService("stream"));
        }
        if config.audio.enabled && services.audio.is_none() {
            return Err(AppError::MissingService("audio"));
        }

        let timeout = Duration::from_millis(config.video.capture_timeout_ms);
        let ai = AiToggle::default();
        ai.set(config.ai.enabled);

        Ok(Self {
            stream_queue: Arc::new(PacketQueue::new("StreamQueue", config.queue_capacity)),
            record_queue: Arc::new(PacketQueue::new("RecordQueue", config.queue_capacity)),
            frames: Some(FramePipeline::new(hardware, timeout)),
            config,
            services,
            stop: StopHandle::default(),
            ai,
            clock: PipelineClock::start(),
            workers: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn ai_toggle(&self) -> AiToggle {
        self.ai.clone()
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    pub fn stream_queue(&self) -> &Arc<PacketQueue> {
        &self.stream_queue
    }

    pub fn record_queue(&self) -> &Arc<PacketQueue> {
        &self.record_queue
    }

    /// Container parameters shared by the pusher and the recorder
    pub fn mux_config(&self) -> MuxerConfig {
        let (audio_sample_rate, audio_channels) = if self.config.audio.enabled {
            (self.config.audio.sample_rate, self.config.audio.channels)
        } else {
            (0, 0)
        };
        MuxerConfig {
            width: self.config.video.width,
            height: self.config.video.height,
            frame_rate: self.config.video.fps,
            audio_sample_rate,
            audio_channels,
        }
    }

    /// Output flags reflect the worker threads that are still alive, so a
    /// pusher that gave up on its connection reports `SRT:--`
    fn flags(&self) -> StatusFlags {
        let has_detector = self.frames.as_ref().is_some_and(|f| f.has_detector());
        let (stream, record) = match self.workers.as_ref() {
            Some(workers) => (is_alive(&workers.net), is_alive(&workers.rec)),
            None => (false, false),
        };
        StatusFlags {
            stream,
            record,
            ai: self.ai.is_enabled() && has_detector,
        }
    }

    /// Start capture and spawn the enabled worker threads
    pub fn start(&mut self) -> Result<()> {
        if self.workers.is_some() {
            return Err(AppError::AlreadyRunning);
        }
        let Some(frames) = self.frames.as_mut() else {
            return Err(AppError::Released);
        };

        self.stream_queue.reopen();
        self.record_queue.reopen();
        self.clock = PipelineClock::start();
        frames.start_capture()?;

        self.workers = Some(Workers {
            running: Arc::new(AtomicBool::new(true)),
            net: None,
            rec: None,
            audio: None,
        });

        if let Err(e) = self.spawn_workers() {
            self.stop_workers();
            return Err(e);
        }

        log::info!(
            "[App] Pipeline started ({}x{}@{}, stream: {}, record: {}, audio: {}, ai: {})",
            self.config.video.width,
            self.config.video.height,
            self.config.video.fps,
            self.config.stream.enabled,
            self.config.record.enabled,
            self.config.audio.enabled,
            self.ai.is_enabled()
        );
        Ok(())
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let mux_config = self.mux_config();
        let clock = self.clock;
        let Some(workers) = self.workers.as_mut() else {
            return Ok(());
        };

        if self.config.stream.enabled {
            if let Some(factory) = &self.services.transport {
                let transport = factory.create();
                let queue = self.stream_queue.clone();
                let target = TransportTarget {
                    host: self.config.stream.host.clone(),
                    port: self.config.stream.port,
                    stream_id: self.config.stream.stream_id.clone(),
                };
                let handle = thread::Builder::new()
                    .name("edgecast-net".into())
                    .spawn(move || run_pusher(queue, transport, target, mux_config))
                    .map_err(|source| AppError::Spawn { name: "network", source })?;
                workers.net = Some(handle);
            }
        }

        if self.config.record.enabled {
            let queue = self.record_queue.clone();
            let root: PathBuf = self.config.record.root.clone();
            let recorder = SegmentRecorder::new(root, self.config.segment_duration_ms(), mux_config);
            let handle = thread::Builder::new()
                .name("edgecast-rec".into())
                .spawn(move || run_recorder(queue, recorder))
                .map_err(|source| AppError::Spawn { name: "recording", source })?;
            workers.rec = Some(handle);
        }

        if self.config.audio.enabled {
            if let Some(factory) = &self.services.audio {
                let factory = factory.clone();
                let running = workers.running.clone();
                let mut outputs = Vec::new();
                if self.config.stream.enabled {
                    outputs.push(self.stream_queue.clone());
                }
                if self.config.record.enabled {
                    outputs.push(self.record_queue.clone());
                }
                let handle = thread::Builder::new()
                    .name("edgecast-audio".into())
                    .spawn(move || run_audio(factory, running, clock, outputs))
                    .map_err(|source| AppError::Spawn { name: "audio", source })?;
                workers.audio = Some(handle);
            }
        }

        Ok(())
    }

    /// One orchestrator iteration. `None` when the pipeline is not running.
    pub fn run_once(&mut self) -> Option<StepOutcome> {
        if self.workers.is_none() {
            return None;
        }
        let flags = self.flags();
        let ai_enabled = self.ai.is_enabled();
        // A finished worker no longer drains its queue
        let outputs = FrameOutputs {
            stream: flags.stream.then_some(&*self.stream_queue),
            record: flags.record.then_some(&*self.record_queue),
        };
        let frames = self.frames.as_mut()?;

        let outcome = frames.step(&self.clock, ai_enabled, outputs);
        if let Some(line) = frames.stats_mut().poll_status(flags, Instant::now()) {
            log::info!("{}", line);
        }
        Some(outcome)
    }

    /// Main loop: iterate until a stop is requested, then tear everything down
    pub fn run(&mut self, commands: &Receiver<Command>) -> Result<()> {
        if !self.is_running() {
            self.start()?;
        }

        while !self.stop.is_stop_requested() {
            loop {
                match commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break,
                }
            }
            if self.stop.is_stop_requested() {
                break;
            }
            self.run_once();
        }

        log::info!("[App] Stop requested");
        self.stop();
        Ok(())
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleAi => {
                let has_detector = self.frames.as_ref().is_some_and(|f| f.has_detector());
                if !has_detector {
                    log::warn!("[AI] No detector loaded, overlay stays off");
                    return;
                }
                let enabled = self.ai.toggle();
                log::info!("[AI] Overlay {}", if enabled { "enabled" } else { "disabled" });
            }
            Command::Status => {
                let status = self.status();
                log::info!(
                    "[App] running: {}, frames: {}, bytes: {}, skipped: {}, queued: stream {} / record {}",
                    status.running,
                    status.frames,
                    status.bytes,
                    status.skipped,
                    status.stream_queued,
                    status.record_queued
                );
            }
            Command::Stop => self.stop.request_stop(),
        }
    }

    pub fn status(&self) -> AppStatus {
        let (frames, bytes, skipped) = self
            .frames
            .as_ref()
            .map(|f| {
                let stats = f.stats();
                (stats.frames_total, stats.bytes_total, stats.skipped_total)
            })
            .unwrap_or_default();
        AppStatus {
            running: self.is_running(),
            flags: self.flags(),
            frames,
            bytes,
            skipped,
            stream_queued: self.stream_queue.len(),
            record_queued: self.record_queue.len(),
        }
    }

    /// Join every worker and drain the queues, keeping the hardware so the
    /// pipeline can be started again
    pub fn stop_workers(&mut self) {
        let Some(mut workers) = self.workers.take() else {
            return;
        };

        // Phase one: loops exit at their next check
        workers.running.store(false, Ordering::SeqCst);

        // Phase two: unblock parked consumers, network first
        self.stream_queue.stop();
        if let Some(handle) = workers.net.take() {
            match handle.join() {
                Ok(stats) if stats.connected => {
                    log::info!("[App] Network worker joined ({} bytes sent)", stats.bytes)
                }
                Ok(_) => log::info!("[App] Network worker joined (never connected)"),
                Err(_) => log::error!("[App] Network worker panicked"),
            }
        }
        self.stream_queue.clear();

        self.record_queue.stop();
        if let Some(handle) = workers.rec.take() {
            if handle.join().is_err() {
                log::error!("[App] Recording worker panicked");
            }
        }
        self.record_queue.clear();

        if let Some(handle) = workers.audio.take() {
            match handle.join() {
                Ok(stats) => log::info!("[App] Audio worker joined ({} units)", stats.units_encoded),
                Err(_) => log::error!("[App] Audio worker panicked"),
            }
        }
        // Audio may have pushed after the consumers left
        self.stream_queue.clear();
        self.record_queue.clear();

        for queue in [&self.stream_queue, &self.record_queue] {
            let stats = queue.stats();
            log::info!(
                "[Queue] {}: {} pushed, {} evicted, {} rejected",
                queue.name(),
                stats.pushed,
                stats.evicted,
                stats.rejected
            );
        }

        if let Some(frames) = self.frames.as_mut() {
            frames.stop_capture();
        }
        log::info!("[App] Workers stopped");
    }

    /// Stop the workers, then release the hardware. Runs its teardown once.
    pub fn stop(&mut self) {
        self.stop_workers();
        if let Some(frames) = self.frames.take() {
            frames.shutdown();
            log::info!("[App] Hardware released");
        }
    }
}

impl Drop for StreamerApp {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_toggle_flips_and_reports_new_state() {
        let toggle = AiToggle::default();
        assert!(!toggle.is_enabled());
        assert!(toggle.toggle());
        assert!(toggle.is_enabled());
        assert!(!toggle.toggle());

        let shared = toggle.clone();
        shared.set(true);
        assert!(toggle.is_enabled());
    }

    #[test]
    fn stop_handle_is_shared_between_clones() {
        let handle = StopHandle::default();
        let signal_side = handle.clone();
        assert!(!handle.is_stop_requested());
        signal_side.request_stop();
        assert!(handle.is_stop_requested());
    }
}
