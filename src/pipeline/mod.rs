// Capture-to-output pipeline: orchestrator, queues and worker threads

pub mod app;
pub mod audio;
pub mod clock;
pub mod frame_loop;
pub mod overlay;
pub mod pusher;
pub mod queue;
pub mod recorder;

pub use app::{AiToggle, AppError, AppStatus, Command, Services, StopHandle, StreamerApp};
pub use audio::{AudioFactory, AudioStages};
pub use clock::PipelineClock;
pub use frame_loop::{FrameHardware, FramePipeline, StepOutcome};
pub use queue::{MediaKind, MediaPacket, PacketQueue};
pub use recorder::{RecorderState, SegmentRecorder};
