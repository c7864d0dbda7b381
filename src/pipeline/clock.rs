// Shared presentation-timestamp reference for audio and video producers

use std::time::Instant;

/// Monotonic clock anchored at pipeline start.
///
/// Audio and video stamp their packets against the same anchor so a single
/// muxer can interleave both streams.
#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    origin: Instant,
}

impl PipelineClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for PipelineClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_monotonic_and_shared_by_copies() {
        let clock = PipelineClock::start();
        let copy = clock;
        std::thread::sleep(std::time::Duration::from_millis(20));
        let first = clock.elapsed_ms();
        let second = copy.elapsed_ms();
        assert!(first >= 20);
        assert!(second >= first);
    }
}
