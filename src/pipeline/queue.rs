// Bounded packet queues between the capture loop and the network/record workers
//
// The producer (capture/encode loop, audio thread) must never block, so a full
// queue evicts its oldest entry instead of applying backpressure. Consumers park
// in `pop()` until data arrives or the queue is stopped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Default queue depth (about two seconds of 30 fps video)
pub const DEFAULT_QUEUE_CAPACITY: usize = 60;

/// Minimum spacing between two eviction warnings of the same queue
const EVICTION_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Kind of access unit carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One encoded access unit.
///
/// The payload is owned exclusively by the packet and is released when the
/// packet is dropped. Packets are deliberately not `Clone`: each consumer
/// receives its own copy from the producer.
#[derive(Debug, PartialEq, Eq)]
pub struct MediaPacket {
    data: Box<[u8]>,
    /// Presentation timestamp in milliseconds since pipeline start
    pub timestamp_ms: u64,
    pub keyframe: bool,
    pub kind: MediaKind,
}

impl MediaPacket {
    /// Deep-copy `bytes` into a new packet. Returns `None` when the
    /// allocation cannot be satisfied.
    pub fn copy_from(bytes: &[u8], timestamp_ms: u64, keyframe: bool, kind: MediaKind) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len()).ok()?;
        data.extend_from_slice(bytes);
        Some(Self {
            data: data.into_boxed_slice(),
            timestamp_ms,
            keyframe,
            kind,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

/// Counters reported when a pipeline stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub evicted: u64,
    pub rejected: u64,
    /// Congestion warnings actually logged (at most one per interval)
    pub eviction_warnings: u64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
    stats: QueueStats,
    last_eviction_log: Option<Instant>,
}

/// Thread-safe FIFO with a drop-oldest admission policy.
///
/// `len() <= capacity()` holds after every push. Once stopped, `pop()` drains
/// what is left and then returns `None` without blocking.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
                stats: QueueStats::default(),
                last_eviction_log: None,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item, evicting the oldest one if the queue is full.
    /// Never blocks on consumers.
    pub fn push(&self, item: T) {
        self.push_at(item, Instant::now());
    }

    /// `push` with the eviction-warning rate limit evaluated at `now`
    pub fn push_at(&self, item: T, now: Instant) {
        let mut state = self.state.lock();

        if state.items.len() >= self.capacity {
            // Drop happens here, outside of any consumer's hands
            drop(state.items.pop_front());
            state.stats.evicted += 1;

            let should_log = state
                .last_eviction_log
                .map_or(true, |last| now.saturating_duration_since(last) >= EVICTION_LOG_INTERVAL);
            if should_log {
                log::warn!(
                    "[Queue] {} congested, dropping oldest packets (capacity {}, {} dropped so far)",
                    self.name,
                    self.capacity,
                    state.stats.evicted
                );
                state.last_eviction_log = Some(now);
                state.stats.eviction_warnings += 1;
            }
        }

        state.items.push_back(item);
        state.stats.pushed += 1;
        drop(state);
        self.ready.notify_one();
    }

    /// Block until an item is available or the queue is stopped.
    /// Returns `None` only when stopped and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.stopped {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Raise the stop condition and wake every parked consumer. Idempotent.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.ready.notify_all();
    }

    /// Clear the stop condition so the queue can serve a new run
    pub fn reopen(&self) {
        self.state.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Release every queued item. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            state.items.drain(..).collect()
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}

/// Queue of encoded media shared between one producer set and one consumer
pub type PacketQueue = BoundedQueue<MediaPacket>;

impl BoundedQueue<MediaPacket> {
    /// Copy `bytes` into an owned packet and enqueue it.
    ///
    /// If the copy cannot be allocated the packet is dropped silently and
    /// `false` is returned; the caller's hot path is never interrupted.
    pub fn push_copy(&self, bytes: &[u8], timestamp_ms: u64, keyframe: bool, kind: MediaKind) -> bool {
        match MediaPacket::copy_from(bytes, timestamp_ms, keyframe, kind) {
            Some(packet) => {
                self.push(packet);
                true
            }
            None => {
                self.state.lock().stats.rejected += 1;
                log::debug!("[Queue] {}: allocation of {} bytes failed, packet dropped", self.name, bytes.len());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn video(ts: u64) -> MediaPacket {
        MediaPacket::copy_from(&ts.to_be_bytes(), ts, false, MediaKind::Video).unwrap()
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let queue = PacketQueue::new("test", 5);
        for ts in 0..50 {
            queue.push(video(ts));
            assert!(queue.len() <= 5);
        }
        assert_eq!(queue.stats().evicted, 45);
    }

    #[test]
    fn full_queue_drops_the_oldest_packet() {
        let capacity = 4;
        let queue = PacketQueue::new("test", capacity);
        for ts in 1..=(capacity as u64 + 1) {
            queue.push(video(ts));
        }
        queue.stop();

        let mut drained = Vec::new();
        while let Some(packet) = queue.pop() {
            drained.push(packet.timestamp_ms);
        }
        assert_eq!(drained, vec![2, 3, 4, 5]);
    }

    #[test]
    fn push_copy_owns_an_independent_buffer() {
        let queue = PacketQueue::new("test", 2);
        let mut source = vec![1u8, 2, 3];
        assert!(queue.push_copy(&source, 7, true, MediaKind::Video));
        source[0] = 99;

        let packet = queue.pop().unwrap();
        assert_eq!(packet.data(), &[1, 2, 3]);
        assert_eq!(packet.timestamp_ms, 7);
        assert!(packet.keyframe);
        assert!(packet.is_video());
    }

    #[test]
    fn stop_unblocks_a_parked_consumer() {
        let queue = Arc::new(PacketQueue::new("test", 4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        queue.stop();
        queue.stop();

        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn stopped_queue_drains_before_reporting_end() {
        let queue = PacketQueue::new("test", 4);
        queue.push(video(1));
        queue.push(video(2));
        queue.stop();

        assert_eq!(queue.pop().map(|p| p.timestamp_ms), Some(1));
        assert_eq!(queue.pop().map(|p| p.timestamp_ms), Some(2));
        assert!(queue.pop().is_none());

        queue.reopen();
        queue.push(video(3));
        assert_eq!(queue.pop().map(|p| p.timestamp_ms), Some(3));
    }

    #[test]
    fn eviction_warning_is_logged_once_per_interval() {
        let queue = BoundedQueue::new("test", 4);
        let start = Instant::now();

        for i in 0..100 {
            queue.push_at(i, start);
        }
        let stats = queue.stats();
        assert_eq!(stats.evicted, 96);
        assert_eq!(stats.eviction_warnings, 1);

        queue.push_at(100, start + Duration::from_millis(999));
        assert_eq!(queue.stats().eviction_warnings, 1);

        queue.push_at(101, start + EVICTION_LOG_INTERVAL);
        queue.push_at(102, start + EVICTION_LOG_INTERVAL);
        assert_eq!(queue.stats().eviction_warnings, 2);
        assert_eq!(queue.len(), 4);
    }

    struct Tracked {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_item_is_released_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = BoundedQueue::new("tracked", 3);
        for _ in 0..5 {
            queue.push(Tracked { drops: drops.clone() });
        }
        // Two evictions so far
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        let popped = queue.pop().unwrap();
        drop(popped);
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        assert_eq!(queue.clear(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 5);

        queue.push(Tracked { drops: drops.clone() });
        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_order() {
        let queue = Arc::new(PacketQueue::new("test", 1000));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for ts in 0..500 {
                    queue.push(video(ts));
                }
                queue.stop();
            })
        };

        let mut last = None;
        let mut count = 0;
        while let Some(packet) = queue.pop() {
            if let Some(prev) = last {
                assert!(packet.timestamp_ms > prev);
            }
            last = Some(packet.timestamp_ms);
            count += 1;
        }
        producer.join().unwrap();
        assert_eq!(count, 500);
    }
}
