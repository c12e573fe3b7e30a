//! Frame bus (spec §3, §4.3): a fixed-capacity ring of the most recent
//! decoded frames for one camera, with non-blocking publish and a
//! bounded-wait "get latest since" read.
//!
//! Grounded on the teacher's `ChunkPool` (fixed-slot ring with rotation
//! on full) and on the fan-out shape of
//! `angkira-rpi-webrtc-streamer/rust/src/streaming/frame_distributor.rs`,
//! reworked to live entirely in memory: one `parking_lot::Mutex` guards
//! the ring, one `parking_lot::Condvar` wakes waiters on every `put`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Pixel format of a published frame. `Bgr24` is what the FFmpeg
/// `rawvideo` path emits; `Mjpeg` is a single JPEG-encoded frame as
/// produced by an HTTP-MJPEG source or the local backend's fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr24,
    Mjpeg,
}

/// One decoded frame, reference-counted so subscribers can borrow the
/// payload for the duration of an encode/write without copying pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: Instant,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub payload: Arc<[u8]>,
}

/// Latest-metadata snapshot returned by `FrameBus::info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusInfo {
    pub width: u32,
    pub height: u32,
    pub format: Option<PixelFormatInfo>,
    pub fps_in: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormatInfo {
    Bgr24,
    Mjpeg,
}

/// Outcome of a bounded `get_latest` wait.
#[derive(Debug, Clone)]
pub enum GetLatestResult {
    Frame(Frame),
    Timeout,
}

struct Inner {
    slots: Vec<Frame>,
    capacity: usize,
    next_write: usize,
    next_sequence: u64,
    /// EWMA of observed input fps, updated on every `put`.
    fps_ewma: f64,
    last_put_at: Option<Instant>,
}

impl Inner {
    fn latest(&self) -> Option<&Frame> {
        if self.slots.is_empty() {
            return None;
        }
        // The most recently written slot holds the highest sequence.
        self.slots.iter().max_by_key(|f| f.sequence)
    }

    fn newest_since(&self, last_seen_sequence: u64) -> Option<Frame> {
        self.slots
            .iter()
            .filter(|f| f.sequence > last_seen_sequence)
            .max_by_key(|f| f.sequence)
            .cloned()
    }
}

/// Fixed-capacity ring buffer of recent decoded frames for one camera.
///
/// `put` never blocks the producer: if the ring is full it overwrites the
/// oldest slot. `get_latest` blocks the *consumer* up to a timeout on a
/// condition variable. A single mutex guards metadata only — the payload
/// itself is an `Arc<[u8]>`, so a slow consumer holding an old `Frame`
/// clone never blocks the producer from overwriting the slot.
pub struct FrameBus {
    inner: Mutex<Inner>,
    new_frame: Condvar,
}

impl FrameBus {
    /// capacity N (default 3 per spec §3).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FrameBus capacity must be > 0");
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(capacity),
                capacity,
                next_write: 0,
                // Sequences start at 1 so a fresh subscriber's
                // `last_seen_sequence = 0` sentinel ("nothing observed
                // yet") is always strictly less than the first frame.
                next_sequence: 1,
                fps_ewma: 0.0,
                last_put_at: None,
            }),
            new_frame: Condvar::new(),
        }
    }

    /// Publish a newly decoded frame. Never blocks. Overwrites the oldest
    /// slot once the ring is full and notifies all waiters.
    pub fn put(&self, width: u32, height: u32, format: PixelFormat, payload: Arc<[u8]>) -> u64 {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let now = Instant::now();
        if let Some(prev) = inner.last_put_at {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                let instant_fps = 1.0 / dt;
                // 2-second EWMA window per spec §4.3.
                let alpha = (dt / 2.0).min(1.0);
                inner.fps_ewma = inner.fps_ewma + alpha * (instant_fps - inner.fps_ewma);
            }
        }
        inner.last_put_at = Some(now);

        let frame = Frame {
            sequence,
            timestamp: now,
            width,
            height,
            format,
            payload,
        };

        if inner.slots.len() < inner.capacity {
            inner.slots.push(frame);
        } else {
            let idx = inner.next_write;
            inner.slots[idx] = frame;
        }
        inner.next_write = (inner.next_write + 1) % inner.capacity;

        drop(inner);
        self.new_frame.notify_all();
        sequence
    }

    /// Block up to `timeout` for a frame with `sequence > last_seen_sequence`.
    /// Returns immediately if one is already present.
    pub fn get_latest(&self, last_seen_sequence: u64, timeout: Duration) -> GetLatestResult {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.newest_since(last_seen_sequence) {
            return GetLatestResult::Frame(frame);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return match inner.latest() {
                    Some(frame) if frame.sequence > last_seen_sequence => {
                        GetLatestResult::Frame(frame.clone())
                    }
                    _ => GetLatestResult::Timeout,
                };
            }
            let wait_for = deadline - now;
            let result = self.new_frame.wait_for(&mut inner, wait_for);
            if let Some(frame) = inner.newest_since(last_seen_sequence) {
                return GetLatestResult::Frame(frame);
            }
            if result.timed_out() {
                return GetLatestResult::Timeout;
            }
        }
    }

    /// Latest metadata snapshot: dimensions/format of the most recent
    /// publication plus the observed input fps.
    pub fn info(&self) -> BusInfo {
        let inner = self.inner.lock();
        match inner.latest() {
            Some(frame) => BusInfo {
                width: frame.width,
                height: frame.height,
                format: Some(match frame.format {
                    PixelFormat::Bgr24 => PixelFormatInfo::Bgr24,
                    PixelFormat::Mjpeg => PixelFormatInfo::Mjpeg,
                }),
                fps_in: inner.fps_ewma,
            },
            None => BusInfo::default(),
        }
    }

    /// Number of live frames currently held (bounded by capacity,
    /// independent of subscriber count — spec §8 property 3).
    pub fn live_frame_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Arc<[u8]> {
        Arc::from(vec![n; 8])
    }

    #[test]
    fn put_never_overflows_capacity() {
        let bus = FrameBus::new(3);
        for i in 0..10u8 {
            bus.put(4, 4, PixelFormat::Bgr24, payload(i));
        }
        assert_eq!(bus.live_frame_count(), 3);
    }

    #[test]
    fn sequence_is_strictly_monotonic() {
        let bus = FrameBus::new(3);
        let mut last = None;
        for i in 0..20u8 {
            let seq = bus.put(4, 4, PixelFormat::Bgr24, payload(i));
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        }
    }

    #[test]
    fn get_latest_returns_immediately_when_fresh_frame_exists() {
        let bus = FrameBus::new(3);
        bus.put(4, 4, PixelFormat::Bgr24, payload(1));
        let seq1 = bus.put(4, 4, PixelFormat::Bgr24, payload(2));
        match bus.get_latest(0, Duration::from_millis(50)) {
            GetLatestResult::Frame(f) => assert_eq!(f.sequence, seq1),
            GetLatestResult::Timeout => panic!("expected a frame"),
        }
    }

    #[test]
    fn get_latest_times_out_when_no_new_frame() {
        let bus = FrameBus::new(3);
        let seq = bus.put(4, 4, PixelFormat::Bgr24, payload(1));
        match bus.get_latest(seq, Duration::from_millis(30)) {
            GetLatestResult::Timeout => {}
            GetLatestResult::Frame(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn consumer_never_observes_out_of_order_frames() {
        let bus = FrameBus::new(3);
        let mut seen = 0u64;
        for i in 0..50u8 {
            bus.put(4, 4, PixelFormat::Bgr24, payload(i));
            if let GetLatestResult::Frame(f) = bus.get_latest(seen, Duration::from_millis(1)) {
                assert!(f.sequence > seen);
                seen = f.sequence;
            }
        }
    }

    #[test]
    fn info_reports_latest_dimensions() {
        let bus = FrameBus::new(3);
        bus.put(640, 480, PixelFormat::Bgr24, payload(1));
        bus.put(1280, 720, PixelFormat::Bgr24, payload(2));
        let info = bus.info();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
    }
}
