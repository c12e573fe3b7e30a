//! Watchdog (spec §4.6... actually §4.5/§2): periodic sweep that detects
//! stalled captures (no frame for `NO_FRAME_TIMEOUT_MS`) and triggers a
//! reconnect.
//!
//! Grounded on the teacher's background-task idiom — `global_writer`'s
//! `tokio::spawn` + channel-drain loop — generalized here to a periodic
//! `tokio::time::interval` sweep shared across every registered camera.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::interval;
use tracing::debug;

use crate::bus::FrameBus;

/// One entry the watchdog polls: a bus plus the last sequence it saw.
pub struct WatchedCamera {
    pub camera_id: String,
    pub bus: Arc<FrameBus>,
    pub last_seen_sequence: AsyncMutex<u64>,
    pub last_seen_at: AsyncMutex<Instant>,
}

/// A camera is considered stalled if no new frame has arrived within
/// `no_frame_timeout`. The callback is invoked once per stall detection
/// (the caller — the pipeline — debounces repeat calls by transitioning
/// its own ReconnectController out of READY).
pub struct Watchdog {
    interval: Duration,
    no_frame_timeout: Duration,
}

impl Watchdog {
    pub fn new(poll_interval: Duration, no_frame_timeout: Duration) -> Self {
        Self {
            interval: poll_interval,
            no_frame_timeout,
        }
    }

    /// Run the sweep loop until `shutdown` fires. `on_stall` is called
    /// with the camera id whenever a watched camera has gone silent.
    pub async fn run<F>(
        &self,
        cameras: Arc<tokio::sync::RwLock<Vec<Arc<WatchedCamera>>>>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        on_stall: F,
    ) where
        F: Fn(&str),
    {
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let watched = cameras.read().await.clone();
            for cam in watched {
                let info = cam.bus.info();
                let mut last_seen_sequence = cam.last_seen_sequence.lock().await;
                let mut last_seen_at = cam.last_seen_at.lock().await;

                // Any frame newer than what we last observed resets the clock.
                let bus_newest = cam.bus.get_latest(*last_seen_sequence, Duration::from_millis(0));
                if let crate::bus::GetLatestResult::Frame(frame) = bus_newest {
                    if frame.sequence > *last_seen_sequence {
                        *last_seen_sequence = frame.sequence;
                        *last_seen_at = Instant::now();
                        continue;
                    }
                }

                if last_seen_at.elapsed() >= self.no_frame_timeout {
                    debug!(camera = %cam.camera_id, width = info.width, height = info.height, "watchdog: stall detected");
                    on_stall(&cam.camera_id);
                    // Don't spam: push the clock forward so we don't refire
                    // every tick while the reconnect controller catches up.
                    *last_seen_at = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn detects_stall_after_timeout() {
        let bus = Arc::new(FrameBus::new(3));
        bus.put(4, 4, PixelFormat::Bgr24, Arc::from(vec![0u8; 4]));

        let watched = Arc::new(WatchedCamera {
            camera_id: "cam1".into(),
            bus: bus.clone(),
            last_seen_sequence: AsyncMutex::new(0),
            last_seen_at: AsyncMutex::new(Instant::now() - Duration::from_millis(500)),
        });
        let cameras = Arc::new(tokio::sync::RwLock::new(vec![watched]));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let wd = Watchdog::new(Duration::from_millis(10), Duration::from_millis(100));

        let stalls = Arc::new(AtomicUsize::new(0));
        let stalls_clone = stalls.clone();

        let run = tokio::spawn(async move {
            wd.run(cameras, rx, move |_id| {
                stalls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        let _ = run.await;

        assert!(stalls.load(Ordering::SeqCst) >= 1);
    }
}
