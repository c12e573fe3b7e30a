//! Capture backends (spec §4.2): a polymorphic decoder attachment that
//! spawns/controls an external decoder process and hands decoded frames
//! to a `FrameBus`.
//!
//! Represented as the tagged-variant sum type spec §9's REDESIGN note
//! calls for — `{FFmpeg, GStreamer, Local}` — rather than an inheritance
//! hierarchy, with a common capability set. Grounded on the teacher's
//! `camera.rs::CameraStream`, generalized from a single GStreamer-only
//! backend.

pub mod ffmpeg;
pub mod gstreamer_backend;
pub mod local;
pub mod stderr_tail;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{Backend, ResolvedCameraSpec};
use crate::error::ErrorCode;

/// One raw decoded frame handed from a capture backend's reader task to
/// the pipeline, which republishes it onto the camera's `FrameBus`.
#[derive(Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub format: crate::bus::PixelFormat,
    pub payload: Arc<[u8]>,
}

/// Terminal outcome of a capture backend's run, classified per §6.3.
#[derive(Debug, Clone)]
pub struct CaptureFailure {
    pub code: ErrorCode,
    pub reason: String,
    pub stderr_tail: Vec<String>,
}

/// Events a running `CaptureSource` emits to the pipeline that owns it.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(DecodedFrame),
    Ready,
    Failed(CaptureFailure),
}

/// Handle to a running decoder process for one camera. Exactly one of
/// these may exist per camera at any instant (spec §3 invariant).
pub struct CaptureSource {
    events: mpsc::Receiver<CaptureEvent>,
    stop_tx: tokio::sync::watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl CaptureSource {
    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.events.recv().await
    }

    /// Stop semantics (spec §5): ask the reader task to terminate the
    /// decoder gracefully; the reader itself escalates to a kill after
    /// its own grace period.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Pick the first backend in `backend_priority` whose required tool is
/// available, skipping `local` unless `for_display` (already enforced by
/// `ResolvedCameraSpec::backend_priority` at resolution time).
pub fn select_backend(spec: &ResolvedCameraSpec) -> Option<Backend> {
    spec.backend_priority
        .iter()
        .copied()
        .find(|b| backend_available(*b))
}

fn backend_available(backend: Backend) -> bool {
    match backend {
        Backend::Ffmpeg => which("ffmpeg"),
        Backend::Gstreamer => which("gst-launch-1.0") || gstreamer::init().is_ok(),
        Backend::Local => true,
    }
}

fn which(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
        })
        .unwrap_or(false)
}

/// Start the selected backend for `spec`. `transport` overrides the
/// resolved transport preference for this particular invocation (used by
/// the transport auto-retry in §4.2.3: first tcp, then udp).
pub fn start(
    spec: &ResolvedCameraSpec,
    backend: Backend,
    transport: crate::config::TransportPreference,
    extra_flags: &str,
    rtsp_stimeout_usec: u64,
    ffmpeg_reconnect_delay_secs: u64,
    ready_timeout: Duration,
) -> CaptureSource {
    let (events_tx, events_rx) = mpsc::channel(32);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let spec = spec.clone();
    let extra_flags = extra_flags.to_string();
    let join = tokio::spawn(async move {
        match backend {
            Backend::Ffmpeg => {
                ffmpeg::run(
                    &spec,
                    transport,
                    &extra_flags,
                    rtsp_stimeout_usec,
                    ffmpeg_reconnect_delay_secs,
                    ready_timeout,
                    events_tx,
                    stop_rx,
                )
                .await
            }
            Backend::Gstreamer => {
                gstreamer_backend::run(&spec, events_tx, stop_rx).await
            }
            Backend::Local => local::run(&spec, events_tx, stop_rx).await,
        }
    });

    CaptureSource {
        events: events_rx,
        stop_tx,
        join,
    }
}
