//! Local device backend (spec §4.2): captures from an attached webcam via
//! a platform capture API instead of spawning an external decoder. Only
//! consulted when `ResolvedCameraSpec::backend_priority` was resolved
//! `for_display` (spec §3), since local devices are exclusive-access and
//! unsuited to headless always-on capture.
//!
//! Grounded on `walterlow-snapit/src-tauri/.../webcam/feed.rs`'s
//! `nokhwa::Camera` polling loop on a dedicated OS thread; frames are
//! normalized onto the shared raw-BGR bus contract (spec §9 Open Question)
//! rather than kept as a separate YUYV/MJPEG fast path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{CaptureEvent, CaptureFailure, DecodedFrame};
use crate::bus::PixelFormat;
use crate::config::ResolvedCameraSpec;
use crate::error::ErrorCode;

/// `local` URIs are `device:<index>`, e.g. `device:0` for the first
/// attached camera.
fn parse_device_index(uri: &str) -> Option<u32> {
    uri.strip_prefix("device:").and_then(|s| s.parse().ok())
}

pub async fn run(
    spec: &ResolvedCameraSpec,
    events: mpsc::Sender<CaptureEvent>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let Some(index) = parse_device_index(&spec.uri) else {
        let _ = events
            .send(CaptureEvent::Failed(CaptureFailure {
                code: ErrorCode::InvalidSpec,
                reason: format!("local camera uri '{}' is not 'device:<index>'", spec.uri),
                stderr_tail: vec![],
            }))
            .await;
        return;
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<DecodedFrame>(4);
    let (ready_tx, mut ready_rx) = mpsc::channel::<Result<(), String>>(1);
    let camera_id = spec.id.clone();
    let stop_for_thread = stop.clone();

    let capture_thread = std::thread::Builder::new()
        .name(format!("local-capture-{camera_id}"))
        .spawn(move || capture_loop(index, frame_tx, ready_tx, stop_for_thread))
        .expect("spawn local capture thread");

    match ready_rx.recv().await {
        Some(Ok(())) => {}
        Some(Err(reason)) => {
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: ErrorCode::ConnectFailed,
                    reason,
                    stderr_tail: vec![],
                }))
                .await;
            return;
        }
        None => {
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: ErrorCode::ConnectFailed,
                    reason: "local capture thread exited before reporting readiness".into(),
                    stderr_tail: vec![],
                }))
                .await;
            return;
        }
    }

    info!(camera = %spec.id, device = index, "local camera capture started");
    let mut ready_sent = false;
    let mut delivered = 0u32;
    let mut first_frame_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if events.send(CaptureEvent::Frame(frame)).await.is_err() {
                            break;
                        }
                        delivered += 1;
                        if first_frame_at.is_none() {
                            first_frame_at = Some(Instant::now());
                        }
                        if !ready_sent {
                            let duration_ok = spec.ready_duration_ms > 0
                                && first_frame_at
                                    .map(|t| t.elapsed().as_millis() as u64 >= spec.ready_duration_ms)
                                    .unwrap_or(false);
                            let count_ok = spec.ready_frames > 0 && delivered >= spec.ready_frames;
                            if count_ok || duration_ok || (spec.ready_frames == 0 && spec.ready_duration_ms == 0) {
                                ready_sent = true;
                                if events.send(CaptureEvent::Ready).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        let _ = events
                            .send(CaptureEvent::Failed(CaptureFailure {
                                code: ErrorCode::ReadTimeout,
                                reason: "local capture thread stopped producing frames".into(),
                                stderr_tail: vec![],
                            }))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let _ = capture_thread.join();
}

/// Runs on a dedicated OS thread: `nokhwa::Camera` is blocking and owns
/// exclusive device access for its lifetime.
fn capture_loop(
    device_index: u32,
    frame_tx: mpsc::Sender<DecodedFrame>,
    ready_tx: mpsc::Sender<Result<(), String>>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(CameraIndex::Index(device_index), requested) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.blocking_send(Err(format!("failed to open device {device_index}: {e}")));
            return;
        }
    };

    if let Err(e) = camera.open_stream() {
        let _ = ready_tx.blocking_send(Err(format!("failed to open stream: {e}")));
        return;
    }

    let resolution = camera.resolution();
    let (width, height) = (resolution.width(), resolution.height());
    let _ = ready_tx.blocking_send(Ok(()));

    loop {
        if *stop.borrow() {
            break;
        }
        match camera.frame() {
            Ok(buffer) => {
                let decoded = match buffer.decode_image::<RgbFormat>() {
                    Ok(img) => img,
                    Err(e) => {
                        warn!(device = device_index, error = %e, "local frame decode failed");
                        continue;
                    }
                };
                let bgr: Vec<u8> = decoded
                    .as_raw()
                    .chunks_exact(3)
                    .flat_map(|px| [px[2], px[1], px[0]])
                    .collect();
                let frame = DecodedFrame {
                    width,
                    height,
                    format: PixelFormat::Bgr24,
                    payload: Arc::from(bgr),
                };
                if frame_tx.blocking_send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(device = device_index, error = %e, "local frame capture error");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    let _ = camera.stop_stream();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_index_uri() {
        assert_eq!(parse_device_index("device:0"), Some(0));
        assert_eq!(parse_device_index("device:3"), Some(3));
        assert_eq!(parse_device_index("rtsp://host/stream"), None);
    }
}
