// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! GStreamer fallback backend (spec §4.2): used when `ffmpeg` is missing
//! from `PATH` or a camera's `backend_priority` puts it first.
//!
//! Grounded on the teacher's `camera.rs::CameraStream::connect` —
//! `gst::parse::launch` + `AppSinkCallbacks::new_sample` — retargeted from
//! an MPEG-TS-muxing pipeline onto the shared raw-BGR bus contract every
//! backend produces.

use std::sync::Arc;
use std::time::Instant;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{CaptureEvent, CaptureFailure, DecodedFrame};
use crate::bus::PixelFormat;
use crate::config::{CameraMode, Resolution, ResolvedCameraSpec};
use crate::error::ErrorCode;

pub async fn run(
    spec: &ResolvedCameraSpec,
    events: mpsc::Sender<CaptureEvent>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    if let Err(e) = gst::init() {
        let _ = events
            .send(CaptureEvent::Failed(CaptureFailure {
                code: ErrorCode::DecoderMissing,
                reason: format!("gst::init failed: {e}"),
                stderr_tail: vec![],
            }))
            .await;
        return;
    }

    let (width, height) = match spec.resolution {
        Resolution::Fixed { width, height } => (width, height),
        Resolution::Original => (0, 0),
    };
    let caps = if width > 0 && height > 0 {
        format!("video/x-raw,format=BGR,width={width},height={height}")
    } else {
        "video/x-raw,format=BGR".to_string()
    };

    let pipeline_str = match spec.mode {
        CameraMode::Rtsp => format!(
            "rtspsrc location={url} latency=0 protocols={protocols} ! \
             decodebin ! videoconvert ! {caps} ! \
             appsink name=sink emit-signals=true max-buffers=4 drop=true sync=false",
            url = spec.uri,
            protocols = match spec.transport_preference {
                crate::config::TransportPreference::Udp => "udp",
                _ => "tcp",
            },
        ),
        _ => format!(
            "uridecodebin uri={url} ! videoconvert ! {caps} ! \
             appsink name=sink emit-signals=true max-buffers=4 drop=true sync=false",
            url = spec.uri,
        ),
    };

    let pipeline = match gst::parse::launch(&pipeline_str) {
        Ok(el) => match el.downcast::<gst::Pipeline>() {
            Ok(p) => p,
            Err(_) => {
                let _ = events
                    .send(CaptureEvent::Failed(CaptureFailure {
                        code: ErrorCode::DecoderMissing,
                        reason: "launched element is not a pipeline".into(),
                        stderr_tail: vec![],
                    }))
                    .await;
                return;
            }
        },
        Err(e) => {
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: ErrorCode::ConnectFailed,
                    reason: format!("gst parse_launch failed: {e}"),
                    stderr_tail: vec![],
                }))
                .await;
            return;
        }
    };

    let appsink: gst_app::AppSink = match pipeline
        .by_name("sink")
        .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
    {
        Some(s) => s,
        None => {
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: ErrorCode::DecoderMissing,
                    reason: "appsink not found in pipeline".into(),
                    stderr_tail: vec![],
                }))
                .await;
            return;
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<DecodedFrame>(8);
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                let s = caps.structure(0).ok_or(gst::FlowError::Error)?;
                let w: i32 = s.get("width").unwrap_or(width as i32);
                let h: i32 = s.get("height").unwrap_or(height as i32);
                let frame = DecodedFrame {
                    width: w as u32,
                    height: h as u32,
                    format: PixelFormat::Bgr24,
                    payload: Arc::from(map.as_slice().to_vec()),
                };
                let _ = frame_tx.try_send(frame);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        let _ = events
            .send(CaptureEvent::Failed(CaptureFailure {
                code: ErrorCode::ConnectFailed,
                reason: format!("set_state Playing failed: {e}"),
                stderr_tail: vec![],
            }))
            .await;
        return;
    }
    info!(camera = %spec.id, "gstreamer pipeline started");

    let mut ready_sent = false;
    let mut delivered = 0u32;
    let mut first_frame_at: Option<Instant> = None;
    let bus = pipeline.bus();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                let _ = pipeline.set_state(gst::State::Null);
                break;
            }
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
                    None => break,
                }
            }
            msg = poll_bus(&bus) => {
                if let Some(err_msg) = msg {
                    warn!(camera = %spec.id, error = %err_msg, "gstreamer pipeline error");
                    let _ = pipeline.set_state(gst::State::Null);
                    let _ = events
                        .send(CaptureEvent::Failed(CaptureFailure {
                            code: ErrorCode::ConnectFailed,
                            reason: err_msg,
                            stderr_tail: vec![],
                        }))
                        .await;
                    break;
                }
            }
        }
    }

    let _ = pipeline.set_state(gst::State::Null);
}

async fn poll_bus(bus: &gst::Bus) -> Option<String> {
    use gst::MessageView;
    loop {
        tokio::task::yield_now().await;
        match bus.timed_pop(gst::ClockTime::from_mseconds(100)) {
            Some(msg) => match msg.view() {
                MessageView::Error(e) => return Some(e.error().to_string()),
                MessageView::Eos(_) => return Some("end of stream".into()),
                _ => continue,
            },
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}
