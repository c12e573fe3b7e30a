//! FFmpeg backend (spec §4.2.1): primary decoder. Builds the argv for
//! RTSP/HTTP-MJPEG/local sources, spawns the process, and reads either
//! fixed-size rawvideo frames or MJPEG segments from its stdout.
//!
//! Grounded on `other_examples/9ca16053_..-ffmpeg.rs`'s
//! `tokio::process::Command` + `Stdio::piped()` spawn pattern, and on the
//! teacher's `camera.rs::CameraStream::connect` readiness/reader shape.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::stderr_tail::StderrTail;
use super::{CaptureEvent, CaptureFailure, DecodedFrame};
use crate::bus::PixelFormat;
use crate::config::{CameraMode, ResolvedCameraSpec, TransportPreference};
use crate::error::ErrorCode;
use crate::mask::scrub;

const STDERR_TAIL_CAPACITY: usize = 40;
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Build the FFmpeg argv for `spec` per spec §4.2.1.
pub fn build_argv(
    spec: &ResolvedCameraSpec,
    transport: TransportPreference,
    extra_flags: &str,
    rtsp_stimeout_usec: u64,
    ffmpeg_reconnect_delay_secs: u64,
) -> Vec<String> {
    let mut args = vec![
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
        "-hide_banner".into(),
    ];

    match spec.mode {
        CameraMode::Rtsp => {
            let transport_str = match transport {
                TransportPreference::Udp => "udp",
                _ => "tcp",
            };
            args.extend([
                "-rtsp_transport".into(),
                transport_str.into(),
                "-fflags".into(),
                "nobuffer".into(),
                "-flags".into(),
                "low_delay".into(),
                "-analyzeduration".into(),
                "0".into(),
                "-probesize".into(),
                "32".into(),
                "-stimeout".into(),
                rtsp_stimeout_usec.to_string(),
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                ffmpeg_reconnect_delay_secs.to_string(),
                "-an".into(),
            ]);
        }
        CameraMode::Http => {
            args.extend(["-an".into()]);
        }
        CameraMode::Local => {
            args.extend(["-an".into()]);
        }
    }

    args.extend(["-i".into(), spec.uri.clone()]);

    if !extra_flags.trim().is_empty() {
        for flag in extra_flags.split_whitespace() {
            args.push(flag.to_string());
        }
    }

    if let Some(scale) = spec.resolution.as_ffmpeg_scale() {
        args.extend(["-s".into(), scale]);
    }

    match spec.mode {
        CameraMode::Http => {
            args.extend(["-f".into(), "mjpeg".into(), "-".into()]);
        }
        _ => {
            args.extend(["-f".into(), "rawvideo".into(), "-pix_fmt".into(), "bgr24".into(), "-".into()]);
        }
    }

    args
}

pub async fn run(
    spec: &ResolvedCameraSpec,
    transport: TransportPreference,
    extra_flags: &str,
    rtsp_stimeout_usec: u64,
    ffmpeg_reconnect_delay_secs: u64,
    ready_timeout: Duration,
    events: mpsc::Sender<CaptureEvent>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let rawvideo = spec.mode != CameraMode::Http;
    let (width, height) = match spec.resolution.as_ffmpeg_scale() {
        Some(_) => match spec.resolution {
            crate::config::Resolution::Fixed { width, height } => (width, height),
            crate::config::Resolution::Original => (0, 0),
        },
        None => (0, 0),
    };

    if rawvideo && (width == 0 || height == 0) {
        // Caller didn't pin a resolution; the probe step is responsible
        // for filling this in before `run` is invoked in production.
        // Fall back to a conservative default so the reader has a frame
        // size to key off of instead of hanging forever.
        warn!(camera = %spec.id, "no resolution pinned for rawvideo capture, using probe fallback 1280x720");
    }
    let (width, height) = if rawvideo && (width == 0 || height == 0) {
        (1280, 720)
    } else {
        (width, height)
    };

    let argv = build_argv(spec, transport, extra_flags, rtsp_stimeout_usec, ffmpeg_reconnect_delay_secs);
    info!(camera = %spec.id, argv = %scrub(&argv.join(" ")), "spawning ffmpeg");

    let mut cmd = Command::new("ffmpeg");
    cmd.args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: ErrorCode::DecoderMissing,
                    reason: format!("failed to spawn ffmpeg: {e}"),
                    stderr_tail: vec![],
                }))
                .await;
            return;
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let tail = Arc::new(tokio::sync::Mutex::new(StderrTail::new(STDERR_TAIL_CAPACITY)));
    let tail_writer = tail.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail_writer.lock().await.push(&line);
        }
    });

    let reader_task = read_frames(
        stdout,
        rawvideo,
        width,
        height,
        spec.ready_frames,
        spec.ready_duration_ms,
        ready_timeout,
        events.clone(),
    );

    tokio::select! {
        _ = stop.changed() => {
            terminate(&mut child).await;
        }
        exit = run_until_exit(&mut child, reader_task) => {
            let code = exit;
            let stderr_lines = tail.lock().await.snapshot();
            let classified = tail.lock().await.classify(code);
            let _ = events
                .send(CaptureEvent::Failed(CaptureFailure {
                    code: classified,
                    reason: format!("ffmpeg exited with code {:?}", code),
                    stderr_tail: stderr_lines,
                }))
                .await;
        }
    }

    stderr_task.abort();
}

async fn run_until_exit(
    child: &mut Child,
    reader: impl std::future::Future<Output = ()>,
) -> Option<i32> {
    tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()),
        _ = reader => {
            // Reader ended (short read/EOF) before the process reported exit;
            // wait briefly for the real exit code.
            match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => None,
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(id) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc_kill(id as i32, 15); // SIGTERM
        }
        let _ = id;
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

async fn read_frames(
    mut stdout: tokio::process::ChildStdout,
    rawvideo: bool,
    width: u32,
    height: u32,
    ready_frames: u32,
    ready_duration_ms: u64,
    ready_timeout: Duration,
    events: mpsc::Sender<CaptureEvent>,
) {
    let frame_size = (width as usize) * (height as usize) * 3;
    let start = Instant::now();
    let mut delivered = 0u32;
    let mut first_frame_at: Option<Instant> = None;
    let mut ready_sent = false;

    loop {
        if !ready_sent && start.elapsed() > ready_timeout {
            // Readiness timeout: let the caller observe this via channel
            // closure/Failed event from the exit path.
            return;
        }

        let frame = if rawvideo {
            read_rawvideo_frame(&mut stdout, frame_size).await
        } else {
            read_mjpeg_frame(&mut stdout).await
        };

        let Some(payload) = frame else {
            return; // short read / EOF
        };

        let decoded = DecodedFrame {
            width,
            height,
            format: if rawvideo { PixelFormat::Bgr24 } else { PixelFormat::Mjpeg },
            payload,
        };

        if events.send(CaptureEvent::Frame(decoded)).await.is_err() {
            return;
        }

        delivered += 1;
        if first_frame_at.is_none() {
            first_frame_at = Some(Instant::now());
        }

        if !ready_sent {
            let duration_ok = ready_duration_ms > 0
                && first_frame_at.map(|t| t.elapsed().as_millis() as u64 >= ready_duration_ms).unwrap_or(false);
            let count_ok = ready_frames > 0 && delivered >= ready_frames;
            if count_ok || duration_ok || (ready_frames == 0 && ready_duration_ms == 0) {
                ready_sent = true;
                if events.send(CaptureEvent::Ready).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_rawvideo_frame(stdout: &mut tokio::process::ChildStdout, frame_size: usize) -> Option<Arc<[u8]>> {
    if frame_size == 0 {
        return None;
    }
    let mut buf = vec![0u8; frame_size];
    match stdout.read_exact(&mut buf).await {
        Ok(_) => Some(Arc::from(buf)),
        Err(_) => None,
    }
}

/// Read one MJPEG segment by scanning for SOI (`FFD8`) ... EOI (`FFD9`)
/// markers, matching the JPEG marker scanning idiom in
/// `rust-mjpeg-rtp/src/rtp/jpeg_parser.rs`.
async fn read_mjpeg_frame(stdout: &mut tokio::process::ChildStdout) -> Option<Arc<[u8]>> {
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut byte = [0u8; 1];

    // Seek to SOI.
    loop {
        if stdout.read_exact(&mut byte).await.is_err() {
            return None;
        }
        if byte[0] == 0xFF {
            if stdout.read_exact(&mut byte).await.is_err() {
                return None;
            }
            if byte[0] == 0xD8 {
                buf.push(0xFF);
                buf.push(0xD8);
                break;
            }
        }
    }

    loop {
        if stdout.read_exact(&mut byte).await.is_err() {
            return None;
        }
        buf.push(byte[0]);
        if byte[0] == 0xFF {
            if stdout.read_exact(&mut byte).await.is_err() {
                return None;
            }
            buf.push(byte[0]);
            if byte[0] == 0xD9 {
                return Some(Arc::from(buf));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, CameraMode, Resolution, TransportPreference};

    fn spec() -> ResolvedCameraSpec {
        ResolvedCameraSpec {
            id: "cam1".into(),
            mode: CameraMode::Rtsp,
            uri: "rtsp://user:pw@10.0.0.5/stream".into(),
            transport_preference: TransportPreference::Tcp,
            resolution: Resolution::Fixed { width: 1280, height: 720 },
            ready_frames: 1,
            ready_duration_ms: 0,
            ready_timeout_ms: 15_000,
            backend_priority: vec![Backend::Ffmpeg],
            extra_decoder_flags: String::new(),
        }
    }

    #[test]
    fn argv_matches_spec_shape() {
        let argv = build_argv(&spec(), TransportPreference::Tcp, "", 5_000_000, 2);
        let joined = argv.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-i rtsp://user:pw@10.0.0.5/stream"));
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.ends_with("-f rawvideo -pix_fmt bgr24 -"));
    }

    #[test]
    fn http_mode_uses_mjpeg_output() {
        let mut s = spec();
        s.mode = CameraMode::Http;
        s.uri = "http://10.0.0.5/mjpeg".into();
        let argv = build_argv(&s, TransportPreference::Tcp, "", 5_000_000, 2);
        assert!(argv.join(" ").ends_with("-f mjpeg -"));
    }

    #[test]
    fn extra_flags_appended_after_input() {
        let argv = build_argv(&spec(), TransportPreference::Tcp, "-vf fps=10", 5_000_000, 2);
        let joined = argv.join(" ");
        let i_pos = joined.find("-i ").unwrap();
        let flag_pos = joined.find("-vf fps=10").unwrap();
        assert!(flag_pos > i_pos);
    }
}
