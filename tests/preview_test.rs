//! Integration tests for the multi-subscriber properties of §8: two
//! subscribers to the same camera observe byte-identical JPEGs for the
//! same bus sequence, and `hide()` drains existing subscribers while
//! rejecting new ones (S2 / S6).

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use camflux::bus::{FrameBus, PixelFormat};
use camflux::config::RuntimeConfig;
use camflux::preview::PreviewPublisher;

fn runtime_at_fps(fps: f64) -> RuntimeConfig {
    let mut rt = RuntimeConfig::default();
    rt.target_fps = fps;
    rt
}

fn bgr_payload(width: u32, height: u32, fill: u8) -> Arc<[u8]> {
    Arc::from(vec![fill; (width * height * 3) as usize])
}

/// Pull `n` JPEG parts out of a subscriber stream, returning each part's
/// payload bytes (the framing itself is asserted on separately).
async fn collect_jpegs(
    stream: &mut (impl tokio_stream::Stream<Item = std::io::Result<bytes::Bytes>> + Unpin),
    n: usize,
) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pending = Vec::new();
    while out.len() < n {
        let chunk = match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(bytes))) => bytes,
            _ => break,
        };
        pending.extend_from_slice(&chunk);

        loop {
            let Some(header_end) = find_subslice(&pending, b"\r\n\r\n") else { break };
            let header = String::from_utf8_lossy(&pending[..header_end]).to_string();
            let Some(len) = header
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.parse::<usize>().ok())
            else {
                break;
            };
            let body_start = header_end + 4;
            let body_end = body_start + len;
            let trailer_end = body_end + "\r\n--frame\r\n".len();
            if pending.len() < trailer_end {
                break;
            }
            out.push(pending[body_start..body_end].to_vec());
            pending.drain(..trailer_end);
        }
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[tokio::test]
async fn two_subscribers_see_byte_identical_jpeg_for_same_sequence() {
    let bus = Arc::new(FrameBus::new(3));
    let publisher = Arc::new(PreviewPublisher::new("cam1", bus.clone(), &runtime_at_fps(100.0)));

    bus.put(8, 8, PixelFormat::Bgr24, bgr_payload(8, 8, 200));

    let mut sub_a = Box::pin(publisher.subscribe().expect("subscribe a"));
    let mut sub_b = Box::pin(publisher.subscribe().expect("subscribe b"));

    let a = collect_jpegs(&mut sub_a, 1).await;
    let b = collect_jpegs(&mut sub_b, 1).await;

    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0], b[0], "encoded bytes for the same sequence must be shared, not re-encoded");
    assert!(a[0].starts_with(&[0xFF, 0xD8]), "must be a valid JPEG (SOI marker)");
}

#[tokio::test]
async fn mjpeg_source_bytes_pass_through_identically_to_every_subscriber() {
    let bus = Arc::new(FrameBus::new(3));
    let publisher = Arc::new(PreviewPublisher::new("cam1", bus.clone(), &runtime_at_fps(100.0)));

    let raw_jpeg: Vec<u8> = vec![0xFF, 0xD8, 0x11, 0x22, 0xFF, 0xD9];
    bus.put(0, 0, PixelFormat::Mjpeg, Arc::from(raw_jpeg.clone()));

    let mut sub = Box::pin(publisher.subscribe().expect("subscribe"));
    let parts = collect_jpegs(&mut sub, 1).await;

    assert_eq!(parts[0], raw_jpeg);
}

#[tokio::test]
async fn hide_rejects_new_subscriptions_but_drains_existing_ones() {
    let bus = Arc::new(FrameBus::new(3));
    let publisher = Arc::new(PreviewPublisher::new("cam1", bus.clone(), &runtime_at_fps(200.0)));
    bus.put(4, 4, PixelFormat::Bgr24, bgr_payload(4, 4, 9));

    let mut existing = Box::pin(publisher.subscribe().expect("subscribe before hide"));
    // Pull at least one part before hiding so the stream has started.
    let _ = collect_jpegs(&mut existing, 1).await;

    publisher.hide();

    // A brand new subscription is rejected outright (spec §4.4, S6).
    assert!(publisher.subscribe().is_err());

    // The pre-existing subscription still drains (gets a final part, then
    // the stream ends) rather than being killed mid-write.
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        let mut saw_any = false;
        loop {
            match existing.next().await {
                Some(Ok(_)) => saw_any = true,
                _ => break,
            }
        }
        saw_any
    })
    .await
    .unwrap_or(false);

    assert!(drained, "existing subscriber should observe at least its final frame before disconnect");
}

#[tokio::test]
async fn subscribing_while_hidden_is_always_rejected() {
    let bus = Arc::new(FrameBus::new(3));
    let publisher = Arc::new(PreviewPublisher::new("cam1", bus.clone(), &runtime_at_fps(100.0)));
    publisher.hide();
    assert!(publisher.subscribe().is_err());
    publisher.show();
    assert!(publisher.subscribe().is_ok());
}

#[tokio::test]
async fn unpolled_subscriber_does_not_block_an_actively_polled_one() {
    let bus = Arc::new(FrameBus::new(3));
    let publisher = Arc::new(PreviewPublisher::new("cam1", bus.clone(), &runtime_at_fps(50.0)));
    bus.put(4, 4, PixelFormat::Bgr24, bgr_payload(4, 4, 1));

    // A subscriber that is created but never polled (stand-in for a
    // stalled writer, spec §8 property 4 / S3).
    let _slow = publisher.subscribe().expect("slow subscriber");

    let mut fast = Box::pin(publisher.subscribe().expect("fast subscriber"));
    let parts = collect_jpegs(&mut fast, 3).await;
    assert_eq!(parts.len(), 3, "an unpolled sibling subscriber must not stall this one");
}
