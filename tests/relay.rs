//! End-to-end relay scenarios on the mock backend

use std::sync::Arc;
use std::time::Duration;

use v4l2_bridge::config::{parse_descriptor, ExportSide, FrameRate, RelayOptions};
use v4l2_bridge::video::mock::{ManualClock, MockBackend, MockEvent};
use v4l2_bridge::video::{Fourcc, FrameFormat, StopReason, StreamManager};
use v4l2_bridge::BridgeError;

const CAPTURE: &str = "/dev/video0";
const OUTPUT: &str = "/dev/video1";

fn options() -> RelayOptions {
    RelayOptions::default()
        .with_idle_timeout(Duration::from_millis(500))
        .with_wait_slice(Duration::from_millis(25))
}

#[test]
fn reference_descriptor() {
    let config = parse_descriptor("/dev/video0:/dev/video1@o@30:4:640,480:YUYV").unwrap();
    assert_eq!(config.capture_device, CAPTURE);
    assert_eq!(config.output_device, OUTPUT);
    assert_eq!(config.export_side, ExportSide::Output);
    assert_eq!(config.frame_rate, FrameRate::from_fps(30));
    assert_eq!(config.frame_us(), Some(33_333));
    assert_eq!(config.buffer_count, 4);
    assert_eq!(config.format, FrameFormat::new(Fourcc::YUYV, 640, 480));
}

#[tokio::test]
async fn paced_stream_converges_and_stops_idle() {
    let clock = Arc::new(ManualClock::new());
    let backend = MockBackend::new()
        .with_frame_limit(60)
        .with_clock(clock.clone());
    let config = parse_descriptor("/dev/video0:/dev/video1@o@25:3:1280,720:NV12").unwrap();

    let mut manager =
        StreamManager::new(backend.clone(), vec![config], options()).with_clock(clock.clone());
    manager.init().unwrap();
    manager.start();
    let reports = manager.join().await.unwrap();

    let report = reports[0];
    assert_eq!(report.reason, StopReason::Idle);
    assert_eq!(report.stats.frames_relayed, 60);
    assert_eq!(report.stats.buffers_returned, 60);

    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 59);
    assert!(sleeps.iter().all(|d| *d == Duration::from_micros(40_000)));
    let slept: Duration = sleeps.iter().sum();
    let rate = 59.0 / slept.as_secs_f64();
    assert!((rate - 25.0).abs() < 0.01, "rate {}", rate);

    assert_eq!(backend.streaming_calls(CAPTURE), vec![true, false]);
    assert_eq!(backend.streaming_calls(OUTPUT), vec![true, false]);
}

#[tokio::test]
async fn unpaced_stream_never_sleeps() {
    let clock = Arc::new(ManualClock::new());
    let backend = MockBackend::new()
        .with_frame_limit(30)
        .with_clock(clock.clone());
    let config = parse_descriptor("/dev/video0:/dev/video1@i@-1:2:640,480:YUYV").unwrap();

    let mut manager =
        StreamManager::new(backend.clone(), vec![config], options()).with_clock(clock.clone());
    manager.init().unwrap();
    manager.start();
    let reports = manager.join().await.unwrap();

    assert_eq!(reports[0].stats.frames_relayed, 30);
    assert_eq!(reports[0].stats.pacing_suspensions, 0);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn setup_order_and_single_export() {
    let backend = MockBackend::new().with_frame_limit(0);
    let config = parse_descriptor("/dev/video0:/dev/video1@i@30:5:640,480:UYVY").unwrap();
    let mut manager = StreamManager::new(backend.clone(), vec![config], options());
    manager.init().unwrap();

    let events = backend.events();
    let position = |wanted: &dyn Fn(&MockEvent) -> bool| events.iter().position(|e| wanted(e));
    let capture_negotiated = position(&|e| {
        matches!(e, MockEvent::Negotiated { device, .. } if device == CAPTURE)
    })
    .unwrap();
    let output_opened = position(&|e| {
        matches!(e, MockEvent::Opened { device, .. } if device == OUTPUT)
    })
    .unwrap();
    assert!(capture_negotiated < output_opened);

    // Capture exports each index exactly once; output never exports
    assert_eq!(backend.exports(CAPTURE), vec![0, 1, 2, 3, 4]);
    assert!(backend.exports(OUTPUT).is_empty());

    manager.stop();
    manager.start();
    let reports = manager.join().await.unwrap();
    assert_eq!(reports[0].reason, StopReason::Cancelled);
}

#[tokio::test]
async fn allocation_shortfall_aborts_before_streaming() {
    let backend = MockBackend::new().with_grant_limit("/dev/video3", 1);
    let configs = vec![
        parse_descriptor("/dev/video0:/dev/video1@o@30:4:640,480:YUYV").unwrap(),
        parse_descriptor("/dev/video2:/dev/video3@o@30:4:640,480:YUYV").unwrap(),
    ];
    let mut manager = StreamManager::new(backend.clone(), configs, options());

    assert!(matches!(manager.init(), Err(BridgeError::Alloc { .. })));
    assert!(backend
        .events()
        .iter()
        .all(|e| !matches!(e, MockEvent::Streaming { .. })));
}
