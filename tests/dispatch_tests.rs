//! Integration tests for the two command paths
//!
//! These tests verify:
//! - The queued path executes in FIFO order
//! - Blind-tap loops are non-reentrant and stop promptly on cancel
//! - Immediate taps are gated on visibility and report why they did not happen

mod common;

use common::{HIT_BOX, RecordingDevice, SceneMatcher, ScriptedFrames, rig, rig_with_device};
use screenpilot::Metrics;
use screenpilot::models::{Point, SwipeVector};
use screenpilot::services::{BlindTapper, TapOutcome, TapQueue};
use std::sync::Arc;
use std::time::Duration;

fn matcher() -> SceneMatcher {
    SceneMatcher::new()
        .scene(0, &[])
        .scene(1, &[("buttons.retry:game_over", 0.97), ("screens.game_over", 0.95)])
}

#[tokio::test(start_paused = true)]
async fn test_queue_is_fifo() {
    let device = Arc::new(RecordingDevice::new());
    let queue = TapQueue::spawn(device.clone(), Duration::from_millis(100), Arc::new(Metrics::new()));

    let sender = queue.sender();
    for i in 0..10 {
        assert!(sender.enqueue_tap(i, i * 2, Some("seq")));
    }
    sender.enqueue_swipe(
        SwipeVector {
            x1: 99,
            y1: 1,
            x2: 99,
            y2: 500,
            duration_ms: 300,
        },
        Some("scroll"),
    );
    queue.shutdown().await;

    let mut expected: Vec<(u32, u32)> = (0..10).map(|i| (i, i * 2)).collect();
    expected.push((99, 1));
    assert_eq!(device.taps(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_returns_immediately() {
    let device = Arc::new(RecordingDevice::new());
    let metrics = Arc::new(Metrics::new());
    let queue = TapQueue::spawn(device.clone(), Duration::from_secs(1), metrics.clone());

    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        queue.enqueue_tap(1, 1, None);
    }
    assert!(start.elapsed() < Duration::from_millis(1));
    assert_eq!(
        metrics.taps_queued.load(std::sync::atomic::Ordering::Relaxed),
        5
    );

    queue.shutdown().await;
    assert_eq!(device.taps().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_halts_blind_tap_within_one_interval() {
    let device = Arc::new(RecordingDevice::new());
    let queue = TapQueue::spawn(device.clone(), Duration::ZERO, Arc::new(Metrics::new()));
    let tapper = BlindTapper::new(queue.sender());
    let interval = Duration::from_secs(1);

    assert!(tapper.start(Point::new(7, 7), "blind", Duration::from_secs(60), interval));
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let taps = tapper.stop().await.unwrap();
    assert_eq!(taps, 4);
    assert!(!tapper.is_active());

    // Nothing new after the stop
    tokio::time::sleep(interval * 3).await;
    queue.shutdown().await;
    assert_eq!(device.taps().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_backlog_when_worker_lags() {
    let device = Arc::new(RecordingDevice::new());
    let metrics = Arc::new(Metrics::new());
    // The worker needs 500ms per tap while the loop queues one every 100ms
    let queue = TapQueue::spawn(device.clone(), Duration::from_millis(500), metrics.clone());
    let tapper = BlindTapper::new(queue.sender());

    assert!(tapper.start(
        Point::new(3, 3),
        "lagging",
        Duration::from_secs(60),
        Duration::from_millis(100)
    ));
    tokio::time::sleep(Duration::from_millis(2250)).await;

    let queued = tapper.stop().await.unwrap();
    let executed_at_stop = device.taps().len();
    assert!(queued > 20);
    assert!(executed_at_stop <= 5);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(device.taps().len(), executed_at_stop);

    queue.shutdown().await;
    assert_eq!(device.taps().len(), executed_at_stop);
    assert_eq!(
        metrics.queued_dropped.load(std::sync::atomic::Ordering::Relaxed),
        u64::from(queued) - executed_at_stop as u64
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_blind_tap_is_noop() {
    let device = Arc::new(RecordingDevice::new());
    let queue = TapQueue::spawn(device.clone(), Duration::ZERO, Arc::new(Metrics::new()));
    let tapper = BlindTapper::new(queue.sender());

    assert!(tapper.start(Point::new(1, 1), "first", Duration::from_secs(3), Duration::from_secs(1)));
    assert!(!tapper.start(Point::new(2, 2), "second", Duration::from_secs(3), Duration::from_secs(1)));

    tapper.wait().await;
    queue.shutdown().await;

    let taps = device.taps();
    assert_eq!(taps.len(), 3);
    assert!(taps.iter().all(|t| *t == (1, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_immediate_tap_when_visible() {
    let rig = rig(matcher(), ScriptedFrames::constant(1));

    let outcome = rig.input.tap_label("buttons.retry:game_over").await;

    let center = HIT_BOX.center();
    assert_eq!(
        outcome,
        TapOutcome::Tapped {
            point: center,
            confidence: 0.97
        }
    );
    assert_eq!(rig.device.taps(), vec![(center.x, center.y)]);
    assert!(rig.input.immediate_tap("buttons.retry:game_over").await);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_tap_skips_when_absent() {
    let rig = rig(matcher(), ScriptedFrames::constant(0));

    let outcome = rig.input.tap_label("buttons.retry:game_over").await;
    assert!(matches!(outcome, TapOutcome::NotVisible { .. }));
    assert!(!rig.input.immediate_tap("buttons.retry:game_over").await);
    assert!(rig.device.taps().is_empty());
    assert_eq!(
        rig.metrics.perception_misses.load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_immediate_tap_unknown_key() {
    let rig = rig(matcher(), ScriptedFrames::constant(1));

    let outcome = rig.input.tap_label("buttons.does_not_exist").await;
    assert!(matches!(outcome, TapOutcome::Unresolved { .. }));
    assert!(rig.device.taps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_immediate_tap_reports_failures() {
    let no_frame = rig(matcher(), ScriptedFrames::new(&[None]));
    assert!(matches!(
        no_frame.input.tap_label("buttons.retry:game_over").await,
        TapOutcome::CaptureFailed(_)
    ));

    let rejected = rig_with_device(matcher(), ScriptedFrames::constant(1), RecordingDevice::failing());
    let outcome = rejected.input.tap_label("buttons.retry:game_over").await;
    assert!(outcome.is_device_failure());
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_resolves_without_tapping() {
    let rig = rig(matcher(), ScriptedFrames::constant(1));
    let dry = rig.input.with_dry_run(true);

    let outcome = dry.tap_label("buttons.retry:game_over").await;
    assert_eq!(outcome, TapOutcome::DryRun { point: HIT_BOX.center() });
    assert!(rig.device.taps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_visibility_probe() {
    let rig = rig(matcher(), ScriptedFrames::new(&[Some(1), Some(0), None]));

    assert!(rig.input.is_visible("buttons.retry:game_over").await.unwrap());
    assert!(!rig.input.is_visible("buttons.retry:game_over").await.unwrap());
    assert!(rig.input.is_visible("buttons.retry:game_over").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_tap_named_uses_static_point() {
    let rig = rig(matcher(), ScriptedFrames::constant(0));

    // Resolved from the shared bottom_bar region, no screen check
    let outcome = rig.input.tap_named("buttons.battle:home").await;
    assert!(outcome.is_success());
    assert_eq!(rig.device.taps(), vec![(540, 1860)]);
    assert_eq!(rig.frames.captures(), 0);
}
