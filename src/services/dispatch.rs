//! Command arbitration: the two paths that put input on the device.
//!
//! - [`TapQueue`] / [`TapSender`]: queued, fire-and-forget. One background worker drains
//!   an unbounded FIFO. Callers never wait and get no feedback.
//! - [`BlindTapper`]: a bounded, cancellable repeating tap built on the queued path.
//!   Only one loop runs at a time.
//! - [`ImmediateInput`]: synchronous, visibility-gated. Every tap re-captures the screen
//!   and locates its label first, and the caller gets a [`TapOutcome`] back.
//!
//! Both paths end at the same [`DeviceExecutor`]. Nothing serializes them against each
//! other: a caller that needs an immediate tap in a region the queued path is hitting
//! must stop the blind loop first.

use crate::metrics::Metrics;
use crate::models::{Point, SwipeVector};
use crate::services::device::{DeviceError, DeviceExecutor, Frame, FrameSource};
use crate::services::perception::{LabelError, PerceptionEngine};
use crate::services::signal::{is_cancelled, sleep_or_cancel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A command for the queued path.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedCommand {
    Tap {
        x: u32,
        y: u32,
        label: Option<String>,
        /// Log each execution; off for high-rate blind loops
        log: bool,
    },
    Swipe {
        vector: SwipeVector,
        label: Option<String>,
    },
}

enum Message {
    Command {
        command: QueuedCommand,
        /// Dropped unexecuted once this is raised
        cancel: Option<watch::Receiver<bool>>,
    },
    Shutdown,
}

/// Cheap handle for feeding the queued path.
#[derive(Clone)]
pub struct TapSender {
    tx: mpsc::UnboundedSender<Message>,
    metrics: Arc<Metrics>,
}

impl TapSender {
    /// Queue a command. Returns `false` if the worker is gone.
    pub fn enqueue(&self, command: QueuedCommand) -> bool {
        self.send(command, None)
    }

    /// Queue a command that the worker skips if `cancel` is raised before it runs.
    pub fn enqueue_cancellable(&self, command: QueuedCommand, cancel: &watch::Receiver<bool>) -> bool {
        self.send(command, Some(cancel.clone()))
    }

    fn send(&self, command: QueuedCommand, cancel: Option<watch::Receiver<bool>>) -> bool {
        let accepted = self.tx.send(Message::Command { command, cancel }).is_ok();
        if accepted {
            self.metrics.record_tap_queued();
        } else {
            tracing::warn!("Tap queue is closed, command dropped");
        }
        accepted
    }

    pub fn enqueue_tap(&self, x: u32, y: u32, label: Option<&str>) -> bool {
        self.enqueue(QueuedCommand::Tap {
            x,
            y,
            label: label.map(str::to_string),
            log: true,
        })
    }

    pub fn enqueue_swipe(&self, vector: SwipeVector, label: Option<&str>) -> bool {
        self.enqueue(QueuedCommand::Swipe {
            vector,
            label: label.map(str::to_string),
        })
    }
}

/// Owner of the queued-path worker.
pub struct TapQueue {
    sender: TapSender,
    worker: JoinHandle<()>,
}

impl TapQueue {
    /// Start the background worker. `pacing` is slept after every command.
    pub fn spawn(device: Arc<dyn DeviceExecutor>, pacing: Duration, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(rx, device, pacing, metrics.clone()));
        tracing::info!("Tap queue worker started (pacing {:?})", pacing);
        Self {
            sender: TapSender { tx, metrics },
            worker,
        }
    }

    pub fn sender(&self) -> TapSender {
        self.sender.clone()
    }

    pub fn enqueue_tap(&self, x: u32, y: u32, label: Option<&str>) -> bool {
        self.sender.enqueue_tap(x, y, label)
    }

    /// Let the worker finish everything queued so far, then stop it.
    pub async fn shutdown(self) {
        let _ = self.sender.tx.send(Message::Shutdown);
        if let Err(e) = self.worker.await {
            tracing::error!("Tap queue worker join error: {}", e);
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Message>,
    device: Arc<dyn DeviceExecutor>,
    pacing: Duration,
    metrics: Arc<Metrics>,
) {
    while let Some(message) = rx.recv().await {
        let command = match message {
            Message::Command { cancel, .. } if cancel.as_ref().is_some_and(is_cancelled) => {
                metrics.record_queued_dropped();
                continue;
            }
            Message::Command { command, .. } => command,
            Message::Shutdown => break,
        };

        let (result, label, log) = match &command {
            QueuedCommand::Tap { x, y, label, log } => (device.tap(*x, *y).await, label, *log),
            QueuedCommand::Swipe { vector, label } => (
                device
                    .swipe(vector.x1, vector.y1, vector.x2, vector.y2, vector.duration_ms)
                    .await,
                label,
                true,
            ),
        };

        match result {
            Ok(()) => {
                metrics.record_queued_executed();
                if log {
                    tracing::info!("Queued {:?} sent ({})", command, label.as_deref().unwrap_or("-"));
                }
            }
            Err(e) => {
                metrics.record_device_failure();
                tracing::warn!("Queued command failed: {}", e);
            }
        }

        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }
    tracing::debug!("Tap queue worker stopped");
}

struct ActiveLoop {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<u32>,
}

/// Bounded repeating tap on the queued path. Non-reentrant.
pub struct BlindTapper {
    queue: TapSender,
    active: Arc<AtomicBool>,
    current: Mutex<Option<ActiveLoop>>,
}

impl BlindTapper {
    pub fn new(queue: TapSender) -> Self {
        Self {
            queue,
            active: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Tap `point` every `interval` until `duration` elapses or [`stop`](Self::stop) is called.
    ///
    /// Returns `false` without doing anything if a loop is already running.
    pub fn start(&self, point: Point, label: &str, duration: Duration, interval: Duration) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Blind tap already active, ignoring start for {}", label);
            return false;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(blind_tap_loop(
            self.queue.clone(),
            point,
            label.to_string(),
            duration,
            interval,
            cancel_rx,
            self.active.clone(),
        ));

        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = Some(ActiveLoop { cancel, handle });
        true
    }

    /// Cancel the running loop and wait for it. Returns how many taps it queued.
    pub async fn stop(&self) -> Option<u32> {
        let active = self.current.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        let _ = active.cancel.send(true);
        active.handle.await.ok()
    }

    /// Wait for the running loop to end on its own.
    pub async fn wait(&self) -> Option<u32> {
        let active = self.current.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        active.handle.await.ok()
    }
}

async fn blind_tap_loop(
    queue: TapSender,
    point: Point,
    label: String,
    duration: Duration,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
    active: Arc<AtomicBool>,
) -> u32 {
    let deadline = Instant::now() + duration;
    let mut taps = 0;
    tracing::info!(
        "Blind tap on {} at ({}, {}) for {:?} every {:?}",
        label,
        point.x,
        point.y,
        duration,
        interval
    );

    loop {
        if is_cancelled(&cancel) {
            tracing::info!("Blind tap on {} cancelled after {} taps", label, taps);
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::info!("Blind tap on {} finished after {} taps", label, taps);
            break;
        }

        let queued = queue.enqueue_cancellable(
            QueuedCommand::Tap {
                x: point.x,
                y: point.y,
                label: Some(label.clone()),
                log: false,
            },
            &cancel,
        );
        if !queued {
            break;
        }
        taps += 1;

        if sleep_or_cancel(interval.min(remaining), &mut cancel).await {
            tracing::info!("Blind tap on {} cancelled after {} taps", label, taps);
            break;
        }
    }

    active.store(false, Ordering::Release);
    taps
}

/// Result of an immediate-path action. Never an error: the caller decides the fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum TapOutcome {
    Tapped { point: Point, confidence: f32 },
    /// Label was visible; the device command was suppressed
    DryRun { point: Point },
    NotVisible { key: String, confidence: f32 },
    Unresolved { key: String, reason: String },
    CaptureFailed(String),
    DeviceFailed(String),
}

impl TapOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TapOutcome::Tapped { .. } | TapOutcome::DryRun { .. })
    }

    pub fn is_device_failure(&self) -> bool {
        matches!(self, TapOutcome::CaptureFailed(_) | TapOutcome::DeviceFailed(_))
    }
}

/// Synchronous, feedback-gated input.
#[derive(Clone)]
pub struct ImmediateInput {
    frames: Arc<dyn FrameSource>,
    device: Arc<dyn DeviceExecutor>,
    perception: Arc<PerceptionEngine>,
    metrics: Arc<Metrics>,
    dry_run: bool,
}

impl ImmediateInput {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        device: Arc<dyn DeviceExecutor>,
        perception: Arc<PerceptionEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            frames,
            device,
            perception,
            metrics,
            dry_run: false,
        }
    }

    /// Same collaborators, with device commands suppressed when `dry_run` is set.
    pub fn with_dry_run(&self, dry_run: bool) -> Self {
        Self {
            dry_run,
            ..self.clone()
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn perception(&self) -> &PerceptionEngine {
        &self.perception
    }

    pub fn device(&self) -> &Arc<dyn DeviceExecutor> {
        &self.device
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Capture a fresh frame, counting the attempt.
    pub async fn capture(&self) -> Result<Frame, DeviceError> {
        match self.frames.capture().await {
            Ok(frame) => {
                self.metrics.record_frame();
                Ok(frame)
            }
            Err(e) => {
                self.metrics.record_device_failure();
                tracing::warn!("Capture failed: {}", e);
                Err(e)
            }
        }
    }

    /// Re-capture, locate `key`, and tap it (label-relative).
    pub async fn tap_label(&self, key: &str) -> TapOutcome {
        let frame = match self.capture().await {
            Ok(frame) => frame,
            Err(e) => return TapOutcome::CaptureFailed(e.to_string()),
        };

        let found = match self.perception.locate(&frame, key) {
            Ok(found) => found,
            Err(LabelError::Miss { confidence, .. }) => {
                self.metrics.record_perception_miss();
                tracing::debug!("{} not visible ({:.3})", key, confidence);
                return TapOutcome::NotVisible {
                    key: key.to_string(),
                    confidence,
                };
            }
            Err(e) => {
                tracing::warn!("Cannot tap {}: {}", key, e);
                return TapOutcome::Unresolved {
                    key: key.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        // Resolved above, so the entry exists
        let point = self
            .perception
            .registry()
            .get(key)
            .map_or_else(|| found.bbox.center(), |fp| fp.tap_point_for(found.bbox));

        if self.dry_run {
            tracing::info!("[dry-run] Would tap {} at ({}, {})", key, point.x, point.y);
            return TapOutcome::DryRun { point };
        }

        match self.device.tap(point.x, point.y).await {
            Ok(()) => {
                self.metrics.record_immediate_tap();
                tracing::info!(
                    "Tapped {} at ({}, {}) conf={:.3}",
                    key,
                    point.x,
                    point.y,
                    found.confidence
                );
                TapOutcome::Tapped {
                    point,
                    confidence: found.confidence,
                }
            }
            Err(e) => {
                self.metrics.record_device_failure();
                tracing::warn!("Tap on {} failed: {}", key, e);
                TapOutcome::DeviceFailed(e.to_string())
            }
        }
    }

    /// Boolean form of [`tap_label`](Self::tap_label).
    pub async fn immediate_tap(&self, key: &str) -> bool {
        self.tap_label(key).await.is_success()
    }

    /// Whether `key` is visible on a freshly captured frame.
    pub async fn is_visible(&self, key: &str) -> Result<bool, DeviceError> {
        let frame = self.capture().await?;
        Ok(self.perception.is_visible(&frame, key))
    }

    /// Tap an entry's static point without looking at the screen.
    pub async fn tap_named(&self, key: &str) -> TapOutcome {
        let Some(point) = self
            .perception
            .registry()
            .get(key)
            .and_then(|fp| fp.static_tap_point())
        else {
            return TapOutcome::Unresolved {
                key: key.to_string(),
                reason: "entry has no tap point or region".to_string(),
            };
        };

        if self.dry_run {
            tracing::info!("[dry-run] Would tap {} at ({}, {})", key, point.x, point.y);
            return TapOutcome::DryRun { point };
        }
        match self.device.tap(point.x, point.y).await {
            Ok(()) => {
                self.metrics.record_immediate_tap();
                tracing::info!("Tapped {} at ({}, {})", key, point.x, point.y);
                TapOutcome::Tapped {
                    point,
                    confidence: 1.0,
                }
            }
            Err(e) => {
                self.metrics.record_device_failure();
                TapOutcome::DeviceFailed(e.to_string())
            }
        }
    }

    /// Perform an entry's swipe and wait for the gesture to finish.
    pub async fn swipe_named(&self, key: &str) -> TapOutcome {
        let Some(vector) = self.perception.registry().get(key).and_then(|fp| fp.swipe) else {
            return TapOutcome::Unresolved {
                key: key.to_string(),
                reason: "entry has no swipe".to_string(),
            };
        };
        let start = Point::new(vector.x1, vector.y1);

        if self.dry_run {
            tracing::info!("[dry-run] Would swipe {}", key);
            return TapOutcome::DryRun { point: start };
        }
        match self
            .device
            .swipe(vector.x1, vector.y1, vector.x2, vector.y2, vector.duration_ms)
            .await
        {
            Ok(()) => {
                tracing::info!("Swiped {} ({}ms)", key, vector.duration_ms);
                tokio::time::sleep(Duration::from_millis(vector.duration_ms)).await;
                TapOutcome::Tapped {
                    point: start,
                    confidence: 1.0,
                }
            }
            Err(e) => {
                self.metrics.record_device_failure();
                TapOutcome::DeviceFailed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::device::MockDeviceExecutor;
    use std::sync::atomic::AtomicU32;

    fn counting_device(counter: Arc<AtomicU32>) -> Arc<dyn DeviceExecutor> {
        let mut device = MockDeviceExecutor::new();
        device.expect_tap().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Arc::new(device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drains_before_shutdown() {
        let counter = Arc::new(AtomicU32::new(0));
        let metrics = Arc::new(Metrics::new());
        let queue = TapQueue::spawn(
            counting_device(counter.clone()),
            Duration::from_millis(50),
            metrics.clone(),
        );

        for i in 0..5 {
            assert!(queue.enqueue_tap(i, i, Some("t")));
        }
        queue.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.queued_executed.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_survives_device_failure() {
        let mut device = MockDeviceExecutor::new();
        device.expect_tap().returning(|_, _| {
            Err(DeviceError::Capture("link down".to_string()))
        });
        let metrics = Arc::new(Metrics::new());
        let queue = TapQueue::spawn(Arc::new(device), Duration::ZERO, metrics.clone());

        queue.enqueue_tap(1, 1, None);
        queue.enqueue_tap(2, 2, None);
        queue.shutdown().await;

        assert_eq!(metrics.device_failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blind_tap_runs_for_duration() {
        let counter = Arc::new(AtomicU32::new(0));
        let queue = TapQueue::spawn(
            counting_device(counter.clone()),
            Duration::ZERO,
            Arc::new(Metrics::new()),
        );
        let tapper = BlindTapper::new(queue.sender());

        assert!(tapper.start(
            Point::new(5, 5),
            "blind",
            Duration::from_secs(5),
            Duration::from_secs(1)
        ));
        let taps = tapper.wait().await.unwrap();
        assert_eq!(taps, 5);
        assert!(!tapper.is_active());

        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blind_tap_is_non_reentrant() {
        let queue = TapQueue::spawn(
            counting_device(Arc::new(AtomicU32::new(0))),
            Duration::ZERO,
            Arc::new(Metrics::new()),
        );
        let tapper = BlindTapper::new(queue.sender());
        let point = Point::new(1, 1);

        assert!(tapper.start(point, "a", Duration::from_secs(10), Duration::from_secs(1)));
        assert!(!tapper.start(point, "b", Duration::from_secs(10), Duration::from_secs(1)));
        assert!(tapper.is_active());

        tapper.stop().await;
        assert!(!tapper.is_active());
        assert!(tapper.start(point, "c", Duration::from_secs(1), Duration::from_secs(1)));
        tapper.wait().await;
        queue.shutdown().await;
    }
}
