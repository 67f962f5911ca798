use crate::models::{
    MissionConfig, MissionEvent, MissionOutcome, MissionPhase, MissionResult, PhaseTarget,
};
use crate::services::dispatch::{ImmediateInput, TapOutcome};
use crate::services::perception::AmbiguousStateError;
use crate::services::signal::{is_cancelled, sleep_or_cancel};
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Observer for mission and campaign events. Errors are logged and ignored.
pub type EventSink<'a> = &'a (dyn Fn(&MissionEvent) -> anyhow::Result<()> + Send + Sync);

/// Faults a mission cannot absorb into an outcome.
#[derive(Error, Debug)]
pub enum MissionError {
    #[error(transparent)]
    Ambiguous(#[from] AmbiguousStateError),
}

pub(crate) fn emit(on_event: Option<EventSink<'_>>, event: MissionEvent) {
    if let Some(sink) = on_event {
        if let Err(e) = sink(&event) {
            tracing::warn!("Event observer failed on {:?}: {}", event, e);
        }
    }
}

type Stop = (MissionOutcome, String);

/// Runs bounded missions against the device.
pub struct MissionRunner {
    input: ImmediateInput,
    interrupt: watch::Receiver<bool>,
}

impl MissionRunner {
    /// `interrupt` is the process-wide user-interrupt signal.
    pub fn new(input: ImmediateInput, interrupt: watch::Receiver<bool>) -> Self {
        Self { input, interrupt }
    }

    pub fn input(&self) -> &ImmediateInput {
        &self.input
    }

    pub fn interrupt(&self) -> watch::Receiver<bool> {
        self.interrupt.clone()
    }

    /// Run one mission to a terminal outcome.
    ///
    /// Timeouts, verification failure and user interrupt all come back as
    /// `Ok` with the matching outcome. Only an ambiguous classification is an error.
    pub async fn run_mission(
        &self,
        config: &MissionConfig,
        dry_run: bool,
        on_event: Option<EventSink<'_>>,
    ) -> Result<MissionResult, MissionError> {
        self.run_mission_until(config, dry_run, on_event, None).await
    }

    /// [`run_mission`](Self::run_mission) with an outer deadline. The mission
    /// ends at whichever comes first, `deadline` or its own `overall_timeout`.
    pub async fn run_mission_until(
        &self,
        config: &MissionConfig,
        dry_run: bool,
        on_event: Option<EventSink<'_>>,
        deadline: Option<Instant>,
    ) -> Result<MissionResult, MissionError> {
        let start = Instant::now();
        let own_deadline = start + config.overall_timeout;
        let run = Run {
            config,
            input: self.input.with_dry_run(dry_run || self.input.is_dry_run()),
            interrupt: self.interrupt.clone(),
            on_event,
            start,
            deadline: deadline.map_or(own_deadline, |outer| outer.min(own_deadline)),
            phases: IndexMap::new(),
            errors: Vec::new(),
            tap_attempts: 0,
            device_failures: 0,
        };
        tracing::info!(
            "Starting mission '{}'{}",
            config.name,
            if run.input.is_dry_run() { " (dry run)" } else { "" }
        );
        let result = run.execute().await?;
        self.input.metrics().record_mission(result.outcome);
        Ok(result)
    }
}

struct Run<'a> {
    config: &'a MissionConfig,
    input: ImmediateInput,
    interrupt: watch::Receiver<bool>,
    on_event: Option<EventSink<'a>>,
    start: Instant,
    deadline: Instant,
    phases: IndexMap<MissionPhase, Duration>,
    errors: Vec<String>,
    tap_attempts: u32,
    device_failures: u32,
}

impl Run<'_> {
    fn plan(&self) -> Vec<MissionPhase> {
        let mut plan = vec![MissionPhase::WaitRunning, MissionPhase::WaitEventA];
        if self.config.event_b.is_some() {
            plan.push(MissionPhase::WaitEventB);
        }
        plan.push(MissionPhase::VerifyTap);
        if !self.config.post_verify_wait.is_zero() {
            plan.push(MissionPhase::Cooldown);
        }
        if !self.config.finish_sequence.is_empty() {
            plan.push(MissionPhase::Finish);
        }
        plan
    }

    async fn execute(mut self) -> Result<MissionResult, MissionError> {
        for phase in self.plan() {
            emit(self.on_event, MissionEvent::PhaseStart { phase });
            let phase_start = Instant::now();

            let step = self.run_phase(phase).await;

            // Timing is recorded whatever the phase returned
            let duration = phase_start.elapsed();
            self.phases.insert(phase, duration);
            emit(self.on_event, MissionEvent::PhaseEnd { phase, duration });

            if let Some((outcome, details)) = step? {
                return Ok(self.finish(outcome, details));
            }
        }
        Ok(self.finish(MissionOutcome::Success, "Round completed".to_string()))
    }

    async fn run_phase(&mut self, phase: MissionPhase) -> Result<Option<Stop>, MissionError> {
        let config = self.config;
        match phase {
            MissionPhase::WaitRunning => {
                self.wait_for(
                    phase,
                    &config.running_target,
                    config.timeout_running,
                    config.poll_running,
                )
                .await
            }
            MissionPhase::WaitEventA => {
                self.wait_for(phase, &config.event_a, config.timeout_event, config.poll_interval)
                    .await
            }
            MissionPhase::WaitEventB => match &config.event_b {
                Some(target) => {
                    self.wait_for(phase, target, config.timeout_event, config.poll_interval)
                        .await
                }
                None => Ok(None),
            },
            MissionPhase::VerifyTap => self.verify_tap().await,
            MissionPhase::Cooldown => Ok(self.cooldown().await),
            MissionPhase::Finish => Ok(self.finish_sequence().await),
        }
    }

    fn aborted(&self) -> Option<Stop> {
        tracing::warn!("Mission '{}' aborted by user", self.config.name);
        Some((MissionOutcome::AbortedByUser, "User interrupted".to_string()))
    }

    fn remaining_overall(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Poll until `target` holds or the phase deadline passes.
    async fn wait_for(
        &mut self,
        phase: MissionPhase,
        target: &PhaseTarget,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Stop>, MissionError> {
        let phase_deadline = (Instant::now() + timeout).min(self.deadline);

        loop {
            if is_cancelled(&self.interrupt) {
                return Ok(self.aborted());
            }
            if self.observe(target).await? {
                tracing::info!("{}: {} reached", phase, target);
                return Ok(None);
            }

            let remaining = phase_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("{}: {} not reached before deadline", phase, target);
                return Ok(Some((
                    phase.timeout_outcome(),
                    format!("{} not reached within {:?}", target, timeout),
                )));
            }

            tracing::debug!("{}: waiting for {}", phase, target);
            if sleep_or_cancel(poll.min(remaining), &mut self.interrupt).await {
                return Ok(self.aborted());
            }
        }
    }

    /// Capture a frame and test `target`. `None` when the capture failed.
    async fn sample(&mut self, target: &PhaseTarget) -> Result<Option<bool>, MissionError> {
        let frame = match self.input.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                self.device_failures += 1;
                self.errors.push(format!("Capture failed: {}", e));
                return Ok(None);
            }
        };

        let perception = self.input.perception();
        match target {
            PhaseTarget::Visible(key) => Ok(Some(perception.is_visible(&frame, key))),
            other => {
                let detection = perception.classify(&frame)?;
                Ok(other.satisfied_by(&detection))
            }
        }
    }

    async fn observe(&mut self, target: &PhaseTarget) -> Result<bool, MissionError> {
        Ok(self.sample(target).await?.unwrap_or(false))
    }

    /// Whether the verify tap had its effect. A failed capture proves nothing.
    async fn confirmed(&mut self) -> Result<bool, MissionError> {
        let config = self.config;
        let verify = &config.verify;
        match &verify.expect {
            Some(target) => self.observe(target).await,
            None => {
                let gone = PhaseTarget::Visible(verify.tap_key.clone());
                Ok(self.sample(&gone).await? == Some(false))
            }
        }
    }

    fn verify_deadline_reached(&mut self, key: &str) -> Stop {
        self.errors
            .push(format!("Overall deadline reached while verifying {}", key));
        (
            MissionOutcome::UiFlowFailure,
            "Overall deadline reached during VERIFY_TAP".to_string(),
        )
    }

    async fn verify_tap(&mut self) -> Result<Option<Stop>, MissionError> {
        let config = self.config;
        let key = config.verify.tap_key.as_str();

        loop {
            if is_cancelled(&self.interrupt) {
                return Ok(self.aborted());
            }
            if self.remaining_overall().is_zero() {
                return Ok(Some(self.verify_deadline_reached(key)));
            }

            self.tap_attempts += 1;
            match self.input.tap_label(key).await {
                TapOutcome::Tapped { .. } | TapOutcome::DryRun { .. } => {}
                TapOutcome::NotVisible { confidence, .. } => {
                    tracing::debug!("{} not visible before tap ({:.3})", key, confidence);
                }
                TapOutcome::CaptureFailed(e) | TapOutcome::DeviceFailed(e) => {
                    self.device_failures += 1;
                    self.errors.push(format!("Tap on {} failed: {}", key, e));
                }
                TapOutcome::Unresolved { reason, .. } => {
                    self.errors.push(format!("Cannot tap {}: {}", key, reason));
                    return Ok(Some((MissionOutcome::UiFlowFailure, reason)));
                }
            }

            if !config.verify_tap || self.input.is_dry_run() {
                return Ok(None);
            }

            let settle = config.verify.settle.min(self.remaining_overall());
            if sleep_or_cancel(settle, &mut self.interrupt).await {
                return Ok(self.aborted());
            }
            if self.remaining_overall().is_zero() {
                return Ok(Some(self.verify_deadline_reached(key)));
            }
            if self.confirmed().await? {
                tracing::info!("{} confirmed after {} attempt(s)", key, self.tap_attempts);
                return Ok(None);
            }

            if self.tap_attempts > config.max_tap_retries {
                self.errors.push(format!(
                    "Verify failed for {} after {} attempts",
                    key, self.tap_attempts
                ));
                return Ok(Some((
                    MissionOutcome::UiFlowFailure,
                    format!("{} did not take effect", key),
                )));
            }

            tracing::warn!(
                "{} not confirmed, retrying ({}/{})",
                key,
                self.tap_attempts,
                config.max_tap_retries
            );
            let pause = config.poll_interval.min(self.remaining_overall());
            if sleep_or_cancel(pause, &mut self.interrupt).await {
                return Ok(self.aborted());
            }
        }
    }

    async fn cooldown(&mut self) -> Option<Stop> {
        let wait = self.config.post_verify_wait.min(self.remaining_overall());
        tracing::info!("Waiting {:?} before finishing", wait);
        if sleep_or_cancel(wait, &mut self.interrupt).await {
            return self.aborted();
        }
        None
    }

    /// Best-effort closing taps; failures are recorded, never fatal.
    async fn finish_sequence(&mut self) -> Option<Stop> {
        let config = self.config;
        for (i, key) in config.finish_sequence.iter().enumerate() {
            if i > 0 && sleep_or_cancel(config.finish_gap, &mut self.interrupt).await {
                return self.aborted();
            }
            let outcome = self.input.tap_label(key).await;
            if outcome.is_success() {
                continue;
            }
            if outcome.is_device_failure() {
                self.device_failures += 1;
            }
            let message = format!("Finish step {} failed: {:?}", key, outcome);
            tracing::warn!("{}", message);
            self.errors.push(message);
        }
        None
    }

    fn finish(self, outcome: MissionOutcome, details: String) -> MissionResult {
        let elapsed = self.start.elapsed();
        if outcome == MissionOutcome::Success {
            tracing::info!(
                "Mission '{}' finished: {} in {:.1}s",
                self.config.name,
                outcome,
                elapsed.as_secs_f64()
            );
        } else {
            tracing::warn!(
                "Mission '{}' finished: {} in {:.1}s ({})",
                self.config.name,
                outcome,
                elapsed.as_secs_f64(),
                details
            );
        }
        MissionResult {
            outcome,
            details,
            elapsed,
            phases: self.phases,
            errors: self.errors,
            tap_attempts: self.tap_attempts,
            device_failures: self.device_failures,
        }
    }
}
