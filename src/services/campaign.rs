//! Repeated missions under a stop policy.

use crate::models::{CampaignSettings, MissionConfig, MissionEvent, MissionOutcome, MissionResult};
use crate::services::device::Frame;
use crate::services::mission::{EventSink, MissionError, MissionRunner, emit};
use crate::services::signal::{is_cancelled, sleep_or_cancel};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Progress metrics sampled once per round, e.g. from an end-of-round screen.
pub type ProgressSample = IndexMap<String, f64>;

pub type ProgressSampler<'a> =
    &'a (dyn Fn(Option<&Frame>) -> anyhow::Result<ProgressSample> + Send + Sync);

pub type UntilPredicate<'a> = &'a (dyn Fn(&ProgressSample) -> bool + Send + Sync);

/// When a campaign stops starting new rounds. Unset limits never trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct StopPolicy {
    pub max_runs: Option<u32>,
    /// Also cuts short the round in flight when it expires
    pub max_duration: Option<Duration>,
    /// Stop once this file exists
    pub stop_file: Option<Utf8PathBuf>,
    /// Pause between rounds
    pub pacing: Duration,
    /// Consecutive failed rounds with device errors before giving up; 0 disables
    pub max_stalled_rounds: u32,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            max_runs: None,
            max_duration: None,
            stop_file: None,
            pacing: Duration::from_secs(2),
            max_stalled_rounds: 5,
        }
    }
}

impl From<&CampaignSettings> for StopPolicy {
    fn from(settings: &CampaignSettings) -> Self {
        Self {
            max_runs: settings.max_runs,
            max_duration: settings.max_duration_secs.map(Duration::from_secs),
            stop_file: settings.stop_file.clone(),
            pacing: Duration::try_from_secs_f64(settings.pacing_secs).unwrap_or_default(),
            max_stalled_rounds: settings.max_stalled_rounds,
        }
    }
}

/// Optional collaborators for a campaign.
#[derive(Default)]
pub struct CampaignHooks<'a> {
    /// Raised by the operator to end the campaign after the current round
    pub external_stop: Option<watch::Receiver<bool>>,
    pub progress: Option<ProgressSampler<'a>>,
    /// Stop once this returns true for the latest progress sample
    pub until: Option<UntilPredicate<'a>>,
    pub on_event: Option<EventSink<'a>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxRuns,
    MaxDuration,
    StopFile,
    ExternalSignal,
    UntilSatisfied,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::MaxRuns => "max runs reached",
            StopReason::MaxDuration => "max duration reached",
            StopReason::StopFile => "stop file present",
            StopReason::ExternalSignal => "external stop",
            StopReason::UntilSatisfied => "until condition met",
            StopReason::Interrupted => "user interrupt",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignResult {
    /// Count per outcome; every outcome is present, in `MissionOutcome::ALL` order
    pub outcomes: IndexMap<MissionOutcome, u32>,
    pub runs: u32,
    pub aborted: bool,
    pub total_elapsed: Duration,
    pub last_result: Option<MissionResult>,
    pub progress: Option<ProgressSample>,
    pub stop_reason: Option<StopReason>,
}

impl CampaignResult {
    fn new() -> Self {
        Self {
            outcomes: MissionOutcome::ALL.iter().map(|o| (*o, 0)).collect(),
            runs: 0,
            aborted: false,
            total_elapsed: Duration::ZERO,
            last_result: None,
            progress: None,
            stop_reason: None,
        }
    }

    fn conclude(&mut self, reason: StopReason) {
        self.aborted = reason == StopReason::Interrupted;
        self.stop_reason = Some(reason);
    }

    pub fn count(&self, outcome: MissionOutcome) -> u32 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Mission(#[from] MissionError),

    #[error("No forward progress: {rounds} consecutive rounds failed with device errors")]
    Stalled { rounds: u32 },
}

/// Run missions back to back until `policy` (or a hook) says stop.
pub async fn run_campaign(
    runner: &MissionRunner,
    config: &MissionConfig,
    policy: &StopPolicy,
    hooks: CampaignHooks<'_>,
) -> Result<CampaignResult, CampaignError> {
    let start = Instant::now();
    let deadline = policy.max_duration.map(|max| start + max);
    let mut interrupt = runner.interrupt();
    let mut result = CampaignResult::new();
    let mut stalled = 0;

    tracing::info!(
        "Starting campaign '{}' (max_runs={:?}, max_duration={:?})",
        config.name,
        policy.max_runs,
        policy.max_duration
    );

    loop {
        if let Some(reason) = stop_reason(policy, &hooks, &interrupt, result.runs, start) {
            result.conclude(reason);
            break;
        }

        let round = result.runs + 1;
        emit(hooks.on_event, MissionEvent::RoundStart { round });
        let mission = runner
            .run_mission_until(config, hooks.dry_run, hooks.on_event, deadline)
            .await?;
        result.runs = round;
        *result.outcomes.entry(mission.outcome).or_insert(0) += 1;
        emit(
            hooks.on_event,
            MissionEvent::RoundEnd {
                round,
                outcome: mission.outcome,
            },
        );
        tracing::info!("Round {} -> {}", round, mission.outcome);

        let outcome = mission.outcome;
        let device_failures = mission.device_failures;
        result.last_result = Some(mission);

        if outcome == MissionOutcome::AbortedByUser {
            result.conclude(StopReason::Interrupted);
            break;
        }

        if outcome != MissionOutcome::Success && device_failures > 0 {
            stalled += 1;
        } else {
            stalled = 0;
        }
        if policy.max_stalled_rounds > 0 && stalled >= policy.max_stalled_rounds {
            tracing::error!("Campaign stalled after {} rounds", stalled);
            return Err(CampaignError::Stalled { rounds: stalled });
        }

        if let Some(sample) = sample_progress(runner, &hooks, round).await {
            let satisfied = hooks.until.is_some_and(|until| until(&sample));
            result.progress = Some(sample);
            if satisfied {
                result.stop_reason = Some(StopReason::UntilSatisfied);
                break;
            }
        }

        // No pacing after the last round
        if let Some(reason) = stop_reason(policy, &hooks, &interrupt, result.runs, start) {
            result.conclude(reason);
            break;
        }

        if !policy.pacing.is_zero() && sleep_or_cancel(policy.pacing, &mut interrupt).await {
            result.conclude(StopReason::Interrupted);
            break;
        }
    }

    result.total_elapsed = start.elapsed();
    log_summary(&result);
    Ok(result)
}

fn stop_reason(
    policy: &StopPolicy,
    hooks: &CampaignHooks<'_>,
    interrupt: &watch::Receiver<bool>,
    runs: u32,
    start: Instant,
) -> Option<StopReason> {
    if is_cancelled(interrupt) {
        return Some(StopReason::Interrupted);
    }
    if hooks.external_stop.as_ref().is_some_and(is_cancelled) {
        return Some(StopReason::ExternalSignal);
    }
    if policy.max_runs.is_some_and(|max| runs >= max) {
        return Some(StopReason::MaxRuns);
    }
    if policy.max_duration.is_some_and(|max| start.elapsed() >= max) {
        return Some(StopReason::MaxDuration);
    }
    if let Some(path) = &policy.stop_file {
        if path.exists() {
            tracing::info!("Stop file {} found", path);
            return Some(StopReason::StopFile);
        }
    }
    None
}

async fn sample_progress(
    runner: &MissionRunner,
    hooks: &CampaignHooks<'_>,
    round: u32,
) -> Option<ProgressSample> {
    let sampler = hooks.progress?;

    // Dry runs never touch the device, so the sampler gets no frame
    let frame = if hooks.dry_run {
        None
    } else {
        runner.input().capture().await.ok()
    };

    match sampler(frame.as_ref()) {
        Ok(sample) => {
            emit(
                hooks.on_event,
                MissionEvent::Progress {
                    round,
                    sample: sample.clone(),
                },
            );
            Some(sample)
        }
        Err(e) => {
            tracing::warn!("Progress sample for round {} failed: {:#}", round, e);
            None
        }
    }
}

fn log_summary(result: &CampaignResult) {
    let counts: Vec<String> = result
        .outcomes
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(o, n)| format!("{}={}", o, n))
        .collect();
    tracing::info!(
        "Campaign finished: {} runs in {:.1}s, stop: {}, outcomes: [{}]",
        result.runs,
        result.total_elapsed.as_secs_f64(),
        result
            .stop_reason
            .map_or_else(|| "-".to_string(), |r| r.to_string()),
        counts.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_settings() {
        let settings = CampaignSettings {
            max_runs: Some(3),
            max_duration_secs: Some(600),
            pacing_secs: 0.5,
            stop_file: None,
            max_stalled_rounds: 0,
        };
        let policy = StopPolicy::from(&settings);
        assert_eq!(policy.max_runs, Some(3));
        assert_eq!(policy.max_duration, Some(Duration::from_secs(600)));
        assert_eq!(policy.pacing, Duration::from_millis(500));
        assert_eq!(policy.max_stalled_rounds, 0);
    }

    #[test]
    fn test_negative_pacing_falls_back_to_zero() {
        let settings = CampaignSettings {
            pacing_secs: -1.0,
            ..CampaignSettings::default()
        };
        assert_eq!(StopPolicy::from(&settings).pacing, Duration::ZERO);
    }

    #[test]
    fn test_result_lists_every_outcome() {
        let result = CampaignResult::new();
        assert_eq!(result.outcomes.len(), MissionOutcome::ALL.len());
        assert_eq!(result.count(MissionOutcome::UiFlowFailure), 0);
    }

    #[tokio::test]
    async fn test_stop_reason_order() {
        let (_tx, interrupt) = watch::channel(false);
        let (_stop_tx, stop_rx) = watch::channel(true);
        let hooks = CampaignHooks {
            external_stop: Some(stop_rx),
            ..Default::default()
        };
        let policy = StopPolicy {
            max_runs: Some(0),
            ..StopPolicy::default()
        };
        assert_eq!(
            stop_reason(&policy, &hooks, &interrupt, 0, Instant::now()),
            Some(StopReason::ExternalSignal)
        );
        assert_eq!(
            stop_reason(&policy, &CampaignHooks::default(), &interrupt, 0, Instant::now()),
            Some(StopReason::MaxRuns)
        );
    }

    #[tokio::test]
    async fn test_stop_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("STOP")).unwrap();
        let (_tx, interrupt) = watch::channel(false);
        let policy = StopPolicy {
            stop_file: Some(path.clone()),
            ..StopPolicy::default()
        };
        let hooks = CampaignHooks::default();

        assert_eq!(stop_reason(&policy, &hooks, &interrupt, 0, Instant::now()), None);
        std::fs::write(&path, "").unwrap();
        assert_eq!(
            stop_reason(&policy, &hooks, &interrupt, 0, Instant::now()),
            Some(StopReason::StopFile)
        );
    }
}
