//! Integration tests for the campaign runner
//!
//! These tests verify that campaigns:
//! - Run exactly the requested number of rounds
//! - Honour the stop file, the until predicate, external stop and the interrupt
//! - Escalate only when device failures block every round

mod common;

use camino::Utf8PathBuf;
use common::{SceneMatcher, ScriptedFrames, rig};
use indexmap::IndexMap;
use screenpilot::models::{MissionConfig, MissionEvent, MissionOutcome, PhaseTarget};
use screenpilot::services::{
    CampaignError, CampaignHooks, Frame, MissionRunner, ProgressSample, StopPolicy, StopReason,
    run_campaign,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const ABILITY: u8 = 2;

fn matcher() -> SceneMatcher {
    SceneMatcher::new()
        .scene(IDLE, &[])
        .scene(RUNNING, &[("screens.battle", 0.95), ("indicators.running", 0.9)])
        .scene(
            ABILITY,
            &[
                ("screens.battle", 0.95),
                ("indicators.running", 0.9),
                ("buttons.ability", 0.96),
            ],
        )
}

/// Rounds against an idle screen time out after 20s without touching the device.
fn mission() -> MissionConfig {
    let mut config = MissionConfig::new(
        PhaseTarget::Secondary("RUNNING".to_string()),
        PhaseTarget::Visible("buttons.ability".to_string()),
        "buttons.ability",
    );
    config.timeout_running = Duration::from_secs(20);
    config.timeout_event = Duration::from_secs(10);
    config
}

fn policy() -> StopPolicy {
    StopPolicy {
        pacing: Duration::from_secs(2),
        ..StopPolicy::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_max_runs_executes_exact_rounds() {
    let successful_round = [RUNNING, ABILITY, ABILITY, RUNNING];
    let script: Vec<Option<u8>> = successful_round
        .iter()
        .cycle()
        .take(successful_round.len() * 3)
        .map(|id| Some(*id))
        .collect();
    let rig = rig(matcher(), ScriptedFrames::new(&script));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let policy = StopPolicy {
        max_runs: Some(3),
        ..policy()
    };
    let result = run_campaign(&runner, &mission(), &policy, CampaignHooks::default())
        .await
        .unwrap();

    assert_eq!(result.runs, 3);
    assert_eq!(result.count(MissionOutcome::Success), 3);
    assert_eq!(result.stop_reason, Some(StopReason::MaxRuns));
    assert!(!result.aborted);
    assert_eq!(rig.device.taps().len(), 3);
    assert_eq!(
        result.last_result.as_ref().map(|r| r.outcome),
        Some(MissionOutcome::Success)
    );
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_are_aggregated() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let policy = StopPolicy {
        max_runs: Some(2),
        ..policy()
    };
    let result = run_campaign(&runner, &mission(), &policy, CampaignHooks::default())
        .await
        .unwrap();

    assert_eq!(result.runs, 2);
    assert_eq!(result.count(MissionOutcome::TimeoutWaitRunning), 2);
    assert_eq!(result.count(MissionOutcome::Success), 0);
    assert_eq!(result.outcomes.values().sum::<u32>(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_max_duration_cuts_last_round_short() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let policy = StopPolicy {
        max_duration: Some(Duration::from_secs(50)),
        ..policy()
    };
    let result = run_campaign(&runner, &mission(), &policy, CampaignHooks::default())
        .await
        .unwrap();

    // Rounds start at 0s, 22s and 44s; the third ends at the 50s limit instead of 64s
    assert_eq!(result.runs, 3);
    assert_eq!(result.stop_reason, Some(StopReason::MaxDuration));
    assert!(result.total_elapsed <= Duration::from_secs(50));
    let last = result.last_result.unwrap();
    assert_eq!(last.outcome, MissionOutcome::TimeoutWaitRunning);
    assert!(last.elapsed <= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_no_pacing_after_final_round() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let policy = StopPolicy {
        max_runs: Some(1),
        pacing: Duration::from_secs(30),
        ..policy()
    };
    let result = run_campaign(&runner, &mission(), &policy, CampaignHooks::default())
        .await
        .unwrap();

    assert_eq!(result.runs, 1);
    assert_eq!(result.stop_reason, Some(StopReason::MaxRuns));
    // The round alone takes 20s
    assert!(result.total_elapsed < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_stop_file_ends_campaign() {
    let temp_dir = TempDir::new().unwrap();
    let stop_file = Utf8PathBuf::try_from(temp_dir.path().join("STOP")).unwrap();

    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let touch = stop_file.clone();
    let observer = move |event: &MissionEvent| -> anyhow::Result<()> {
        if let MissionEvent::RoundEnd { round: 2, .. } = event {
            std::fs::write(&touch, "")?;
        }
        Ok(())
    };
    let hooks = CampaignHooks {
        on_event: Some(&observer),
        ..Default::default()
    };
    let policy = StopPolicy {
        stop_file: Some(stop_file),
        max_runs: Some(10),
        ..policy()
    };

    let result = run_campaign(&runner, &mission(), &policy, hooks).await.unwrap();

    assert_eq!(result.runs, 2);
    assert_eq!(result.stop_reason, Some(StopReason::StopFile));
}

#[tokio::test(start_paused = true)]
async fn test_until_predicate_on_progress() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let samples = AtomicU32::new(0);
    let sampler = |frame: Option<&Frame>| -> anyhow::Result<ProgressSample> {
        assert!(frame.is_some());
        let n = samples.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sample = IndexMap::new();
        sample.insert("wave".to_string(), f64::from(n * 10));
        Ok(sample)
    };
    let until = |sample: &ProgressSample| sample.get("wave").is_some_and(|w| *w >= 30.0);

    let hooks = CampaignHooks {
        progress: Some(&sampler),
        until: Some(&until),
        ..Default::default()
    };
    let policy = StopPolicy {
        max_runs: Some(10),
        ..policy()
    };

    let result = run_campaign(&runner, &mission(), &policy, hooks).await.unwrap();

    assert_eq!(result.runs, 3);
    assert_eq!(result.stop_reason, Some(StopReason::UntilSatisfied));
    assert_eq!(result.progress.unwrap()["wave"], 30.0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_sampler_does_not_stop_campaign() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let sampler =
        |_frame: Option<&Frame>| -> anyhow::Result<ProgressSample> { anyhow::bail!("OCR failed") };
    let hooks = CampaignHooks {
        progress: Some(&sampler),
        ..Default::default()
    };
    let policy = StopPolicy {
        max_runs: Some(2),
        ..policy()
    };

    let result = run_campaign(&runner, &mission(), &policy, hooks).await.unwrap();
    assert_eq!(result.runs, 2);
    assert!(result.progress.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_mid_round() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
    });

    let result = run_campaign(&runner, &mission(), &policy(), CampaignHooks::default())
        .await
        .unwrap();

    assert!(result.aborted);
    assert_eq!(result.runs, 2);
    assert_eq!(result.count(MissionOutcome::AbortedByUser), 1);
    assert_eq!(result.stop_reason, Some(StopReason::Interrupted));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_pacing() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(21)).await;
        tx.send(true).unwrap();
    });

    let result = run_campaign(&runner, &mission(), &policy(), CampaignHooks::default())
        .await
        .unwrap();

    assert!(result.aborted);
    assert_eq!(result.runs, 1);
    assert_eq!(result.count(MissionOutcome::AbortedByUser), 0);
}

#[tokio::test(start_paused = true)]
async fn test_external_stop_before_first_round() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);
    let (_stop_tx, stop_rx) = watch::channel(true);

    let hooks = CampaignHooks {
        external_stop: Some(stop_rx),
        ..Default::default()
    };
    let result = run_campaign(&runner, &mission(), &policy(), hooks).await.unwrap();

    assert_eq!(result.runs, 0);
    assert!(!result.aborted);
    assert_eq!(result.stop_reason, Some(StopReason::ExternalSignal));
    assert!(result.last_result.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_device_failures_escalate_to_stalled() {
    let rig = rig(matcher(), ScriptedFrames::new(&[None]));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let policy = StopPolicy {
        max_stalled_rounds: 3,
        ..policy()
    };
    let err = run_campaign(&runner, &mission(), &policy, CampaignHooks::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CampaignError::Stalled { rounds: 3 }));
}

#[tokio::test(start_paused = true)]
async fn test_round_events_are_emitted() {
    let rig = rig(matcher(), ScriptedFrames::constant(IDLE));
    let (_tx, interrupt) = watch::channel(false);
    let runner = MissionRunner::new(rig.input.clone(), interrupt);

    let rounds = Mutex::new(Vec::new());
    let observer = |event: &MissionEvent| -> anyhow::Result<()> {
        if let MissionEvent::RoundEnd { round, outcome } = event {
            rounds.lock().unwrap().push((*round, *outcome));
        }
        Ok(())
    };
    let hooks = CampaignHooks {
        on_event: Some(&observer),
        ..Default::default()
    };
    let policy = StopPolicy {
        max_runs: Some(2),
        ..policy()
    };

    run_campaign(&runner, &mission(), &policy, hooks).await.unwrap();

    assert_eq!(
        rounds.into_inner().unwrap(),
        vec![
            (1, MissionOutcome::TimeoutWaitRunning),
            (2, MissionOutcome::TimeoutWaitRunning)
        ]
    );
}
