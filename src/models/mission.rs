use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::fingerprint::DetectionResult;

/// Durations in mission files are written as (fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let value = f64::deserialize(d)?;
        Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
    }
}

/// Condition a polling phase waits for.
///
/// Written as a one-key map in mission files, e.g. `{secondary: RUNNING}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TargetMap", into = "TargetMap")]
pub enum PhaseTarget {
    /// Named primary state
    Primary(String),
    /// Named running/menu state
    Secondary(String),
    Overlay(String),
    /// A single fingerprint above its threshold
    Visible(String),
}

/// Map form of [`PhaseTarget`]; exactly one field must be set.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overlay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visible: Option<String>,
}

impl TryFrom<TargetMap> for PhaseTarget {
    type Error = String;

    fn try_from(map: TargetMap) -> Result<Self, Self::Error> {
        let mut set = [
            map.primary.map(PhaseTarget::Primary),
            map.secondary.map(PhaseTarget::Secondary),
            map.overlay.map(PhaseTarget::Overlay),
            map.visible.map(PhaseTarget::Visible),
        ]
        .into_iter()
        .flatten();

        match (set.next(), set.next()) {
            (Some(target), None) => Ok(target),
            (None, _) => Err(
                "phase target needs one of primary, secondary, overlay, visible".to_string(),
            ),
            (Some(_), Some(_)) => Err("phase target must name exactly one condition".to_string()),
        }
    }
}

impl From<PhaseTarget> for TargetMap {
    fn from(target: PhaseTarget) -> Self {
        match target {
            PhaseTarget::Primary(n) => Self {
                primary: Some(n),
                ..Self::default()
            },
            PhaseTarget::Secondary(n) => Self {
                secondary: Some(n),
                ..Self::default()
            },
            PhaseTarget::Overlay(n) => Self {
                overlay: Some(n),
                ..Self::default()
            },
            PhaseTarget::Visible(k) => Self {
                visible: Some(k),
                ..Self::default()
            },
        }
    }
}

impl PhaseTarget {
    /// Evaluate against a classification. `Visible` needs a matcher and is never
    /// satisfied from a `DetectionResult` alone.
    pub fn satisfied_by(&self, detection: &DetectionResult) -> Option<bool> {
        match self {
            PhaseTarget::Primary(name) => Some(detection.primary == *name),
            PhaseTarget::Secondary(name) => Some(detection.has_secondary(name)),
            PhaseTarget::Overlay(name) => Some(detection.has_overlay(name)),
            PhaseTarget::Visible(_) => None,
        }
    }
}

impl fmt::Display for PhaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTarget::Primary(n) => write!(f, "primary {}", n),
            PhaseTarget::Secondary(n) => write!(f, "secondary {}", n),
            PhaseTarget::Overlay(n) => write!(f, "overlay {}", n),
            PhaseTarget::Visible(k) => write!(f, "visible {}", k),
        }
    }
}

/// The tap whose effect is verified before a round counts as successful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyStep {
    pub tap_key: String,
    /// Expected result of the tap; `None` means the tapped label must disappear
    #[serde(default)]
    pub expect: Option<PhaseTarget>,
    #[serde(default = "default_settle", with = "secs")]
    pub settle: Duration,
}

/// One bounded round: wait for running, wait for the event(s), tap and verify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub running_target: PhaseTarget,
    pub event_a: PhaseTarget,
    #[serde(default)]
    pub event_b: Option<PhaseTarget>,
    pub verify: VerifyStep,

    #[serde(default = "default_poll_running", with = "secs")]
    pub poll_running: Duration,
    #[serde(default = "default_poll", with = "secs")]
    pub poll_interval: Duration,
    #[serde(default = "default_timeout_running", with = "secs")]
    pub timeout_running: Duration,
    #[serde(default = "default_timeout_event", with = "secs")]
    pub timeout_event: Duration,
    #[serde(default = "default_overall", with = "secs")]
    pub overall_timeout: Duration,

    #[serde(default = "default_true")]
    pub verify_tap: bool,
    #[serde(default = "default_max_tap_retries")]
    pub max_tap_retries: u32,

    /// Wait after the verified tap (e.g. while a timed ability runs)
    #[serde(default, with = "secs")]
    pub post_verify_wait: Duration,
    /// Best-effort label taps that close out the round
    #[serde(default)]
    pub finish_sequence: Vec<String>,
    #[serde(default = "default_finish_gap", with = "secs")]
    pub finish_gap: Duration,
}

fn default_name() -> String {
    "mission".to_string()
}
fn default_settle() -> Duration {
    Duration::from_millis(500)
}
fn default_poll_running() -> Duration {
    Duration::from_secs(2)
}
fn default_poll() -> Duration {
    Duration::from_secs(1)
}
fn default_timeout_running() -> Duration {
    Duration::from_secs(60)
}
fn default_timeout_event() -> Duration {
    Duration::from_secs(45)
}
fn default_overall() -> Duration {
    Duration::from_secs(240)
}
fn default_true() -> bool {
    true
}
fn default_max_tap_retries() -> u32 {
    2
}
fn default_finish_gap() -> Duration {
    Duration::from_secs(1)
}

impl MissionConfig {
    /// Mission with default timings.
    pub fn new(running_target: PhaseTarget, event_a: PhaseTarget, tap_key: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            running_target,
            event_a,
            event_b: None,
            verify: VerifyStep {
                tap_key: tap_key.into(),
                expect: None,
                settle: default_settle(),
            },
            poll_running: default_poll_running(),
            poll_interval: default_poll(),
            timeout_running: default_timeout_running(),
            timeout_event: default_timeout_event(),
            overall_timeout: default_overall(),
            verify_tap: true,
            max_tap_retries: default_max_tap_retries(),
            post_verify_wait: Duration::ZERO,
            finish_sequence: Vec::new(),
            finish_gap: default_finish_gap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionPhase {
    WaitRunning,
    WaitEventA,
    WaitEventB,
    VerifyTap,
    Cooldown,
    Finish,
}

impl MissionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionPhase::WaitRunning => "WAIT_RUNNING",
            MissionPhase::WaitEventA => "WAIT_EVENT_A",
            MissionPhase::WaitEventB => "WAIT_EVENT_B",
            MissionPhase::VerifyTap => "VERIFY_TAP",
            MissionPhase::Cooldown => "COOLDOWN",
            MissionPhase::Finish => "FINISH",
        }
    }

    /// Outcome reported when this phase's deadline passes.
    pub fn timeout_outcome(&self) -> MissionOutcome {
        match self {
            MissionPhase::WaitRunning => MissionOutcome::TimeoutWaitRunning,
            MissionPhase::WaitEventA => MissionOutcome::TimeoutWaitEventA,
            MissionPhase::WaitEventB => MissionOutcome::TimeoutWaitEventB,
            _ => MissionOutcome::UiFlowFailure,
        }
    }
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionOutcome {
    Success,
    TimeoutWaitRunning,
    TimeoutWaitEventA,
    TimeoutWaitEventB,
    UiFlowFailure,
    AbortedByUser,
}

impl MissionOutcome {
    pub const ALL: [MissionOutcome; 6] = [
        MissionOutcome::Success,
        MissionOutcome::TimeoutWaitRunning,
        MissionOutcome::TimeoutWaitEventA,
        MissionOutcome::TimeoutWaitEventB,
        MissionOutcome::UiFlowFailure,
        MissionOutcome::AbortedByUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MissionOutcome::Success => "SUCCESS",
            MissionOutcome::TimeoutWaitRunning => "TIMEOUT_WAIT_RUNNING",
            MissionOutcome::TimeoutWaitEventA => "TIMEOUT_WAIT_EVENT_A",
            MissionOutcome::TimeoutWaitEventB => "TIMEOUT_WAIT_EVENT_B",
            MissionOutcome::UiFlowFailure => "UI_FLOW_FAILURE",
            MissionOutcome::AbortedByUser => "ABORTED_BY_USER",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MissionOutcome::TimeoutWaitRunning
                | MissionOutcome::TimeoutWaitEventA
                | MissionOutcome::TimeoutWaitEventB
        )
    }
}

impl fmt::Display for MissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionResult {
    pub outcome: MissionOutcome,
    pub details: String,
    pub elapsed: Duration,
    /// Time spent per phase, in execution order
    pub phases: IndexMap<MissionPhase, Duration>,
    /// Non-fatal problems, in the order they happened
    pub errors: Vec<String>,
    pub tap_attempts: u32,
    pub device_failures: u32,
}

/// Notifications for observers of a mission or campaign.
///
/// Delivered best-effort; an observer cannot influence control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionEvent {
    PhaseStart {
        phase: MissionPhase,
    },
    PhaseEnd {
        phase: MissionPhase,
        duration: Duration,
    },
    RoundStart {
        round: u32,
    },
    RoundEnd {
        round: u32,
        outcome: MissionOutcome,
    },
    Progress {
        round: u32,
        sample: IndexMap<String, f64>,
    },
}
