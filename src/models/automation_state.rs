use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Whether the unattended loop is allowed to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Paused,
    Stopped,
    /// Context lost (e.g. after an app restart); the loop must re-observe before acting.
    Unknown,
}

impl RunState {
    pub const ALL: [RunState; 4] = [
        RunState::Running,
        RunState::Paused,
        RunState::Stopped,
        RunState::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Stopped => "STOPPED",
            RunState::Unknown => "UNKNOWN",
        }
    }
}

/// What to do when a round ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecMode {
    /// Tap retry and start the next round right away
    Retry,
    /// Leave the end screen alone
    Wait,
    /// Return to the home screen
    Home,
}

impl ExecMode {
    pub const ALL: [ExecMode; 3] = [ExecMode::Retry, ExecMode::Wait, ExecMode::Home];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Retry => "RETRY",
            ExecMode::Wait => "WAIT",
            ExecMode::Home => "HOME",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected write to the automation state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} value '{value}' (expected one of: {expected})")]
pub struct InvalidStateValue {
    pub kind: &'static str,
    pub value: String,
    pub expected: String,
}

fn parse_variant<T: Copy>(
    kind: &'static str,
    input: &str,
    variants: &[T],
    name: fn(&T) -> &'static str,
) -> Result<T, InvalidStateValue> {
    variants
        .iter()
        .find(|v| name(*v) == input)
        .copied()
        .ok_or_else(|| InvalidStateValue {
            kind,
            value: input.to_string(),
            expected: variants.iter().map(name).collect::<Vec<_>>().join(", "),
        })
}

impl FromStr for RunState {
    type Err = InvalidStateValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant("RunState", s, &RunState::ALL, RunState::as_str)
    }
}

impl FromStr for ExecMode {
    type Err = InvalidStateValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant("ExecMode", s, &ExecMode::ALL, ExecMode::as_str)
    }
}

/// Shared context consulted by the heartbeat, missions and the watchdog.
///
/// Never touched directly; go through [`crate::state::StateManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationState {
    pub run_state: RunState,
    pub exec_mode: ExecMode,

    /// Primary screen name from the most recent classification
    pub last_screen: Option<String>,
}

impl Default for AutomationState {
    fn default() -> Self {
        Self {
            run_state: RunState::Running,
            exec_mode: ExecMode::Retry,
            last_screen: None,
        }
    }
}
