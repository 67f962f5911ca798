//! Data models for ScreenPilot.
//!
//! - [`AutomationState`]: run state and exec mode shared by every loop
//! - [`Fingerprint`], [`StateDefinition`], [`OverlayDefinition`]: the read-only perception inputs
//! - [`DetectionResult`]: classification of one frame
//! - [`MissionConfig`], [`MissionResult`], [`MissionEvent`]: one bounded round and its report
//! - [`Settings`]: operator settings loaded from `settings.yaml`
//!
//! Models carry no behaviour beyond small helpers. Mutation of shared state goes through
//! [`StateManager`](crate::state::StateManager).

pub mod automation_state;
pub mod config;
pub mod fingerprint;
pub mod mission;

pub use automation_state::{AutomationState, ExecMode, InvalidStateValue, RunState};
pub use config::{
    CampaignSettings, DeviceSettings, DispatchSettings, HeartbeatSettings, LoggingSettings,
    MissionSettings, PerceptionSettings, Settings, WatchdogSettings,
};
pub use fingerprint::{
    DEFAULT_MATCH_PADDING, DEFAULT_THRESHOLD, DetectionResult, Fingerprint, OverlayDefinition,
    Point, Region, StateDefinition, StateKind, SwipeVector, TapOffset, UNKNOWN_STATE,
};
pub use mission::{
    MissionConfig, MissionEvent, MissionOutcome, MissionPhase, MissionResult, PhaseTarget,
    VerifyStep,
};
