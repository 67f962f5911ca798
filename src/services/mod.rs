//! Services module - the control loop and everything it talks to.
//!
//! # Components
//!
//! - [`registry`]: fingerprint registry (`clickmap.json`) and state/overlay definitions
//! - [`matching`]: normalized cross-correlation template matching
//! - [`perception`]: [`PerceptionEngine`] classifies frames and locates labels
//! - [`device`]: [`DeviceExecutor`] / [`FrameSource`] traits and the adb-backed [`AdbDevice`]
//! - [`dispatch`]: the queued and immediate command paths
//! - [`mission`]: one bounded multi-phase round
//! - [`campaign`]: repeated rounds under a [`StopPolicy`]
//! - [`watchdog`]: keeps the target app alive and in the foreground
//! - [`heartbeat`]: the unattended observe/classify/handle loop
//!
//! Device flakiness is absorbed into outcomes at every layer. Only configuration
//! defects and ambiguous classifications surface as errors.

pub mod campaign;
pub mod device;
pub mod dispatch;
pub mod heartbeat;
pub mod matching;
pub mod mission;
pub mod perception;
pub mod registry;
pub mod signal;
pub mod watchdog;

pub use campaign::{
    CampaignError, CampaignHooks, CampaignResult, ProgressSample, StopPolicy, StopReason,
    run_campaign,
};
pub use device::{AdbDevice, DeviceError, DeviceExecutor, Frame, FrameSource};
pub use dispatch::{BlindTapper, ImmediateInput, QueuedCommand, TapOutcome, TapQueue, TapSender};
pub use heartbeat::{
    GameOverHandler, HandlerContext, HandlerTable, Heartbeat, HomeScreenHandler, StateHandler,
    Tick,
};
pub use matching::{MatchScore, Matcher, TemplateMatcher, match_template};
pub use mission::{EventSink, MissionError, MissionRunner};
pub use perception::{AmbiguousStateError, LabelError, LabelMatch, PerceptionEngine};
pub use registry::{FingerprintRegistry, StateDefinitions};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogConfig};
