// ScreenPilot - vision-gated automation for a remote Android app
//
// This is the library crate containing the control loop and its data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ConfigManager};
pub use metrics::Metrics;
pub use models::{AutomationState, DetectionResult, ExecMode, MissionConfig, RunState, Settings};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
