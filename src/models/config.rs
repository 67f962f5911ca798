use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::automation_state::ExecMode;

/// Operator settings from `settings.yaml`.
///
/// Every section is optional; missing keys fall back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub perception: PerceptionSettings,
    pub dispatch: DispatchSettings,
    pub mission: MissionSettings,
    pub campaign: CampaignSettings,
    pub watchdog: WatchdogSettings,
    pub heartbeat: HeartbeatSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub adb_path: String,
    /// Device serial passed as `adb -s`; `None` uses the only attached device
    pub serial: Option<String>,
    pub app_id: String,
    pub command_timeout_secs: u64,
    /// Write every captured frame to `screenshot_path`
    pub save_screenshots: bool,
    pub screenshot_path: Utf8PathBuf,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            serial: None,
            app_id: "com.TechTreeGames.TheTower".to_string(),
            command_timeout_secs: 10,
            save_screenshots: false,
            screenshot_path: Utf8PathBuf::from("screenshots/latest.png"),
        }
    }
}

impl DeviceSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionSettings {
    /// Directory `match_template` paths are resolved against
    pub template_dir: Utf8PathBuf,
}

impl Default for PerceptionSettings {
    fn default() -> Self {
        Self {
            template_dir: Utf8PathBuf::from("assets/match_templates"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Pause the queued worker takes after each command
    pub queue_pacing_ms: u64,
    pub blind_tap_interval_ms: u64,
    pub blind_tap_duration_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue_pacing_ms: 100,
            blind_tap_interval_ms: 1000,
            blind_tap_duration_secs: 20,
        }
    }
}

impl DispatchSettings {
    pub fn queue_pacing(&self) -> Duration {
        Duration::from_millis(self.queue_pacing_ms)
    }

    pub fn blind_tap_interval(&self) -> Duration {
        Duration::from_millis(self.blind_tap_interval_ms)
    }

    pub fn blind_tap_duration(&self) -> Duration {
        Duration::from_secs(self.blind_tap_duration_secs)
    }
}

/// Mission file location; the mission flow itself lives in `mission.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionSettings {
    pub definition_file: String,
}

impl Default for MissionSettings {
    fn default() -> Self {
        Self {
            definition_file: "mission.yaml".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignSettings {
    pub max_runs: Option<u32>,
    pub max_duration_secs: Option<u64>,
    pub pacing_secs: f64,
    /// Campaign ends as soon as this file exists
    pub stop_file: Option<Utf8PathBuf>,
    pub max_stalled_rounds: u32,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            max_runs: None,
            max_duration_secs: None,
            pacing_secs: 2.0,
            stop_file: Some(Utf8PathBuf::from("STOP")),
            max_stalled_rounds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub launch_settle_secs: u64,
    pub restart_settle_secs: u64,
    pub max_soft_attempts: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            launch_settle_secs: 5,
            restart_settle_secs: 6,
            max_soft_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub capture_retry_secs: u64,
    pub exec_mode: ExecMode,
    pub start_key: String,
    pub resume_key: String,
    pub retry_key: String,
    /// Tapped on game over in HOME mode; HOME is skipped when unset
    pub home_key: Option<String>,
    /// Screen names the built-in handlers attach to
    pub home_screen: String,
    pub game_over_screen: String,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            capture_retry_secs: 2,
            exec_mode: ExecMode::Retry,
            start_key: "buttons.battle:home".to_string(),
            resume_key: "buttons.resume_battle:home".to_string(),
            retry_key: "buttons.retry:game_over".to_string(),
            home_key: None,
            home_screen: "HOME_SCREEN".to_string(),
            game_over_screen: "GAME_OVER".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    pub prefix: String,
    pub debug: bool,
    pub console: bool,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            prefix: "screenpilot".to_string(),
            debug: false,
            console: true,
            json: false,
        }
    }
}
