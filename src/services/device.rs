use async_trait::async_trait;
use camino::Utf8PathBuf;
use image::{GrayImage, ImageFormat};
use regex::Regex;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::models::DeviceSettings;

/// A captured screen, already reduced to 8-bit grayscale.
pub type Frame = GrayImage;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// A device or capture call that failed. Always recoverable at loop level.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Screen capture failed: {0}")]
    Capture(String),

    #[error("Failed to decode frame: {0}")]
    Decode(String),
}

/// Issues input and app-lifecycle commands to the device.
///
/// One process-wide sequential capability; it does no locking of its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    async fn tap(&self, x: u32, y: u32) -> Result<(), DeviceError>;

    async fn swipe(&self, x1: u32, y1: u32, x2: u32, y2: u32, duration_ms: u64) -> Result<(), DeviceError>;

    async fn is_foregrounded(&self, app_id: &str) -> Result<bool, DeviceError>;

    async fn is_running(&self, app_id: &str) -> Result<bool, DeviceError>;

    async fn launch(&self, app_id: &str) -> Result<(), DeviceError>;

    async fn force_stop(&self, app_id: &str) -> Result<(), DeviceError>;
}

/// Source of screen frames.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Frame, DeviceError>;
}

/// `adb`-backed device executor and frame source.
///
/// Foreground detection reads `dumpsys window windows` first and falls back to
/// `dumpsys activity activities`. The patterns below are tried in order.
pub struct AdbDevice {
    adb_path: String,
    serial: Option<String>,
    command_timeout: Duration,
    screenshot_path: Option<Utf8PathBuf>,
    focus_patterns: Vec<Regex>,
}

impl AdbDevice {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            adb_path: settings.adb_path.clone(),
            serial: settings.serial.clone(),
            command_timeout: settings.command_timeout(),
            screenshot_path: settings
                .save_screenshots
                .then(|| settings.screenshot_path.clone()),
            focus_patterns: [
                r"mCurrentFocus=Window\{.*?\s+(\S+)/\S+\}",
                r"topResumedActivity.*?\s+(\S+)/\S+",
                r"mResumedActivity.*?\s+(\S+)/\S+",
                r"mFocusedApp=.*\s+(\S+)/\S+",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("Invalid focus regex"))
            .collect(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.adb_path, args.join(" "))
    }

    async fn run_raw(&self, args: &[&str]) -> Result<Output, DeviceError> {
        let command = self.describe(args);
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args).kill_on_drop(true);

        tracing::debug!("Executing: {}", command);

        timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                tracing::warn!("'{}' timed out after {:?}", command, self.command_timeout);
                DeviceError::Timeout {
                    command: command.clone(),
                    timeout: self.command_timeout,
                }
            })?
            .map_err(|source| DeviceError::Spawn {
                command: command.clone(),
                source,
            })
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, DeviceError> {
        let output = self.run_raw(args).await?;
        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command: self.describe(args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let stdout = self.run(&full).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Package name of the focused window, if any pattern matches.
    pub fn parse_foreground_package(&self, dumpsys: &str) -> Option<String> {
        self.focus_patterns
            .iter()
            .find_map(|re| re.captures(dumpsys))
            .map(|caps| caps[1].to_string())
    }

    async fn foreground_package(&self) -> Result<Option<String>, DeviceError> {
        let windows = self.shell(&["dumpsys", "window", "windows"]).await?;
        if let Some(pkg) = self.parse_foreground_package(&windows) {
            return Ok(Some(pkg));
        }
        let activities = self.shell(&["dumpsys", "activity", "activities"]).await?;
        Ok(self.parse_foreground_package(&activities))
    }

    async fn save_frame(&self, png: &[u8]) {
        let Some(path) = &self.screenshot_path else {
            return;
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("Failed to create screenshot directory {}: {}", parent, e);
                return;
            }
        }
        match tokio::fs::write(path, png).await {
            Ok(()) => tracing::debug!("Saved screenshot to {}", path),
            Err(e) => tracing::warn!("Failed to save screenshot to {}: {}", path, e),
        }
    }
}

/// True when any `ps -A` row's process name is exactly `app_id`.
pub fn ps_lists_process(ps_output: &str, app_id: &str) -> bool {
    ps_output
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|name| name == app_id)
}

/// Decode PNG bytes from `screencap -p` into a grayscale frame.
pub fn decode_png_frame(png: &[u8]) -> Result<Frame, DeviceError> {
    if png.is_empty() {
        return Err(DeviceError::Capture("empty screenshot data".to_string()));
    }
    if !png.starts_with(PNG_SIGNATURE) {
        return Err(DeviceError::Decode("data is not a PNG image".to_string()));
    }
    image::load_from_memory_with_format(png, ImageFormat::Png)
        .map(|img| img.to_luma8())
        .map_err(|e| DeviceError::Decode(e.to_string()))
}

#[async_trait]
impl DeviceExecutor for AdbDevice {
    async fn tap(&self, x: u32, y: u32) -> Result<(), DeviceError> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "tap", x.as_str(), y.as_str()]).await.map(|_| ())
    }

    async fn swipe(&self, x1: u32, y1: u32, x2: u32, y2: u32, duration_ms: u64) -> Result<(), DeviceError> {
        let args = [
            x1.to_string(),
            y1.to_string(),
            x2.to_string(),
            y2.to_string(),
            duration_ms.to_string(),
        ];
        let mut full = vec!["input", "swipe"];
        full.extend(args.iter().map(String::as_str));
        self.shell(&full).await.map(|_| ())
    }

    async fn is_foregrounded(&self, app_id: &str) -> Result<bool, DeviceError> {
        let pkg = self.foreground_package().await?;
        tracing::debug!("Foreground package: {:?}", pkg);
        Ok(pkg.as_deref() == Some(app_id))
    }

    async fn is_running(&self, app_id: &str) -> Result<bool, DeviceError> {
        let pidof = self.run_raw(&["shell", "pidof", app_id]).await?;
        if pidof.status.success() && !String::from_utf8_lossy(&pidof.stdout).trim().is_empty() {
            return Ok(true);
        }
        // Older images ship without pidof
        let ps = self.shell(&["ps", "-A"]).await?;
        Ok(ps_lists_process(&ps, app_id))
    }

    async fn launch(&self, app_id: &str) -> Result<(), DeviceError> {
        tracing::info!("Launching {}", app_id);
        self.shell(&[
            "monkey",
            "-p",
            app_id,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await
        .map(|_| ())
    }

    async fn force_stop(&self, app_id: &str) -> Result<(), DeviceError> {
        tracing::info!("Force-stopping {}", app_id);
        self.shell(&["am", "force-stop", app_id]).await.map(|_| ())
    }
}

#[async_trait]
impl FrameSource for AdbDevice {
    async fn capture(&self) -> Result<Frame, DeviceError> {
        let png = self.run(&["exec-out", "screencap", "-p"]).await?;
        let frame = decode_png_frame(&png)?;
        self.save_frame(&png).await;
        Ok(frame)
    }
}
