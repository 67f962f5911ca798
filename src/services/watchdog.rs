//! Liveness supervision of the target app.

use crate::metrics::Metrics;
use crate::models::WatchdogSettings;
use crate::services::device::{DeviceError, DeviceExecutor};
use crate::services::signal::{is_cancelled, sleep_or_cancel};
use crate::state::StateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub app_id: String,
    /// Wait after a launch intent before re-checking
    pub launch_settle: Duration,
    /// Wait after a hard restart
    pub restart_settle: Duration,
    /// Failed soft re-foregrounds tolerated before a hard restart
    pub max_soft_attempts: u32,
}

impl WatchdogConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            interval: Duration::from_secs(30),
            app_id: app_id.into(),
            launch_settle: Duration::from_secs(5),
            restart_settle: Duration::from_secs(6),
            max_soft_attempts: 2,
        }
    }

    pub fn from_settings(settings: &WatchdogSettings, app_id: &str) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            app_id: app_id.to_string(),
            launch_settle: Duration::from_secs(settings.launch_settle_secs),
            restart_settle: Duration::from_secs(settings.restart_settle_secs),
            max_soft_attempts: settings.max_soft_attempts,
        }
    }
}

/// What a single check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Healthy,
    /// Sent a launch intent to bring the app back to the foreground
    Refocused,
    /// Force-stopped and relaunched; automation state was reset
    Restarted,
}

pub struct Watchdog {
    device: Arc<dyn DeviceExecutor>,
    state: StateManager,
    metrics: Arc<Metrics>,
    config: WatchdogConfig,
    failed_refocus: u32,
}

impl Watchdog {
    pub fn new(
        device: Arc<dyn DeviceExecutor>,
        state: StateManager,
        metrics: Arc<Metrics>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            device,
            state,
            metrics,
            config,
            failed_refocus: 0,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Run one supervised check and recover if needed.
    pub async fn check_once(&mut self) -> Result<WatchdogAction, DeviceError> {
        let app_id = self.config.app_id.as_str();

        if !self.device.is_running(app_id).await? {
            tracing::warn!("{} is not running, assuming a crash", app_id);
            return self.restart().await;
        }
        if self.device.is_foregrounded(app_id).await? {
            if self.failed_refocus > 0 {
                tracing::info!("{} is back in the foreground", app_id);
            }
            self.failed_refocus = 0;
            return Ok(WatchdogAction::Healthy);
        }

        if self.failed_refocus >= self.config.max_soft_attempts {
            tracing::warn!(
                "{} still backgrounded after {} re-foreground attempts",
                app_id,
                self.failed_refocus
            );
            return self.restart().await;
        }

        tracing::warn!("{} is not in the foreground, relaunching", app_id);
        self.device.launch(app_id).await?;
        self.metrics.record_watchdog_refocus();
        tokio::time::sleep(self.config.launch_settle).await;

        if self.device.is_foregrounded(app_id).await? {
            self.failed_refocus = 0;
        } else {
            self.failed_refocus += 1;
            tracing::warn!(
                "Re-foreground of {} failed ({}/{})",
                app_id,
                self.failed_refocus,
                self.config.max_soft_attempts
            );
        }
        Ok(WatchdogAction::Refocused)
    }

    async fn restart(&mut self) -> Result<WatchdogAction, DeviceError> {
        let app_id = self.config.app_id.as_str();
        tracing::warn!("Hard restart of {}", app_id);

        // A stop failure is not fatal; the launch may still recover the app
        if let Err(e) = self.device.force_stop(app_id).await {
            tracing::warn!("force-stop of {} failed: {}", app_id, e);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.device.launch(app_id).await?;
        tokio::time::sleep(self.config.restart_settle).await;

        self.failed_refocus = 0;
        self.metrics.record_watchdog_restart();
        self.state.reset_for_recovery();
        Ok(WatchdogAction::Restarted)
    }

    /// Check every `interval` until `shutdown` is raised. Errors are logged, never returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Watchdog started for {} (interval {:?})",
            self.config.app_id,
            self.config.interval
        );
        loop {
            if is_cancelled(&shutdown) {
                break;
            }
            match self.check_once().await {
                Ok(WatchdogAction::Healthy) => tracing::debug!("Watchdog: healthy"),
                Ok(action) => tracing::info!("Watchdog: {:?}", action),
                Err(e) => tracing::error!("Watchdog check failed: {}", e),
            }
            if sleep_or_cancel(self.config.interval, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("Watchdog stopped");
    }
}
