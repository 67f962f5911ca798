//! The unattended observe, classify, handle loop.
//!
//! Each tick captures a frame, classifies it and looks the primary state up in a
//! [`HandlerTable`] built once at startup. Handlers act through the immediate path,
//! so every tap is gated on the label actually being on screen.

use crate::models::{DetectionResult, ExecMode, HeartbeatSettings, RunState};
use crate::services::device::Frame;
use crate::services::dispatch::{ImmediateInput, TapOutcome};
use crate::services::perception::AmbiguousStateError;
use crate::services::signal::{is_cancelled, sleep_or_cancel};
use crate::state::StateManager;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::Duration;
use tokio::sync::watch;

/// Everything a handler may look at or act through during one tick.
pub struct HandlerContext<'a> {
    pub screen: &'a str,
    pub detection: &'a DetectionResult,
    pub frame: &'a Frame,
    pub state: &'a StateManager,
    pub input: &'a ImmediateInput,
    pub settings: &'a HeartbeatSettings,
}

#[async_trait]
pub trait StateHandler: Send + Sync {
    fn should_run(&self, ctx: &HandlerContext<'_>) -> bool {
        ctx.state.run_state() == RunState::Running
    }

    /// Act on the screen. Returns whether any input was sent.
    async fn run(&self, ctx: &HandlerContext<'_>) -> bool;
}

/// Primary state name to handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: IndexMap<String, Box<dyn StateHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock handlers for the home and game-over screens.
    pub fn with_defaults(settings: &HeartbeatSettings) -> Self {
        Self::new()
            .register(&settings.home_screen, HomeScreenHandler)
            .register(&settings.game_over_screen, GameOverHandler)
    }

    pub fn register(mut self, screen: &str, handler: impl StateHandler + 'static) -> Self {
        if self
            .handlers
            .insert(screen.to_string(), Box::new(handler))
            .is_some()
        {
            tracing::warn!("Handler for {} replaced", screen);
        }
        self
    }

    pub fn get(&self, screen: &str) -> Option<&dyn StateHandler> {
        self.handlers.get(screen).map(|h| h.as_ref())
    }

    pub fn screens(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn log_outcome(key: &str, outcome: &TapOutcome) {
    if !outcome.is_success() {
        tracing::debug!("{}: {:?}", key, outcome);
    }
}

/// Starts a round from the home screen, or resumes an unfinished one.
pub struct HomeScreenHandler;

#[async_trait]
impl StateHandler for HomeScreenHandler {
    async fn run(&self, ctx: &HandlerContext<'_>) -> bool {
        let start = ctx.input.tap_label(&ctx.settings.start_key).await;
        log_outcome(&ctx.settings.start_key, &start);
        if start.is_success() {
            tracing::info!("Round started from {}", ctx.screen);
            return true;
        }

        let resume = ctx.input.tap_label(&ctx.settings.resume_key).await;
        log_outcome(&ctx.settings.resume_key, &resume);
        if resume.is_success() {
            tracing::info!("Resumed round from {}", ctx.screen);
        }
        resume.is_success()
    }
}

/// Honours the exec mode at game over.
pub struct GameOverHandler;

#[async_trait]
impl StateHandler for GameOverHandler {
    async fn run(&self, ctx: &HandlerContext<'_>) -> bool {
        let key = match ctx.state.exec_mode() {
            ExecMode::Wait => {
                tracing::info!("Game over, exec mode WAIT: leaving screen as is");
                return false;
            }
            ExecMode::Home => match &ctx.settings.home_key {
                Some(key) => key,
                None => {
                    tracing::warn!("Exec mode HOME but no home_key configured");
                    return false;
                }
            },
            ExecMode::Retry => &ctx.settings.retry_key,
        };

        let outcome = ctx.input.tap_label(key).await;
        log_outcome(key, &outcome);
        outcome.is_success()
    }
}

/// What one heartbeat tick observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Stopped,
    Paused,
    CaptureFailed,
    /// Classified, nothing dispatched
    Observed { screen: String },
    Handled { screen: String, acted: bool },
}

pub struct Heartbeat {
    input: ImmediateInput,
    state: StateManager,
    handlers: HandlerTable,
    settings: HeartbeatSettings,
}

impl Heartbeat {
    pub fn new(
        input: ImmediateInput,
        state: StateManager,
        handlers: HandlerTable,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            input,
            state,
            handlers,
            settings,
        }
    }

    pub async fn tick(&self) -> Result<Tick, AmbiguousStateError> {
        match self.state.run_state() {
            RunState::Stopped => return Ok(Tick::Stopped),
            RunState::Paused => return Ok(Tick::Paused),
            RunState::Running | RunState::Unknown => {}
        }

        let Ok(frame) = self.input.capture().await else {
            return Ok(Tick::CaptureFailed);
        };
        let detection = self.input.perception().classify(&frame)?;
        let screen = detection.primary.clone();
        self.state.record_screen(&screen);

        // After a restart nothing is acted on until a known screen is seen again
        if self.state.run_state() == RunState::Unknown {
            if detection.is_unknown() {
                return Ok(Tick::Observed { screen });
            }
            tracing::info!("Context re-established on {}", screen);
            self.state.set_run_state(RunState::Running);
        }

        let Some(handler) = self.handlers.get(&screen) else {
            return Ok(Tick::Observed { screen });
        };
        let ctx = HandlerContext {
            screen: &screen,
            detection: &detection,
            frame: &frame,
            state: &self.state,
            input: &self.input,
            settings: &self.settings,
        };
        if !handler.should_run(&ctx) {
            return Ok(Tick::Observed { screen });
        }
        let acted = handler.run(&ctx).await;
        Ok(Tick::Handled { screen, acted })
    }

    /// Tick until stopped. Only an ambiguous classification ends the loop with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AmbiguousStateError> {
        let interval = Duration::from_secs(self.settings.interval_secs);
        let retry = Duration::from_secs(self.settings.capture_retry_secs);
        tracing::info!(
            "Heartbeat started (interval {:?}, handlers: {})",
            interval,
            self.handlers.screens().collect::<Vec<_>>().join(", ")
        );

        loop {
            if is_cancelled(&shutdown) {
                break;
            }
            let pause = match self.tick().await? {
                Tick::Stopped => {
                    tracing::info!("Run state STOPPED, heartbeat exiting");
                    break;
                }
                Tick::CaptureFailed => retry,
                tick => {
                    tracing::debug!("Heartbeat: {:?}", tick);
                    interval
                }
            };
            if sleep_or_cancel(pause, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("Heartbeat stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Never;

    #[async_trait]
    impl StateHandler for Never {
        fn should_run(&self, _ctx: &HandlerContext<'_>) -> bool {
            false
        }

        async fn run(&self, _ctx: &HandlerContext<'_>) -> bool {
            true
        }
    }

    #[test]
    fn test_default_table_screens() {
        let settings = HeartbeatSettings::default();
        let table = HandlerTable::with_defaults(&settings);
        assert_eq!(table.len(), 2);
        assert!(table.get(&settings.home_screen).is_some());
        assert!(table.get(&settings.game_over_screen).is_some());
        assert!(table.get("BATTLE").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let table = HandlerTable::new()
            .register("A", HomeScreenHandler)
            .register("A", Never);
        assert_eq!(table.len(), 1);
        assert_eq!(table.screens().collect::<Vec<_>>(), vec!["A"]);
    }
}
