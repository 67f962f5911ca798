// State management module
//
// This module provides the StateManager which wraps AutomationState behind a single
// mutex and emits change events to subscribers.

use crate::models::{AutomationState, ExecMode, InvalidStateValue, RunState};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Change events emitted when the automation state is modified
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    RunStateChanged {
        from: RunState,
        to: RunState,
    },

    ExecModeChanged {
        from: ExecMode,
        to: ExecMode,
    },

    /// The classified primary screen changed
    ScreenChanged {
        screen: Option<String>,
    },

    /// Context was discarded after an app restart
    StateReset,
}

/// Thread-safe owner of the shared [`AutomationState`].
///
/// Every loop gets a clone of this handle instead of reaching for a global. All reads
/// and writes go through one mutex, so a reader never sees a half-applied update.
///
/// - [`read()`](Self::read) / [`snapshot()`](Self::snapshot) for reads
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - typed setters, plus string setters that validate before writing
/// - [`subscribe()`](Self::subscribe) for change events
pub struct StateManager {
    state: Arc<Mutex<AutomationState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with the default state (RUNNING / RETRY)
    pub fn new() -> Self {
        Self::with_state(AutomationState::default())
    }

    pub fn with_state(initial: AutomationState) -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(Mutex::new(initial)),
            state_tx,
        }
    }

    // A panic while holding the lock leaves plain data behind; keep going with it
    fn lock(&self) -> MutexGuard<'_, AutomationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current state
    pub fn snapshot(&self) -> AutomationState {
        self.lock().clone()
    }

    /// Execute a function with read access to the state
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AutomationState) -> R,
    {
        let state = self.lock();
        f(&state)
    }

    /// Apply `update_fn` under the lock and emit an event for everything it changed
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut AutomationState),
    {
        let changes = {
            let mut state = self.lock();
            let old_state = state.clone();
            update_fn(&mut state);
            Self::detect_changes(&old_state, &state)
        };

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(old: &AutomationState, new: &AutomationState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.run_state != new.run_state {
            changes.push(StateChange::RunStateChanged {
                from: old.run_state,
                to: new.run_state,
            });
        }

        if old.exec_mode != new.exec_mode {
            changes.push(StateChange::ExecModeChanged {
                from: old.exec_mode,
                to: new.exec_mode,
            });
        }

        if old.last_screen != new.last_screen {
            changes.push(StateChange::ScreenChanged {
                screen: new.last_screen.clone(),
            });
        }

        changes
    }

    pub fn run_state(&self) -> RunState {
        self.read(|s| s.run_state)
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.read(|s| s.exec_mode)
    }

    pub fn set_run_state(&self, run_state: RunState) -> Vec<StateChange> {
        let changes = self.update(|s| s.run_state = run_state);
        if !changes.is_empty() {
            tracing::info!("Run state set to {}", run_state);
        }
        changes
    }

    pub fn set_exec_mode(&self, exec_mode: ExecMode) -> Vec<StateChange> {
        let changes = self.update(|s| s.exec_mode = exec_mode);
        if !changes.is_empty() {
            tracing::info!("Exec mode set to {}", exec_mode);
        }
        changes
    }

    /// Validate and set the run state from text. On error nothing is written.
    pub fn set_run_state_str(&self, value: &str) -> Result<Vec<StateChange>, InvalidStateValue> {
        let run_state = value.parse::<RunState>().inspect_err(|e| {
            tracing::warn!("Rejected run state write: {}", e);
        })?;
        Ok(self.set_run_state(run_state))
    }

    /// Validate and set the exec mode from text. On error nothing is written.
    pub fn set_exec_mode_str(&self, value: &str) -> Result<Vec<StateChange>, InvalidStateValue> {
        let exec_mode = value.parse::<ExecMode>().inspect_err(|e| {
            tracing::warn!("Rejected exec mode write: {}", e);
        })?;
        Ok(self.set_exec_mode(exec_mode))
    }

    /// Remember the primary screen from the latest classification
    pub fn record_screen(&self, screen: &str) -> Vec<StateChange> {
        self.update(|s| {
            if s.last_screen.as_deref() != Some(screen) {
                s.last_screen = Some(screen.to_string());
            }
        })
    }

    /// Drop all observed context and mark the run state UNKNOWN
    ///
    /// Used after a hard app restart; the control loop must re-observe before acting.
    pub fn reset_for_recovery(&self) -> Vec<StateChange> {
        let mut changes = self.update(|s| {
            s.run_state = RunState::Unknown;
            s.last_screen = None;
        });

        let reset_event = StateChange::StateReset;
        let _ = self.state_tx.send(reset_event.clone());
        changes.push(reset_event);

        tracing::warn!("Automation state reset to UNKNOWN");
        changes
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across tasks
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}
