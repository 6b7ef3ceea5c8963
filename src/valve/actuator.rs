//! Valve actuator abstraction

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::ValveError;

/// Physical or simulated valve drive.
///
/// Commands are fire-and-forget: completion is reported back to the state
/// machine as an `ActuatorConfirmed` or `ActuatorError` event.
pub trait Actuator: Send {
    fn command_close(&mut self, location: &str) -> Result<(), ValveError>;
    fn command_open(&mut self, location: &str) -> Result<(), ValveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Close,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub location: String,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SimState {
    commands: Vec<ActuatorCommand>,
    failing: bool,
}

/// In-memory actuator that records every command.
///
/// Clones share state, so a handle kept by the caller sees commands issued
/// through a clone owned by the pipeline. Never confirms on its own.
#[derive(Debug, Clone, Default)]
pub struct SimulatedActuator {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent commands fail with `ActuatorError`.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, location: &str, kind: CommandKind) -> Result<(), ValveError> {
        let mut state = self.lock();
        if state.failing {
            return Err(ValveError::ActuatorError {
                location: location.to_string(),
                message: format!("simulated {kind:?} command failure"),
            });
        }
        debug!(location, ?kind, "Simulated actuator command");
        state.commands.push(ActuatorCommand {
            location: location.to_string(),
            kind,
            issued_at: Utc::now(),
        });
        Ok(())
    }
}

impl Actuator for SimulatedActuator {
    fn command_close(&mut self, location: &str) -> Result<(), ValveError> {
        self.issue(location, CommandKind::Close)
    }

    fn command_open(&mut self, location: &str) -> Result<(), ValveError> {
        self.issue(location, CommandKind::Open)
    }
}
