//! Valve Control - Hysteresis-protected shutoff valve state machine
//!
//! ## States
//!
//! ```text
//!   OPEN ──(N consecutive critical)──▶ CLOSING ──(confirmed)──▶ CLOSED
//!     ▲                                   │                       │
//!     │                                (timeout)                  │
//!     │                                   ▼                       │
//!     └──────────(manual reset)────────  FAULT ◀──(actuator error, any state)
//!     └──────────(manual reset)──────────────────────────────────┘
//! ```
//!
//! Any (state, event) pair not drawn above is a no-op. Timeouts are measured
//! on event timestamps, never on the wall clock, so replayed data behaves
//! exactly like live data.

mod actuator;

pub use actuator::{Actuator, ActuatorCommand, CommandKind, SimulatedActuator};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ValveConfig;
use crate::types::{Severity, ValveAction};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValveError {
    #[error("valve '{location}' not confirmed closed within {waited_ms} ms")]
    ActuatorFault { location: String, waited_ms: i64 },

    #[error("actuator error at '{location}': {message}")]
    ActuatorError { location: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValveState {
    #[default]
    Open,
    Closing,
    Closed,
    Fault,
}

impl std::fmt::Display for ValveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValveState::Open => write!(f, "OPEN"),
            ValveState::Closing => write!(f, "CLOSING"),
            ValveState::Closed => write!(f, "CLOSED"),
            ValveState::Fault => write!(f, "FAULT"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ValveEvent {
    Decision { severity: Severity, at: DateTime<Utc> },
    ActuatorConfirmed { at: DateTime<Utc> },
    ActuatorError { message: String, at: DateTime<Utc> },
    Tick { at: DateTime<Utc> },
    ManualReset { at: DateTime<Utc> },
}

impl ValveEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ValveEvent::Decision { at, .. }
            | ValveEvent::ActuatorConfirmed { at }
            | ValveEvent::ActuatorError { at, .. }
            | ValveEvent::Tick { at }
            | ValveEvent::ManualReset { at } => *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveTransition {
    pub from: ValveState,
    pub to: ValveState,
    pub action: ValveAction,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// State machine for one valve (one per monitored location).
#[derive(Debug, Clone)]
pub struct ValveController {
    location: String,
    config: ValveConfig,
    state: ValveState,
    critical_streak: u32,
    close_commanded_at: Option<DateTime<Utc>>,
    last_fault: Option<ValveError>,
}

impl ValveController {
    pub fn new(location: impl Into<String>, config: ValveConfig) -> Self {
        Self {
            location: location.into(),
            config,
            state: ValveState::Open,
            critical_streak: 0,
            close_commanded_at: None,
            last_fault: None,
        }
    }

    pub fn state(&self) -> ValveState {
        self.state
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn critical_streak(&self) -> u32 {
        self.critical_streak
    }

    /// Error behind the current FAULT, cleared by a manual reset.
    pub fn last_fault(&self) -> Option<&ValveError> {
        self.last_fault.as_ref()
    }

    /// Apply one event. Returns the transition, or `None` when the state is unchanged.
    pub fn handle(&mut self, event: ValveEvent, actuator: &mut dyn Actuator) -> Option<ValveTransition> {
        let at = event.at();
        match (self.state, event) {
            (ValveState::Open, ValveEvent::Decision { severity, .. }) => {
                if severity != Severity::Critical {
                    self.critical_streak = 0;
                    return None;
                }
                self.critical_streak = self.critical_streak.saturating_add(1);
                if self.critical_streak < self.config.dwell_decisions {
                    return None;
                }
                let streak = self.critical_streak;
                self.critical_streak = 0;
                match actuator.command_close(&self.location) {
                    Ok(()) => {
                        self.close_commanded_at = Some(at);
                        Some(self.transition(
                            ValveState::Closing,
                            ValveAction::CloseCommanded,
                            at,
                            format!("{streak} consecutive critical decisions"),
                        ))
                    }
                    Err(e) => Some(self.fault(e, at)),
                }
            }

            (ValveState::Closing, ValveEvent::ActuatorConfirmed { .. }) => {
                self.close_commanded_at = None;
                Some(self.transition(
                    ValveState::Closed,
                    ValveAction::Closed,
                    at,
                    "actuator confirmed closed".to_string(),
                ))
            }

            (ValveState::Closing, ValveEvent::Tick { .. }) => {
                let commanded = self.close_commanded_at?;
                let waited_ms = (at - commanded).num_milliseconds();
                let timeout_ms = i64::try_from(self.config.confirmation_timeout_ms).unwrap_or(i64::MAX);
                if waited_ms < timeout_ms {
                    return None;
                }
                let err = ValveError::ActuatorFault {
                    location: self.location.clone(),
                    waited_ms,
                };
                Some(self.fault(err, at))
            }

            (ValveState::Fault, ValveEvent::ActuatorError { .. }) => None,

            (_, ValveEvent::ActuatorError { message, .. }) => {
                let err = ValveError::ActuatorError {
                    location: self.location.clone(),
                    message,
                };
                Some(self.fault(err, at))
            }

            (ValveState::Closed | ValveState::Fault, ValveEvent::ManualReset { .. }) => {
                match actuator.command_open(&self.location) {
                    Ok(()) => {
                        self.critical_streak = 0;
                        self.close_commanded_at = None;
                        self.last_fault = None;
                        Some(self.transition(ValveState::Open, ValveAction::Reset, at, "manual reset".to_string()))
                    }
                    Err(e) if self.state == ValveState::Fault => {
                        warn!(location = %self.location, error = %e, "Manual reset failed, valve stays in FAULT");
                        self.last_fault = Some(e);
                        None
                    }
                    Err(e) => Some(self.fault(e, at)),
                }
            }

            _ => None,
        }
    }

    fn fault(&mut self, err: ValveError, at: DateTime<Utc>) -> ValveTransition {
        warn!(location = %self.location, from = %self.state, error = %err, "Valve fault");
        let reason = err.to_string();
        self.last_fault = Some(err);
        self.close_commanded_at = None;
        self.critical_streak = 0;
        self.transition(ValveState::Fault, ValveAction::Fault, at, reason)
    }

    fn transition(&mut self, to: ValveState, action: ValveAction, at: DateTime<Utc>, reason: String) -> ValveTransition {
        let from = self.state;
        self.state = to;
        if to != ValveState::Fault {
            info!(location = %self.location, %from, %to, reason = %reason, "Valve transition");
        }
        ValveTransition {
            from,
            to,
            action,
            at,
            reason,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
