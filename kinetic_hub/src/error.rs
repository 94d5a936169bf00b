//! Hub request errors.
//!
//! The `Display` text of every variant is what the client receives in
//! `{"type": "error", "message": ...}`.

use crate::recorder::RecorderError;
use crate::session::SessionError;
use kinetic_common::motor::CommandError;
use kinetic_common::safety::SafetyViolation;
use kinetic_motor::{DeviceError, HardwareError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {message}")]
    Malformed { kind: String, message: String },

    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Access denied: {0} requires full access")]
    AccessDenied(&'static str),

    #[error("Client not found")]
    UnknownClient,

    #[error("Failed to create session: {0}")]
    CreateSession(#[source] SessionError),

    #[error("Failed to start session: {0}")]
    StartSession(#[source] SessionError),

    #[error("Failed to stop session: {0}")]
    StopSession(#[source] SessionError),

    #[error("Failed to pause session: {0}")]
    PauseSession(#[source] SessionError),

    #[error("Failed to resume session: {0}")]
    ResumeSession(#[source] SessionError),

    /// The reason is logged, not sent.
    #[error("Failed to join session")]
    JoinSession(#[source] SessionError),

    #[error("Unknown motor: {0}")]
    UnknownMotor(String),

    #[error("Invalid motor command: {0}")]
    InvalidCommand(#[from] CommandError),

    #[error("Failed to execute motor command: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Emergency stop latched but the device did not confirm: {0}")]
    EmergencyStopUnconfirmed(#[source] DeviceError),

    #[error("Cannot reset emergency stop: {0}")]
    ResetRefused(#[source] SafetyViolation),

    #[error("Emergency stop is not active")]
    NotLatched,

    #[error("Alert {0} not found or already resolved")]
    AlertNotFound(usize),

    #[error(transparent)]
    Recording(#[from] RecorderError),
}
