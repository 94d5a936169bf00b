//! Prelude module for common re-exports.
//!
//! ```rust
//! use kinetic_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, ControlLoopConfig, DeviceConfig, HubConfig, InstallationConfig,
    LogLevel, SafetyConfig, SessionConfig, SharedConfig,
};

// ─── Motors ─────────────────────────────────────────────────────────
pub use crate::motor::{
    CommandError, CommandSet, MotorCommand, MotorDirection, MotorMap, MotorName, MotorSnapshot,
    MotorState, SafetyLimits,
};

// ─── Safety ─────────────────────────────────────────────────────────
pub use crate::safety::{SafetyAlert, SafetyLevel, SafetyViolation, ViolationKind};

// ─── Sessions ───────────────────────────────────────────────────────
pub use crate::session::{Session, SessionMetrics, SessionMode, SessionStatus};

// ─── Device wire ────────────────────────────────────────────────────
pub use crate::wire::{DeviceMessage, unix_timestamp};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::MOTOR_COUNT;
