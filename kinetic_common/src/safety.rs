//! Safety levels, alerts and the violation error returned by validation.

use crate::motor::MotorName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Severity of an alert, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        })
    }
}

/// Tag identifying what a violation or alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Global emergency-stop flag is set.
    EmergencyStopActive,
    /// Speed above the per-motor limit.
    VelocityExceeded,
    /// Velocity negative relative to its declared direction, or not a number.
    NegativeVelocity,
    /// Last known temperature above the veto threshold.
    Overtemperature,
    /// Continuous run time above the warning threshold.
    ExtendedOperation,
    /// Continuous run time above the critical threshold.
    ExcessiveOperationTime,
    /// Two motors commanded into a combination known to fight each other.
    MotorConflict,
    /// Emergency stop was triggered.
    EmergencyStop,
    /// Emergency stop was reset.
    EmergencyStopReset,
    /// Reset refused because critical alerts are still open.
    UnresolvedCriticalAlerts,
}

impl ViolationKind {
    /// Wire tag, e.g. `velocity_exceeded`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmergencyStopActive => "emergency_stop_active",
            Self::VelocityExceeded => "velocity_exceeded",
            Self::NegativeVelocity => "negative_velocity",
            Self::Overtemperature => "overtemperature",
            Self::ExtendedOperation => "extended_operation",
            Self::ExcessiveOperationTime => "excessive_operation_time",
            Self::MotorConflict => "motor_conflict",
            Self::EmergencyStop => "emergency_stop",
            Self::EmergencyStopReset => "emergency_stop_reset",
            Self::UnresolvedCriticalAlerts => "unresolved_critical_alerts",
        }
    }

    /// Whether a CRITICAL alert of this kind latches the emergency stop.
    pub const fn auto_triggers_emergency_stop(self) -> bool {
        matches!(
            self,
            Self::VelocityExceeded | Self::Overtemperature | Self::ExcessiveOperationTime
        )
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command vetoed by the safety layer.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("safety violation [{kind}]{}: {message}", .motor.map(|m| format!(" on {m}")).unwrap_or_default())]
pub struct SafetyViolation {
    /// What was violated.
    pub kind: ViolationKind,
    /// Motor concerned, if any.
    pub motor: Option<MotorName>,
    /// Human-readable detail.
    pub message: String,
}

impl SafetyViolation {
    pub fn new(kind: ViolationKind, motor: Option<MotorName>, message: impl Into<String>) -> Self {
        Self {
            kind,
            motor,
            message: message.into(),
        }
    }
}

/// One detected safety condition, kept until resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub level: SafetyLevel,
    pub kind: ViolationKind,
    pub message: String,
    pub motor: Option<MotorName>,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
}

impl SafetyAlert {
    pub fn new(
        level: SafetyLevel,
        kind: ViolationKind,
        message: impl Into<String>,
        motor: Option<MotorName>,
    ) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            motor,
            raised_at: Utc::now(),
            resolved: false,
        }
    }

    /// Whether this alert blocks an emergency-stop reset.
    #[inline]
    pub fn blocks_reset(&self) -> bool {
        !self.resolved && self.level == SafetyLevel::Critical
    }
}
