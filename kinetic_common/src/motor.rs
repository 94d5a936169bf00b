//! Motor model: names, directions, commands, command sets and device-side state.
//!
//! # Design
//!
//! The installation drives a closed set of four motors. Every per-motor table
//! is a [`MotorMap`], a fixed array indexed by [`MotorName`], so "exactly the
//! four named motors" is a type invariant. It is only checked at the JSON
//! boundary, where [`MotorMap`] rejects missing, duplicate and unknown keys.
//!
//! A [`MotorCommand`] can only be built with a velocity whose sign agrees with
//! its direction. Speed limits are a property of the installation, not of the
//! command, so they are enforced by the safety layer.

use crate::consts::{
    ABSOLUTE_MAX_RPM, AT_TARGET_TOLERANCE, COMMAND_DURATION_RANGE_SECS,
    DEFAULT_CANVAS_MAX_RPM, DEFAULT_COMMAND_DURATION_SECS, DEFAULT_PEN_BRUSH_MAX_RPM,
    DEFAULT_PEN_COLOR_DEPTH_MAX_RPM, DEFAULT_PEN_ELEVATION_MAX_RPM, EMERGENCY_STOP_RPM,
    MOTOR_COUNT, OVERHEAT_WARNING_C,
};
use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::const_assert_eq;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use thiserror::Error;
use uuid::Uuid;

// ─── Errors ─────────────────────────────────────────────────────────

/// Structural errors raised while building motor commands and command sets.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// Velocity is NaN or infinite.
    #[error("velocity {0} is not a finite number")]
    NonFinite(f64),

    /// Velocity sign disagrees with the declared direction.
    #[error("velocity {velocity} disagrees with direction {direction}")]
    DirectionMismatch {
        velocity: f64,
        direction: MotorDirection,
    },

    /// Velocity is beyond the absolute wire ceiling.
    #[error("velocity {0} exceeds the absolute wire ceiling")]
    OutOfRange(f64),

    /// Command duration is outside the accepted range.
    #[error("command duration {0}s outside accepted range")]
    InvalidDuration(f64),
}

// ─── Motor names ────────────────────────────────────────────────────

/// One of the four motors of the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MotorName {
    /// Canvas rotation.
    #[serde(rename = "motor_canvas", alias = "canvas")]
    Canvas,
    /// Pen brush.
    #[serde(rename = "motor_pb", alias = "pb")]
    PenBrush,
    /// Pen color depth.
    #[serde(rename = "motor_pcd", alias = "pcd")]
    PenColorDepth,
    /// Pen elevation.
    #[serde(rename = "motor_pe", alias = "pe")]
    PenElevation,
}

impl MotorName {
    /// All motors in index order.
    pub const ALL: [MotorName; MOTOR_COUNT] = [
        MotorName::Canvas,
        MotorName::PenBrush,
        MotorName::PenColorDepth,
        MotorName::PenElevation,
    ];

    /// Position of this motor in a [`MotorMap`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Canonical name used in snapshots and the client protocol.
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            MotorName::Canvas => "motor_canvas",
            MotorName::PenBrush => "motor_pb",
            MotorName::PenColorDepth => "motor_pcd",
            MotorName::PenElevation => "motor_pe",
        }
    }

    /// Short key used by the device wire protocol.
    #[inline]
    pub const fn device_key(self) -> &'static str {
        match self {
            MotorName::Canvas => "canvas",
            MotorName::PenBrush => "pb",
            MotorName::PenColorDepth => "pcd",
            MotorName::PenElevation => "pe",
        }
    }

    /// Parse either the canonical or the short device key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == key || m.device_key() == key)
    }
}

const_assert_eq!(MotorName::ALL.len(), MOTOR_COUNT);

impl fmt::Display for MotorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_key())
    }
}

// ─── MotorMap ───────────────────────────────────────────────────────

/// Fixed-size table holding one value per motor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorMap<T>([T; MOTOR_COUNT]);

impl<T> MotorMap<T> {
    /// Build from values in [`MotorName::ALL`] order.
    pub const fn new(values: [T; MOTOR_COUNT]) -> Self {
        Self(values)
    }

    /// Build by evaluating `f` for every motor.
    pub fn from_fn(mut f: impl FnMut(MotorName) -> T) -> Self {
        Self(std::array::from_fn(|i| f(MotorName::ALL[i])))
    }

    /// Iterate `(motor, value)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (MotorName, &T)> {
        MotorName::ALL.into_iter().zip(self.0.iter())
    }

    /// Iterate mutable `(motor, value)` pairs in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (MotorName, &mut T)> {
        MotorName::ALL.into_iter().zip(self.0.iter_mut())
    }

    /// Iterate values in index order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    /// Transform every value.
    pub fn map<U>(&self, mut f: impl FnMut(MotorName, &T) -> U) -> MotorMap<U> {
        MotorMap::from_fn(|m| f(m, &self.0[m.index()]))
    }
}

impl<T> Index<MotorName> for MotorMap<T> {
    type Output = T;

    fn index(&self, motor: MotorName) -> &T {
        &self.0[motor.index()]
    }
}

impl<T> IndexMut<MotorName> for MotorMap<T> {
    fn index_mut(&mut self, motor: MotorName) -> &mut T {
        &mut self.0[motor.index()]
    }
}

impl<T: Serialize> Serialize for MotorMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(MOTOR_COUNT))?;
        for (motor, value) in self.iter() {
            map.serialize_entry(motor.as_str(), value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for MotorMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MotorMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for MotorMapVisitor<T> {
            type Value = MotorMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map keyed by exactly the four motor names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut slots: [Option<T>; MOTOR_COUNT] = [None, None, None, None];
                while let Some(key) = access.next_key::<String>()? {
                    let motor = MotorName::from_key(&key)
                        .ok_or_else(|| de::Error::custom(format!("unknown motor `{key}`")))?;
                    let slot = &mut slots[motor.index()];
                    if slot.is_some() {
                        return Err(de::Error::custom(format!("duplicate motor `{key}`")));
                    }
                    *slot = Some(access.next_value()?);
                }
                match slots {
                    [Some(a), Some(b), Some(c), Some(d)] => Ok(MotorMap([a, b, c, d])),
                    slots => {
                        let missing = MotorName::ALL
                            .into_iter()
                            .find(|m| slots[m.index()].is_none())
                            .unwrap_or(MotorName::Canvas);
                        Err(de::Error::custom(format!(
                            "missing motor `{}`",
                            missing.as_str()
                        )))
                    }
                }
            }
        }

        deserializer.deserialize_map(MotorMapVisitor(PhantomData))
    }
}

// ─── Direction & command ────────────────────────────────────────────

/// Rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MotorDirection {
    /// Clockwise; velocity ≥ 0.
    #[default]
    Cw,
    /// Counter-clockwise; velocity ≤ 0.
    Ccw,
}

impl MotorDirection {
    /// Direction implied by a signed velocity (zero is clockwise).
    #[inline]
    pub fn from_velocity(velocity: f64) -> Self {
        if velocity < 0.0 { Self::Ccw } else { Self::Cw }
    }

    /// Whether a signed velocity is consistent with this direction.
    #[inline]
    pub fn agrees_with(self, velocity: f64) -> bool {
        match self {
            Self::Cw => velocity >= 0.0,
            Self::Ccw => velocity <= 0.0,
        }
    }
}

impl fmt::Display for MotorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cw => "CW",
            Self::Ccw => "CCW",
        })
    }
}

#[derive(Deserialize)]
struct RawMotorCommand {
    velocity_rpm: f64,
    direction: MotorDirection,
}

/// Target for one motor: a signed velocity and its direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMotorCommand")]
pub struct MotorCommand {
    velocity_rpm: f64,
    direction: MotorDirection,
}

impl MotorCommand {
    /// Motor held still.
    pub const STOP: Self = Self {
        velocity_rpm: 0.0,
        direction: MotorDirection::Cw,
    };

    /// Build a command, rejecting non-finite values, sign/direction
    /// disagreement and anything beyond the absolute wire ceiling.
    pub fn new(velocity_rpm: f64, direction: MotorDirection) -> Result<Self, CommandError> {
        if !velocity_rpm.is_finite() {
            return Err(CommandError::NonFinite(velocity_rpm));
        }
        if !direction.agrees_with(velocity_rpm) {
            return Err(CommandError::DirectionMismatch {
                velocity: velocity_rpm,
                direction,
            });
        }
        if velocity_rpm.abs() > ABSOLUTE_MAX_RPM {
            return Err(CommandError::OutOfRange(velocity_rpm));
        }
        Ok(Self {
            velocity_rpm,
            direction,
        })
    }

    /// Build a command whose direction follows the velocity sign.
    pub fn from_velocity(velocity_rpm: f64) -> Result<Self, CommandError> {
        Self::new(velocity_rpm, MotorDirection::from_velocity(velocity_rpm))
    }

    /// Build a command from an unsigned speed and a direction.
    pub fn from_speed(speed_rpm: f64, direction: MotorDirection) -> Result<Self, CommandError> {
        let signed = match direction {
            MotorDirection::Cw => speed_rpm,
            MotorDirection::Ccw => -speed_rpm,
        };
        Self::new(signed, direction)
    }

    /// Signed velocity [RPM].
    #[inline]
    pub const fn velocity_rpm(&self) -> f64 {
        self.velocity_rpm
    }

    /// Declared direction.
    #[inline]
    pub const fn direction(&self) -> MotorDirection {
        self.direction
    }

    /// Unsigned speed [RPM].
    #[inline]
    pub fn speed(&self) -> f64 {
        self.velocity_rpm.abs()
    }

    /// Whether the command holds the motor still.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.velocity_rpm == 0.0
    }
}

impl TryFrom<RawMotorCommand> for MotorCommand {
    type Error = CommandError;

    fn try_from(raw: RawMotorCommand) -> Result<Self, Self::Error> {
        Self::new(raw.velocity_rpm, raw.direction)
    }
}

impl Default for MotorCommand {
    fn default() -> Self {
        Self::STOP
    }
}

// ─── Safety limits ──────────────────────────────────────────────────

/// Per-motor maximum speed and the emergency value.
///
/// # TOML Example
///
/// ```toml
/// [safety.limits]
/// canvas_max_rpm = 120.0
/// pen_elevation_max_rpm = 90.0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Canvas limit [RPM].
    pub canvas_max_rpm: f64,
    /// Pen-brush limit [RPM].
    pub pen_brush_max_rpm: f64,
    /// Pen-color-depth limit [RPM].
    pub pen_color_depth_max_rpm: f64,
    /// Pen-elevation limit [RPM].
    pub pen_elevation_max_rpm: f64,
    /// Velocity commanded on emergency stop [RPM].
    pub emergency_stop_rpm: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            canvas_max_rpm: DEFAULT_CANVAS_MAX_RPM,
            pen_brush_max_rpm: DEFAULT_PEN_BRUSH_MAX_RPM,
            pen_color_depth_max_rpm: DEFAULT_PEN_COLOR_DEPTH_MAX_RPM,
            pen_elevation_max_rpm: DEFAULT_PEN_ELEVATION_MAX_RPM,
            emergency_stop_rpm: EMERGENCY_STOP_RPM,
        }
    }
}

impl SafetyLimits {
    /// Hard limit for one motor [RPM].
    #[inline]
    pub const fn max_rpm(&self, motor: MotorName) -> f64 {
        match motor {
            MotorName::Canvas => self.canvas_max_rpm,
            MotorName::PenBrush => self.pen_brush_max_rpm,
            MotorName::PenColorDepth => self.pen_color_depth_max_rpm,
            MotorName::PenElevation => self.pen_elevation_max_rpm,
        }
    }

    /// Whether an unsigned speed is within `0..=limit`.
    #[inline]
    pub fn permits(&self, motor: MotorName, speed_rpm: f64) -> bool {
        (0.0..=self.max_rpm(motor)).contains(&speed_rpm)
    }

    /// Ceiling a velocity generator should aim for: the hard limit reduced
    /// by `margin` (a fraction in `0..1`).
    pub fn generator_ceiling(&self, motor: MotorName, margin: f64) -> f64 {
        self.max_rpm(motor) * (1.0 - margin.clamp(0.0, 1.0))
    }

    /// Check that every limit is finite, non-negative and under the wire ceiling.
    pub fn check(&self) -> Result<(), String> {
        for motor in MotorName::ALL {
            let limit = self.max_rpm(motor);
            if !limit.is_finite() || !(0.0..=ABSOLUTE_MAX_RPM).contains(&limit) {
                return Err(format!(
                    "limit for {motor} must be within 0..={ABSOLUTE_MAX_RPM}, got {limit}"
                ));
            }
        }
        if self.emergency_stop_rpm != 0.0 {
            return Err("emergency_stop_rpm must be 0".to_string());
        }
        Ok(())
    }
}

// ─── Command set ────────────────────────────────────────────────────

fn default_duration() -> f64 {
    DEFAULT_COMMAND_DURATION_SECS
}

/// Synchronized command for all four motors, produced once per control cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSet {
    /// Unique id of this command set.
    #[serde(default = "Uuid::new_v4")]
    pub command_id: Uuid,
    /// Epoch this set was computed for.
    pub epoch: u64,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// How long the set should be held [s].
    #[serde(default = "default_duration")]
    pub duration_secs: f64,
    /// Per-motor commands.
    pub motors: MotorMap<MotorCommand>,
    /// Limits the generator assumed.
    #[serde(default)]
    pub safety_limits: SafetyLimits,
    /// Opaque reference to the data the set was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<serde_json::Value>,
}

impl CommandSet {
    /// New set for `epoch` with default duration and limits.
    pub fn new(epoch: u64, motors: MotorMap<MotorCommand>) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            epoch,
            created_at: Utc::now(),
            duration_secs: DEFAULT_COMMAND_DURATION_SECS,
            motors,
            safety_limits: SafetyLimits::default(),
            source: None,
        }
    }

    /// Set holding every motor still.
    pub fn stopped(epoch: u64) -> Self {
        Self::new(epoch, MotorMap::default())
    }

    /// Attach a source-data reference.
    pub fn with_source(mut self, source: serde_json::Value) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach the limits the generator assumed.
    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.safety_limits = limits;
        self
    }

    /// Copy of this set with one motor replaced, under a fresh id.
    pub fn with_motor(&self, motor: MotorName, command: MotorCommand) -> Self {
        let mut next = self.clone();
        next.motors[motor] = command;
        next.command_id = Uuid::new_v4();
        next.created_at = Utc::now();
        next
    }

    /// Command for one motor.
    #[inline]
    pub fn command(&self, motor: MotorName) -> &MotorCommand {
        &self.motors[motor]
    }

    /// Check fields that serde cannot enforce.
    pub fn check(&self) -> Result<(), CommandError> {
        let (min, max) = COMMAND_DURATION_RANGE_SECS;
        if !(min..=max).contains(&self.duration_secs) {
            return Err(CommandError::InvalidDuration(self.duration_secs));
        }
        Ok(())
    }

    /// Whether every motor is commanded to zero.
    pub fn is_emergency_stop(&self) -> bool {
        self.motors.values().all(MotorCommand::is_stopped)
    }

    /// Rough relative power draw, two decimals.
    pub fn total_power_estimate(&self) -> f64 {
        let total: f64 = self
            .motors
            .iter()
            .map(|(motor, cmd)| power_coefficient(motor) * cmd.speed() / 100.0)
            .sum();
        (total * 100.0).round() / 100.0
    }

    /// Spread of motor speeds: variance over squared mean, capped at 1.
    pub fn complexity_score(&self) -> f64 {
        let speeds: Vec<f64> = self.motors.values().map(MotorCommand::speed).collect();
        let n = speeds.len() as f64;
        let mean = speeds.iter().sum::<f64>() / n;
        if mean == 0.0 {
            return 0.0;
        }
        let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let score = (variance / mean.powi(2)).min(1.0);
        (score * 1000.0).round() / 1000.0
    }

    /// Copy with every speed clamped to `limits`, keeping directions.
    pub fn apply_safety_override(&self, limits: &SafetyLimits) -> Self {
        let mut next = self.clone();
        for (motor, cmd) in next.motors.iter_mut() {
            let speed = cmd.speed().min(limits.max_rpm(motor));
            *cmd = MotorCommand::from_speed(speed, cmd.direction()).unwrap_or(MotorCommand::STOP);
        }
        next.safety_limits = *limits;
        next
    }
}

fn power_coefficient(motor: MotorName) -> f64 {
    match motor {
        MotorName::Canvas => 0.8,
        MotorName::PenBrush => 0.6,
        MotorName::PenColorDepth => 0.4,
        MotorName::PenElevation => 0.5,
    }
}

// ─── Motor state ────────────────────────────────────────────────────

/// Last known commanded state of one motor on the device side.
///
/// Targets are updated optimistically when a command is sent; the current
/// velocity is not confirmed by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub current_velocity_rpm: f64,
    pub current_direction: MotorDirection,
    pub target_velocity_rpm: f64,
    pub target_direction: MotorDirection,
    pub enabled: bool,
    pub is_moving: bool,
    pub last_command_at: Option<DateTime<Utc>>,
    pub temperature_c: Option<f64>,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            current_velocity_rpm: 0.0,
            current_direction: MotorDirection::Cw,
            target_velocity_rpm: 0.0,
            target_direction: MotorDirection::Cw,
            enabled: true,
            is_moving: false,
            last_command_at: None,
            temperature_c: None,
        }
    }
}

impl MotorState {
    /// Record a command that was just sent.
    pub fn apply_command(&mut self, command: &MotorCommand, at: DateTime<Utc>) {
        self.target_velocity_rpm = command.velocity_rpm();
        self.target_direction = command.direction();
        self.is_moving = command.speed() > 0.0;
        self.last_command_at = Some(at);
    }

    /// Record an emergency stop.
    pub fn halt(&mut self, at: DateTime<Utc>) {
        self.target_velocity_rpm = 0.0;
        self.current_velocity_rpm = 0.0;
        self.is_moving = false;
        self.last_command_at = Some(at);
    }

    /// Whether the current velocity is within 5% of the target
    /// (or below 1 RPM when the target is zero).
    pub fn is_at_target(&self) -> bool {
        let target = self.target_velocity_rpm.abs();
        if target == 0.0 {
            return self.current_velocity_rpm.abs() < 1.0;
        }
        self.velocity_error() <= target * AT_TARGET_TOLERANCE
    }

    /// Absolute difference between target and current velocity.
    #[inline]
    pub fn velocity_error(&self) -> f64 {
        (self.target_velocity_rpm - self.current_velocity_rpm).abs()
    }

    /// Whether the last known temperature is above the warning threshold.
    pub fn is_overheating(&self) -> bool {
        self.temperature_c.is_some_and(|t| t > OVERHEAT_WARNING_C)
    }

    /// Short human-readable status, e.g. `AT_TARGET_STOPPED`.
    pub fn status_summary(&self) -> String {
        let base = if !self.enabled {
            "DISABLED"
        } else if self.is_overheating() {
            "OVERHEATING"
        } else if self.is_at_target() {
            "AT_TARGET"
        } else {
            "ADJUSTING"
        };
        if self.is_moving {
            base.to_string()
        } else {
            format!("{base}_STOPPED")
        }
    }
}

/// Persisted "last motor state" record shared with clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSnapshot {
    /// Signed commanded velocity [RPM].
    pub velocity_rpm: f64,
    /// Commanded direction.
    pub direction: MotorDirection,
    /// Unix timestamp of the last update [s].
    pub last_update: f64,
    /// Whether the motor is enabled.
    pub is_enabled: bool,
}

impl MotorSnapshot {
    /// Snapshot of a motor state's commanded target.
    pub fn from_state(state: &MotorState) -> Self {
        Self {
            velocity_rpm: state.target_velocity_rpm,
            direction: state.target_direction,
            last_update: state
                .last_command_at
                .map(|t| t.timestamp_micros() as f64 / 1_000_000.0)
                .unwrap_or(0.0),
            is_enabled: state.enabled,
        }
    }

    /// Command that reproduces this snapshot.
    pub fn to_command(&self) -> Result<MotorCommand, CommandError> {
        MotorCommand::new(self.velocity_rpm, self.direction)
    }
}
