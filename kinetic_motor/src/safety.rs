//! # Safety Controller
//!
//! Last line of defense between computed intent and the motors. Every
//! command set headed for the device passes through [`SafetyController::validate`].
//!
//! # Design
//!
//! - `validate` returns `Result<(), SafetyViolation>`; escalation beyond the
//!   veto (counting, loop shutdown) belongs to the caller.
//! - Checks run per motor in a fixed order: emergency flag (global), speed,
//!   temperature, continuous run time. A cross-motor conflict heuristic runs
//!   last and only warns.
//! - A CRITICAL alert whose kind auto-triggers latches the emergency stop.
//!   The latch is released only by [`SafetyController::reset_emergency_stop`],
//!   which refuses while any CRITICAL alert is unresolved.
//! - Alerts are de-duplicated: an unresolved alert with the same kind, level
//!   and motor is not raised twice.

use kinetic_common::config::{SafetyConfig, secs};
use kinetic_common::consts::TEMPERATURE_RANGE_C;
use kinetic_common::motor::{CommandSet, MotorCommand, MotorMap, MotorName, SafetyLimits};
use kinetic_common::safety::{SafetyAlert, SafetyLevel, SafetyViolation, ViolationKind};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Unresolved alert together with the index used to resolve it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAlert {
    pub index: usize,
    #[serde(flatten)]
    pub alert: SafetyAlert,
}

/// Safety state machine guarding all motor commands.
#[derive(Debug)]
pub struct SafetyController {
    /// Limits and thresholds.
    config: SafetyConfig,
    /// Global veto latch.
    emergency_stop_active: bool,
    /// Every alert raised since start, in order.
    alerts: Vec<SafetyAlert>,
    /// Alerts already handed out by `take_new_alerts`.
    published: usize,
    /// Last reported temperature per motor.
    temperatures: MotorMap<Option<f64>>,
    /// Run time accumulated by finished spans.
    accumulated: MotorMap<Duration>,
    /// Start of the current run span, if the motor is turning.
    running_since: MotorMap<Option<Instant>>,
}

impl SafetyController {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            emergency_stop_active: false,
            alerts: Vec::new(),
            published: 0,
            temperatures: MotorMap::default(),
            accumulated: MotorMap::default(),
            running_since: MotorMap::default(),
        }
    }

    #[inline]
    pub fn limits(&self) -> &SafetyLimits {
        &self.config.limits
    }

    #[inline]
    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    #[inline]
    pub const fn is_emergency_stop_active(&self) -> bool {
        self.emergency_stop_active
    }

    // ─── Validation ─────────────────────────────────────────────────

    /// Validate a command set against limits, temperatures and run time.
    ///
    /// With the emergency stop latched every set is rejected.
    pub fn validate(&mut self, set: &CommandSet) -> Result<(), SafetyViolation> {
        if self.emergency_stop_active {
            return Err(SafetyViolation::new(
                ViolationKind::EmergencyStopActive,
                None,
                "emergency stop is active",
            ));
        }

        let now = Instant::now();
        for (motor, command) in set.motors.iter() {
            self.check_velocity(motor, command)?;
            self.check_temperature(motor)?;
            if command.speed() > 0.0 {
                self.check_run_time(motor, now)?;
            }
        }
        self.check_conflicts(set);
        Ok(())
    }

    fn check_velocity(
        &mut self,
        motor: MotorName,
        command: &MotorCommand,
    ) -> Result<(), SafetyViolation> {
        let velocity = command.velocity_rpm();
        if !velocity.is_finite() || !command.direction().agrees_with(velocity) {
            let message = format!(
                "velocity {velocity} is negative for direction {}",
                command.direction()
            );
            self.raise(SafetyLevel::Critical, ViolationKind::NegativeVelocity, Some(motor), &message);
            return Err(SafetyViolation::new(ViolationKind::NegativeVelocity, Some(motor), message));
        }

        let limit = self.config.limits.max_rpm(motor);
        if !self.config.limits.permits(motor, command.speed()) {
            let message = format!("{:.1} RPM exceeds limit of {limit:.1} RPM", command.speed());
            self.raise(SafetyLevel::Critical, ViolationKind::VelocityExceeded, Some(motor), &message);
            return Err(SafetyViolation::new(ViolationKind::VelocityExceeded, Some(motor), message));
        }
        Ok(())
    }

    fn check_temperature(&mut self, motor: MotorName) -> Result<(), SafetyViolation> {
        let Some(temperature) = self.temperatures[motor] else {
            return Ok(());
        };
        if temperature > self.config.max_temperature_c {
            let message = format!(
                "temperature {temperature:.1}°C above {:.1}°C",
                self.config.max_temperature_c
            );
            self.raise(SafetyLevel::Critical, ViolationKind::Overtemperature, Some(motor), &message);
            return Err(SafetyViolation::new(ViolationKind::Overtemperature, Some(motor), message));
        }
        Ok(())
    }

    fn check_run_time(&mut self, motor: MotorName, now: Instant) -> Result<(), SafetyViolation> {
        let Some(since) = self.running_since[motor] else {
            return Ok(());
        };
        let span = now.saturating_duration_since(since);
        if span >= secs(self.config.runtime_critical_secs) {
            let message = format!("continuous operation for {}s", span.as_secs());
            self.raise(
                SafetyLevel::Critical,
                ViolationKind::ExcessiveOperationTime,
                Some(motor),
                &message,
            );
            return Err(SafetyViolation::new(
                ViolationKind::ExcessiveOperationTime,
                Some(motor),
                message,
            ));
        }
        if span >= secs(self.config.runtime_warning_secs) {
            let message = format!("extended operation for {}s", span.as_secs());
            self.raise(SafetyLevel::Warning, ViolationKind::ExtendedOperation, Some(motor), &message);
        }
        Ok(())
    }

    fn check_conflicts(&mut self, set: &CommandSet) {
        let pe = set.command(MotorName::PenElevation).speed();
        let canvas = set.command(MotorName::Canvas).speed();
        if pe > self.config.conflict_pen_elevation_rpm && canvas > self.config.conflict_canvas_rpm {
            let message = format!("pen elevation at {pe:.1} RPM with canvas at {canvas:.1} RPM");
            self.raise(SafetyLevel::Warning, ViolationKind::MotorConflict, None, &message);
        }
    }

    // ─── Alerts ─────────────────────────────────────────────────────

    /// Record an alert unless an identical unresolved one exists.
    ///
    /// Returns `true` when a new alert was appended.
    fn raise(
        &mut self,
        level: SafetyLevel,
        kind: ViolationKind,
        motor: Option<MotorName>,
        message: &str,
    ) -> bool {
        let duplicate = self
            .alerts
            .iter()
            .any(|a| !a.resolved && a.kind == kind && a.level == level && a.motor == motor);
        if duplicate {
            return false;
        }

        match level {
            SafetyLevel::Normal => info!(kind = %kind, "{message}"),
            SafetyLevel::Warning => warn!(kind = %kind, motor = ?motor, "⚠️ {message}"),
            SafetyLevel::Critical | SafetyLevel::Emergency => {
                error!(severity = %level, kind = %kind, motor = ?motor, "🚨 {message}")
            }
        }
        self.alerts.push(SafetyAlert::new(level, kind, message, motor));

        if level == SafetyLevel::Critical
            && kind.auto_triggers_emergency_stop()
            && !self.emergency_stop_active
        {
            self.emergency_stop(&format!("critical {kind} alert"));
        }
        true
    }

    /// Every alert raised so far, resolved or not.
    pub fn alerts(&self) -> &[SafetyAlert] {
        &self.alerts
    }

    /// Unresolved alerts with their indices.
    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.alerts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.resolved)
            .map(|(index, alert)| ActiveAlert {
                index,
                alert: alert.clone(),
            })
            .collect()
    }

    /// Alerts raised since the previous call.
    pub fn take_new_alerts(&mut self) -> Vec<SafetyAlert> {
        let fresh = self.alerts[self.published..].to_vec();
        self.published = self.alerts.len();
        fresh
    }

    /// Mark one alert resolved. Returns `false` for an unknown or already
    /// resolved index.
    pub fn resolve_alert(&mut self, index: usize) -> bool {
        match self.alerts.get_mut(index) {
            Some(alert) if !alert.resolved => {
                info!(index, kind = %alert.kind, "Safety alert resolved");
                alert.resolved = true;
                true
            }
            _ => false,
        }
    }

    /// Overall level: EMERGENCY while latched, otherwise the most severe
    /// unresolved alert.
    pub fn safety_level(&self) -> SafetyLevel {
        if self.emergency_stop_active {
            return SafetyLevel::Emergency;
        }
        self.alerts
            .iter()
            .filter(|a| !a.resolved)
            .map(|a| a.level)
            .max()
            .unwrap_or(SafetyLevel::Normal)
    }

    // ─── Emergency stop ─────────────────────────────────────────────

    /// Latch the emergency stop and stop every run timer.
    ///
    /// Returns `false` if it was already latched.
    pub fn emergency_stop(&mut self, reason: &str) -> bool {
        if self.emergency_stop_active {
            return false;
        }
        self.emergency_stop_active = true;
        self.stop_all_timing();
        let message = format!("emergency stop: {reason}");
        error!("🛑 {message}");
        self.alerts.push(SafetyAlert::new(
            SafetyLevel::Emergency,
            ViolationKind::EmergencyStop,
            message,
            None,
        ));
        true
    }

    /// Release the emergency stop.
    ///
    /// Returns `Ok(false)` if it was not latched. Fails while any CRITICAL
    /// alert is unresolved.
    pub fn reset_emergency_stop(&mut self) -> Result<bool, SafetyViolation> {
        if !self.emergency_stop_active {
            return Ok(false);
        }
        let open = self.alerts.iter().filter(|a| a.blocks_reset()).count();
        if open > 0 {
            return Err(SafetyViolation::new(
                ViolationKind::UnresolvedCriticalAlerts,
                None,
                format!("{open} unresolved critical alert(s)"),
            ));
        }

        self.emergency_stop_active = false;
        for alert in self
            .alerts
            .iter_mut()
            .filter(|a| a.level == SafetyLevel::Emergency)
        {
            alert.resolved = true;
        }
        self.raise(
            SafetyLevel::Normal,
            ViolationKind::EmergencyStopReset,
            None,
            "emergency stop reset",
        );
        Ok(true)
    }

    // ─── Temperature & timing ───────────────────────────────────────

    /// Record a temperature reading; above the limit this raises a CRITICAL
    /// alert, which latches the emergency stop.
    pub fn update_motor_temperature(&mut self, motor: MotorName, temperature_c: f64) {
        let (min, max) = TEMPERATURE_RANGE_C;
        if !(min..=max).contains(&temperature_c) {
            warn!(%motor, temperature_c, "Ignoring implausible temperature reading");
            return;
        }
        self.temperatures[motor] = Some(temperature_c);
        if temperature_c > self.config.max_temperature_c {
            let message = format!(
                "temperature {temperature_c:.1}°C above {:.1}°C",
                self.config.max_temperature_c
            );
            self.raise(SafetyLevel::Critical, ViolationKind::Overtemperature, Some(motor), &message);
        }
    }

    /// Last recorded temperature.
    pub fn motor_temperature(&self, motor: MotorName) -> Option<f64> {
        self.temperatures[motor]
    }

    /// Start the run timer if it is not already running.
    pub fn start_motor_timing(&mut self, motor: MotorName) {
        self.running_since[motor].get_or_insert_with(Instant::now);
    }

    /// Stop the run timer, folding the span into the total.
    pub fn stop_motor_timing(&mut self, motor: MotorName) {
        if let Some(since) = self.running_since[motor].take() {
            self.accumulated[motor] += since.elapsed();
        }
    }

    fn stop_all_timing(&mut self) {
        for motor in MotorName::ALL {
            self.stop_motor_timing(motor);
        }
    }

    /// Whether the run timer is running.
    pub fn is_motor_timing(&self, motor: MotorName) -> bool {
        self.running_since[motor].is_some()
    }

    /// Total run time including the current span.
    pub fn motor_operation_time(&self, motor: MotorName) -> Duration {
        let current = self.running_since[motor]
            .map(|since| since.elapsed())
            .unwrap_or_default();
        self.accumulated[motor] + current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetic_common::motor::MotorDirection;

    fn controller() -> SafetyController {
        SafetyController::new(SafetyConfig::default())
    }

    fn set_with(motor: MotorName, velocity: f64) -> CommandSet {
        CommandSet::stopped(0).with_motor(motor, MotorCommand::from_velocity(velocity).unwrap())
    }

    #[test]
    fn accepts_set_within_limits() {
        let mut safety = controller();
        let set = set_with(MotorName::Canvas, -119.0);
        assert!(safety.validate(&set).is_ok());
        assert_eq!(safety.safety_level(), SafetyLevel::Normal);
    }

    #[test]
    fn canvas_over_limit_is_velocity_exceeded() {
        let mut safety = controller();
        let set = CommandSet::stopped(0).with_motor(
            MotorName::Canvas,
            MotorCommand::new(130.0, MotorDirection::Cw).unwrap(),
        );
        let violation = safety.validate(&set).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::VelocityExceeded);
        assert_eq!(violation.motor, Some(MotorName::Canvas));
        // Critical velocity alert latches the stop.
        assert!(safety.is_emergency_stop_active());
        assert_eq!(safety.safety_level(), SafetyLevel::Emergency);
    }

    #[test]
    fn emergency_stop_blocks_everything() {
        let mut safety = controller();
        assert!(safety.emergency_stop("test"));
        assert!(!safety.emergency_stop("again"));
        let violation = safety.validate(&CommandSet::stopped(1)).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::EmergencyStopActive);
        assert_eq!(
            safety
                .alerts()
                .iter()
                .filter(|a| a.kind == ViolationKind::EmergencyStop)
                .count(),
            1
        );
    }

    #[test]
    fn reset_requires_resolved_critical_alerts() {
        let mut safety = controller();
        let _ = safety.validate(&set_with(MotorName::PenBrush, 95.0));
        assert!(safety.is_emergency_stop_active());

        let err = safety.reset_emergency_stop().unwrap_err();
        assert_eq!(err.kind, ViolationKind::UnresolvedCriticalAlerts);

        let critical: Vec<usize> = safety
            .active_alerts()
            .into_iter()
            .filter(|a| a.alert.level == SafetyLevel::Critical)
            .map(|a| a.index)
            .collect();
        assert_eq!(critical.len(), 1);
        assert!(safety.resolve_alert(critical[0]));

        assert_eq!(safety.reset_emergency_stop(), Ok(true));
        assert!(!safety.is_emergency_stop_active());
        assert!(safety.validate(&CommandSet::stopped(2)).is_ok());
        assert_eq!(safety.reset_emergency_stop(), Ok(false));
    }

    #[test]
    fn overtemperature_reading_latches_and_vetoes() {
        let mut safety = controller();
        safety.update_motor_temperature(MotorName::PenColorDepth, 90.0);
        assert!(safety.is_emergency_stop_active());
        assert_eq!(safety.motor_temperature(MotorName::PenColorDepth), Some(90.0));

        let idx = safety.active_alerts()[0].index;
        safety.resolve_alert(idx);
        safety.reset_emergency_stop().unwrap();

        // The reading is still hot, so validation vetoes again.
        let violation = safety.validate(&CommandSet::stopped(0)).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::Overtemperature);
        assert_eq!(violation.motor, Some(MotorName::PenColorDepth));
    }

    #[test]
    fn implausible_temperature_is_ignored() {
        let mut safety = controller();
        safety.update_motor_temperature(MotorName::Canvas, 400.0);
        assert_eq!(safety.motor_temperature(MotorName::Canvas), None);
        assert!(!safety.is_emergency_stop_active());
    }

    #[test]
    fn conflict_only_warns() {
        let mut safety = controller();
        let set = set_with(MotorName::Canvas, 30.0)
            .with_motor(MotorName::PenElevation, MotorCommand::from_velocity(25.0).unwrap());
        assert!(safety.validate(&set).is_ok());
        assert!(safety.validate(&set).is_ok());
        let conflicts: Vec<_> = safety
            .active_alerts()
            .into_iter()
            .filter(|a| a.alert.kind == ViolationKind::MotorConflict)
            .collect();
        assert_eq!(conflicts.len(), 1, "duplicate warnings are suppressed");
        assert_eq!(safety.safety_level(), SafetyLevel::Warning);
    }

    #[test]
    fn run_time_warning_then_critical() {
        let mut safety = SafetyController::new(SafetyConfig {
            runtime_warning_secs: 0.005,
            runtime_critical_secs: 0.05,
            ..SafetyConfig::default()
        });
        let set = set_with(MotorName::Canvas, 10.0);
        safety.start_motor_timing(MotorName::Canvas);
        std::thread::sleep(Duration::from_millis(10));
        assert!(safety.validate(&set).is_ok());
        assert_eq!(safety.safety_level(), SafetyLevel::Warning);

        std::thread::sleep(Duration::from_millis(50));
        let violation = safety.validate(&set).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::ExcessiveOperationTime);
        assert!(safety.is_emergency_stop_active());
        // Emergency stop halts the timers.
        assert!(!safety.is_motor_timing(MotorName::Canvas));
    }

    #[test]
    fn stop_command_passes_after_the_run_time_ceiling() {
        let mut safety = SafetyController::new(SafetyConfig {
            runtime_critical_secs: 0.02,
            ..SafetyConfig::default()
        });
        safety.start_motor_timing(MotorName::Canvas);
        std::thread::sleep(Duration::from_millis(30));

        assert!(safety.validate(&CommandSet::stopped(1)).is_ok());
        assert!(!safety.is_emergency_stop_active());
        assert!(
            safety
                .alerts()
                .iter()
                .all(|a| a.kind != ViolationKind::ExcessiveOperationTime)
        );

        // Keeping the motor moving is still vetoed.
        let violation = safety.validate(&set_with(MotorName::Canvas, 10.0)).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::ExcessiveOperationTime);
    }

    #[test]
    fn resolving_twice_reports_false() {
        let mut safety = controller();
        let _ = safety.validate(&set_with(MotorName::PenBrush, 95.0));
        let index = safety.active_alerts()[0].index;
        assert!(safety.resolve_alert(index));
        assert!(!safety.resolve_alert(index));
        assert!(!safety.resolve_alert(999));
    }

    #[test]
    fn timing_accumulates_across_spans() {
        let mut safety = controller();
        safety.start_motor_timing(MotorName::PenBrush);
        std::thread::sleep(Duration::from_millis(5));
        safety.stop_motor_timing(MotorName::PenBrush);
        let first = safety.motor_operation_time(MotorName::PenBrush);
        assert!(first >= Duration::from_millis(5));

        safety.start_motor_timing(MotorName::PenBrush);
        std::thread::sleep(Duration::from_millis(5));
        assert!(safety.motor_operation_time(MotorName::PenBrush) > first);
    }

    #[test]
    fn new_alerts_are_handed_out_once() {
        let mut safety = controller();
        safety.emergency_stop("drill");
        assert_eq!(safety.take_new_alerts().len(), 1);
        assert!(safety.take_new_alerts().is_empty());
    }
}
