//! # Hardware Coordinator
//!
//! Single owner of the path to the motors. It composes the
//! [`SafetyController`] and the [`DeviceClient`] behind one async mutex, so
//! every write to the device is serialized and every command set is
//! validated first, whether it comes from the control loop or from a manual
//! override.
//!
//! ```text
//!  ControlLoop ──┐                         ┌──────────────────────┐
//!                ├─► HardwareCoordinator ─►│ SafetyController     │
//!  ClientHub ────┘   (async mutex)         │ DeviceClient ─► link │
//!                        │                 └──────────────────────┘
//!                        └─► broadcast<HardwareEvent> ─► ClientHub
//! ```
//!
//! Background heartbeat and monitor loops run under a [`TaskSupervisor`]
//! started by [`HardwareCoordinator::initialize`].

use crate::device::{ConnectionStatus, DeviceClient, DeviceError};
use crate::link::DeviceLink;
use crate::safety::{ActiveAlert, SafetyController};
use crate::supervisor::{Schedule, TaskSupervisor};
use chrono::{DateTime, Utc};
use kinetic_common::config::{DeviceConfig, SafetyConfig, secs};
use kinetic_common::motor::{CommandSet, MotorCommand, MotorMap, MotorName, MotorState, SafetyLimits};
use kinetic_common::safety::{SafetyAlert, SafetyLevel, SafetyViolation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, error, info, warn};

/// Capacity of the hardware event channel.
const EVENT_CAPACITY: usize = 256;

/// Failure of a hardware operation.
#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    /// Vetoed by the safety controller; the emergency stop has been triggered.
    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    /// Device communication failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Why an emergency stop was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A command set was vetoed.
    SafetyViolation,
    /// A temperature reading crossed the veto threshold.
    Overtemperature,
    /// The control loop hit its consecutive-error ceiling.
    ErrorCeiling,
    /// The control loop hit its safety-violation ceiling.
    CriticalErrors,
    /// A hub client asked for it.
    ClientRequest,
    /// A session was stopped or paused.
    SessionStopped,
    /// The coordinator is shutting down.
    Shutdown,
}

impl StopReason {
    /// Whether the stop is sent to the device again when already latched.
    pub const fn resends_when_latched(self) -> bool {
        matches!(self, Self::ClientRequest | Self::Shutdown)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SafetyViolation => "safety violation",
            Self::Overtemperature => "overtemperature",
            Self::ErrorCeiling => "consecutive error ceiling",
            Self::CriticalErrors => "critical error ceiling",
            Self::ClientRequest => "client request",
            Self::SessionStopped => "session stopped",
            Self::Shutdown => "shutdown",
        })
    }
}

/// State changes published to observers.
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    /// Motor states after a successful send or stop.
    MotorStates(MotorMap<MotorState>),
    /// A new safety alert.
    Alert(SafetyAlert),
    /// The emergency stop was triggered.
    EmergencyStop {
        reason: StopReason,
        initiated_by: Option<String>,
    },
    /// The emergency stop was released.
    EmergencyReset,
}

/// Execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareStats {
    pub command_count: u64,
    pub error_count: u64,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`HardwareCoordinator::system_status`].
#[derive(Debug, Clone, Serialize)]
pub struct HardwareStatus {
    pub connection_status: ConnectionStatus,
    pub endpoint: String,
    pub safety_level: SafetyLevel,
    pub emergency_stop_active: bool,
    pub motor_states: MotorMap<MotorState>,
    pub active_alerts: Vec<ActiveAlert>,
    pub statistics: HardwareStats,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Background loop timing.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub heartbeat: Schedule,
    pub monitor_interval: Duration,
}

impl From<&DeviceConfig> for CoordinatorSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            heartbeat: Schedule::every(secs(config.heartbeat_interval_secs))
                .with_retry(secs(config.heartbeat_retry_secs)),
            monitor_interval: secs(config.monitor_interval_secs),
        }
    }
}

struct Core {
    safety: SafetyController,
    device: DeviceClient,
    stats: HardwareStats,
}

struct Inner {
    core: Mutex<Core>,
    tasks: Mutex<Option<TaskSupervisor>>,
    events: broadcast::Sender<HardwareEvent>,
    settings: CoordinatorSettings,
    limits: SafetyLimits,
}

/// Cloneable handle to the single hardware owner.
#[derive(Clone)]
pub struct HardwareCoordinator {
    inner: Arc<Inner>,
}

impl HardwareCoordinator {
    /// Build a coordinator over `link`.
    pub fn new(link: Box<dyn DeviceLink>, device: &DeviceConfig, safety: &SafetyConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    safety: SafetyController::new(safety.clone()),
                    device: DeviceClient::new(link, safety.limits),
                    stats: HardwareStats::default(),
                }),
                tasks: Mutex::new(None),
                events,
                settings: CoordinatorSettings::from(device),
                limits: safety.limits,
            }),
        }
    }

    /// Receive hardware events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HardwareEvent> {
        self.inner.events.subscribe()
    }

    /// Configured safety limits.
    pub fn limits(&self) -> SafetyLimits {
        self.inner.limits
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Connect the device and start the heartbeat and monitor loops.
    ///
    /// Idempotent. Returns `false` if the device could not be reached.
    pub async fn initialize(&self) -> bool {
        {
            let mut core = self.inner.core.lock().await;
            if let Err(e) = core.device.connect().await {
                error!("Hardware initialization failed: {e}");
                return false;
            }
        }

        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_none() {
            *tasks = Some(self.start_background());
            info!("✅ Hardware coordinator initialized");
        }
        true
    }

    fn start_background(&self) -> TaskSupervisor {
        let mut supervisor = TaskSupervisor::new("hardware");

        let weak = Arc::downgrade(&self.inner);
        supervisor.spawn_periodic("heartbeat", self.inner.settings.heartbeat, move || {
            let weak = Weak::clone(&weak);
            async move {
                match weak.upgrade() {
                    Some(inner) => heartbeat_tick(&inner).await,
                    None => Ok(()),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        supervisor.spawn_periodic(
            "monitor",
            Schedule::every(self.inner.settings.monitor_interval),
            move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(inner) = weak.upgrade() {
                        monitor_tick(&inner).await;
                    }
                    Ok::<(), DeviceError>(())
                }
            },
        );
        supervisor
    }

    /// Stop background loops, emergency-stop and disconnect. Best effort.
    pub async fn shutdown(&self) {
        info!("🛑 Hardware coordinator shutting down");
        if let Some(mut tasks) = self.inner.tasks.lock().await.take() {
            tasks.shutdown().await;
        }
        let mut core = self.inner.core.lock().await;
        let fresh = !core.safety.is_emergency_stop_active();
        if let Err(e) = self.stop_locked(&mut core, StopReason::Shutdown, None, fresh).await {
            warn!("Emergency stop during shutdown failed: {e}");
        }
        core.device.disconnect().await;
    }

    // ─── Commands ───────────────────────────────────────────────────

    /// Validate and send a command set.
    ///
    /// A safety veto triggers the emergency stop before the violation is
    /// returned. A device failure increments the error counter.
    pub async fn execute_command_set(
        &self,
        set: &CommandSet,
        session_id: Option<&str>,
    ) -> Result<(), HardwareError> {
        let mut core = self.inner.core.lock().await;
        self.execute_locked(&mut core, set, session_id).await
    }

    /// Manual override for one motor.
    ///
    /// The other three motors keep their last commanded targets. The merged
    /// set takes the same validated path as the control loop.
    pub async fn execute_manual(
        &self,
        motor: MotorName,
        command: MotorCommand,
        initiated_by: Option<&str>,
    ) -> Result<CommandSet, HardwareError> {
        if !self.is_connected().await && !self.initialize().await {
            return Err(DeviceError::NotConnected.into());
        }

        let mut core = self.inner.core.lock().await;
        let base = core.device.motor_states().map(|_, state| {
            MotorCommand::new(state.target_velocity_rpm, state.target_direction)
                .unwrap_or(MotorCommand::STOP)
        });
        let set = CommandSet::new(0, base)
            .with_limits(self.inner.limits)
            .with_motor(motor, command);
        debug!(%motor, velocity = command.velocity_rpm(), by = ?initiated_by, "Manual motor command");
        self.execute_locked(&mut core, &set, None).await?;
        Ok(set)
    }

    async fn execute_locked(
        &self,
        core: &mut MutexGuard<'_, Core>,
        set: &CommandSet,
        session_id: Option<&str>,
    ) -> Result<(), HardwareError> {
        let was_latched = core.safety.is_emergency_stop_active();
        let verdict = core.safety.validate(set);
        self.publish_alerts(core);
        if let Err(violation) = verdict {
            if was_latched {
                debug!("Command set {} refused: {violation}", set.epoch);
                return Err(violation.into());
            }
            error!("Command set {} vetoed: {violation}", set.epoch);
            if let Err(e) = self
                .stop_locked(core, StopReason::SafetyViolation, None, true)
                .await
            {
                warn!("Emergency stop after violation failed: {e}");
            }
            return Err(violation.into());
        }

        for (motor, command) in set.motors.iter() {
            if command.speed() > 0.0 {
                core.safety.start_motor_timing(motor);
            } else {
                core.safety.stop_motor_timing(motor);
            }
        }

        match core.device.send_command_set(set, session_id).await {
            Ok(()) => {
                core.stats.command_count += 1;
                core.stats.last_command_at = Some(Utc::now());
                self.publish(HardwareEvent::MotorStates(*core.device.motor_states()));
                Ok(())
            }
            Err(e) => {
                core.stats.error_count += 1;
                Err(e.into())
            }
        }
    }

    /// Latch the emergency stop and stop the motors.
    ///
    /// The latch is set even when the device cannot be reached; the device
    /// error is returned in that case. Observers are told only when the
    /// latch is newly set. With the stop already latched, only operator and
    /// shutdown stops reach the device again.
    pub async fn emergency_stop(
        &self,
        reason: StopReason,
        initiated_by: Option<&str>,
    ) -> Result<(), DeviceError> {
        let mut core = self.inner.core.lock().await;
        let fresh = !core.safety.is_emergency_stop_active();
        if !fresh && !reason.resends_when_latched() {
            debug!(%reason, "Emergency stop already active");
            return Ok(());
        }
        self.stop_locked(&mut core, reason, initiated_by, fresh).await
    }

    async fn stop_locked(
        &self,
        core: &mut MutexGuard<'_, Core>,
        reason: StopReason,
        initiated_by: Option<&str>,
        announce: bool,
    ) -> Result<(), DeviceError> {
        core.safety.emergency_stop(&reason.to_string());
        self.publish_alerts(core);
        if announce {
            self.publish(HardwareEvent::EmergencyStop {
                reason,
                initiated_by: initiated_by.map(str::to_owned),
            });
        }
        core.device.emergency_stop().await?;
        self.publish(HardwareEvent::MotorStates(*core.device.motor_states()));
        Ok(())
    }

    /// Release the emergency stop. Fails while critical alerts are unresolved.
    pub async fn reset_emergency_stop(&self) -> Result<bool, SafetyViolation> {
        let mut core = self.inner.core.lock().await;
        let outcome = core.safety.reset_emergency_stop();
        self.publish_alerts(&mut core);
        if let Ok(true) = outcome {
            info!("Emergency stop reset");
            self.publish(HardwareEvent::EmergencyReset);
        }
        outcome
    }

    /// Mark a safety alert resolved.
    pub async fn resolve_alert(&self, index: usize) -> bool {
        self.inner.core.lock().await.safety.resolve_alert(index)
    }

    /// Feed a temperature reading; crossing the veto threshold stops the motors.
    pub async fn update_motor_temperature(&self, motor: MotorName, temperature_c: f64) {
        let mut core = self.inner.core.lock().await;
        let was_latched = core.safety.is_emergency_stop_active();
        core.safety.update_motor_temperature(motor, temperature_c);
        if core.safety.motor_temperature(motor) == Some(temperature_c) {
            core.device.set_temperature(motor, temperature_c);
        }
        self.publish_alerts(&mut core);

        if !was_latched && core.safety.is_emergency_stop_active() {
            self.publish(HardwareEvent::EmergencyStop {
                reason: StopReason::Overtemperature,
                initiated_by: None,
            });
            if let Err(e) = core.device.emergency_stop().await {
                warn!("Emergency stop after overtemperature failed: {e}");
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub async fn is_connected(&self) -> bool {
        self.inner.core.lock().await.device.is_connected()
    }

    pub async fn is_emergency_stop_active(&self) -> bool {
        self.inner.core.lock().await.safety.is_emergency_stop_active()
    }

    pub async fn motor_states(&self) -> MotorMap<MotorState> {
        *self.inner.core.lock().await.device.motor_states()
    }

    pub async fn stats(&self) -> HardwareStats {
        self.inner.core.lock().await.stats.clone()
    }

    /// Full status snapshot.
    pub async fn system_status(&self) -> HardwareStatus {
        let core = self.inner.core.lock().await;
        HardwareStatus {
            connection_status: core.device.status(),
            endpoint: core.device.endpoint(),
            safety_level: core.safety.safety_level(),
            emergency_stop_active: core.safety.is_emergency_stop_active(),
            motor_states: *core.device.motor_states(),
            active_alerts: core.safety.active_alerts(),
            statistics: core.stats.clone(),
            last_heartbeat: core.device.last_heartbeat(),
        }
    }

    /// Whether the background loops are running.
    pub async fn background_running(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.running() > 0)
    }

    fn publish(&self, event: HardwareEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn publish_alerts(&self, core: &mut Core) {
        for alert in core.safety.take_new_alerts() {
            self.publish(HardwareEvent::Alert(alert));
        }
    }
}

async fn heartbeat_tick(inner: &Inner) -> Result<(), DeviceError> {
    let mut core = inner.core.lock().await;
    if !core.device.is_connected() {
        debug!("Heartbeat skipped: device not connected");
        return Ok(());
    }
    core.device.heartbeat().await
}

async fn monitor_tick(inner: &Inner) {
    let core = inner.core.lock().await;
    if core.device.status() == ConnectionStatus::Error {
        warn!("Motor device link is in error state");
    }
    for (motor, state) in core.device.motor_states().iter() {
        if state.is_overheating() {
            warn!(%motor, temperature_c = ?state.temperature_c, "🌡️ Motor running hot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedLink;
    use kinetic_common::safety::ViolationKind;

    fn coordinator() -> (HardwareCoordinator, SimulatedLink) {
        let link = SimulatedLink::new();
        let hw = HardwareCoordinator::new(
            Box::new(link.clone()),
            &DeviceConfig::default(),
            &SafetyConfig::default(),
        );
        (hw, link)
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (hw, link) = coordinator();
        assert!(hw.initialize().await);
        assert!(hw.initialize().await);
        assert!(hw.background_running().await);
        assert_eq!(link.device().lock().count("init"), 1);
        hw.shutdown().await;
        assert!(!hw.background_running().await);
    }

    #[tokio::test]
    async fn initialize_reports_unreachable_device() {
        let (hw, link) = coordinator();
        link.device().lock().refuse_connections = true;
        assert!(!hw.initialize().await);
        assert!(!hw.background_running().await);
    }

    #[tokio::test]
    async fn violation_triggers_device_emergency_stop() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        let mut events = hw.subscribe();

        let set = CommandSet::stopped(1).with_motor(
            MotorName::Canvas,
            MotorCommand::from_velocity(130.0).unwrap(),
        );
        let err = hw.execute_command_set(&set, None).await.unwrap_err();
        match err {
            HardwareError::Safety(v) => {
                assert_eq!(v.kind, ViolationKind::VelocityExceeded);
                assert_eq!(v.motor, Some(MotorName::Canvas));
            }
            other => panic!("expected safety error, got {other}"),
        }

        let device = link.device();
        assert_eq!(device.lock().count("motor_commands"), 0);
        assert_eq!(device.lock().count("emergency_stop"), 1);
        assert!(hw.is_emergency_stop_active().await);

        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            if let HardwareEvent::EmergencyStop { reason, .. } = event {
                assert_eq!(reason, StopReason::SafetyViolation);
                saw_stop = true;
            }
        }
        assert!(saw_stop);
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn device_error_counts_but_does_not_latch() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        link.device().lock().fail_sends = true;
        let err = hw
            .execute_command_set(&CommandSet::stopped(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::Device(_)));
        assert_eq!(hw.stats().await.error_count, 1);
        assert!(!hw.is_emergency_stop_active().await);
    }

    #[tokio::test]
    async fn manual_command_merges_with_last_targets() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        let set = CommandSet::stopped(0)
            .with_motor(MotorName::PenBrush, MotorCommand::from_velocity(20.0).unwrap());
        hw.execute_command_set(&set, None).await.unwrap();

        let sent = hw
            .execute_manual(MotorName::Canvas, MotorCommand::from_velocity(-30.0).unwrap(), Some("c1"))
            .await
            .unwrap();
        assert_eq!(sent.command(MotorName::PenBrush).velocity_rpm(), 20.0);
        assert_eq!(sent.command(MotorName::Canvas).velocity_rpm(), -30.0);
        assert_eq!(link.device().lock().count("motor_commands"), 2);
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn manual_command_is_validated() {
        let (hw, link) = coordinator();
        let err = hw
            .execute_manual(MotorName::PenColorDepth, MotorCommand::from_velocity(75.0).unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::Safety(_)));
        // Lazily connected, then stopped.
        let device = link.device();
        assert_eq!(device.lock().count("init"), 1);
        assert_eq!(device.lock().count("motor_commands"), 0);
        assert_eq!(device.lock().count("emergency_stop"), 1);
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn vetoes_while_latched_do_not_repeat_the_stop() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        let mut events = hw.subscribe();

        let overspeed = CommandSet::stopped(1)
            .with_motor(MotorName::Canvas, MotorCommand::from_velocity(130.0).unwrap());
        assert!(hw.execute_command_set(&overspeed, None).await.is_err());
        for _ in 0..4 {
            let err = hw
                .execute_manual(MotorName::Canvas, MotorCommand::from_velocity(10.0).unwrap(), None)
                .await
                .unwrap_err();
            match err {
                HardwareError::Safety(v) => assert_eq!(v.kind, ViolationKind::EmergencyStopActive),
                other => panic!("expected safety error, got {other}"),
            }
        }

        let mut stops = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HardwareEvent::EmergencyStop { .. }) {
                stops += 1;
            }
        }
        assert_eq!(stops, 1);
        assert_eq!(link.device().lock().count("emergency_stop"), 1);

        // The loop halting afterwards adds nothing either.
        hw.emergency_stop(StopReason::CriticalErrors, None).await.unwrap();
        assert_eq!(link.device().lock().count("emergency_stop"), 1);

        // An operator stop reaches the device again without a new broadcast.
        hw.emergency_stop(StopReason::ClientRequest, Some("c1")).await.unwrap();
        assert_eq!(link.device().lock().count("emergency_stop"), 2);
        assert!(
            std::iter::from_fn(|| events.try_recv().ok())
                .all(|e| !matches!(e, HardwareEvent::EmergencyStop { .. }))
        );
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn stop_set_passes_after_long_run() {
        let link = SimulatedLink::new();
        let hw = HardwareCoordinator::new(
            Box::new(link.clone()),
            &DeviceConfig::default(),
            &SafetyConfig {
                runtime_critical_secs: 0.02,
                ..SafetyConfig::default()
            },
        );
        hw.initialize().await;
        let moving = CommandSet::stopped(0)
            .with_motor(MotorName::Canvas, MotorCommand::from_velocity(40.0).unwrap());
        hw.execute_command_set(&moving, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        hw.execute_command_set(&CommandSet::stopped(1), None).await.unwrap();
        assert!(!hw.is_emergency_stop_active().await);
        assert_eq!(link.device().lock().count("motor_commands"), 2);
        assert_eq!(link.device().lock().count("emergency_stop"), 0);
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn overtemperature_stops_motors() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        hw.update_motor_temperature(MotorName::PenElevation, 88.0).await;
        assert!(hw.is_emergency_stop_active().await);
        assert_eq!(link.device().lock().count("emergency_stop"), 1);
        assert!(hw.reset_emergency_stop().await.is_err());

        let status = hw.system_status().await;
        assert_eq!(status.safety_level, SafetyLevel::Emergency);
        assert_eq!(status.motor_states[MotorName::PenElevation].temperature_c, Some(88.0));
        hw.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_then_disconnects() {
        let (hw, link) = coordinator();
        hw.initialize().await;
        hw.shutdown().await;
        let device = link.device();
        let device = device.lock();
        let kinds: Vec<_> = device.received.iter().map(|m| m.kind()).collect();
        // Coordinator stop, then the device client's own stop before goodbye.
        assert_eq!(kinds.first(), Some(&"init"));
        assert_eq!(kinds.last(), Some(&"disconnect"));
        assert!(device.count("emergency_stop") >= 1);
    }
}
