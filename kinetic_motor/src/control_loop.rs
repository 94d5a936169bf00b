//! # Control Loop
//!
//! Fixed-cadence pipeline for one blockchain session: ask the
//! [`CommandSource`] for the epoch's command set, push it through the
//! [`HardwareCoordinator`], count failures and escalate.
//!
//! # Cycle
//!
//! ```text
//! consecutive ≥ max? ──yes──► emergency stop, exit
//!        │no
//!  next_command_set(epoch) ─► check ─► execute_command_set
//!        │                                   │
//!     success: consecutive = 0, epoch += 1   │
//!     failure: consecutive += 1 ◄────────────┘
//!              safety: critical += 1, ≥ threshold ─► emergency stop, exit
//!        │
//!  sleep(cadence − elapsed)   (retry delay after an unexpected failure)
//! ```
//!
//! Unexpected failures (a source reporting an internal error, or a command
//! set that fails its own checks) count toward the consecutive ceiling like
//! any other failure. They are followed by the fixed retry delay instead of
//! the cadence remainder.

use crate::coordinator::{HardwareCoordinator, HardwareError, StopReason};
use crate::source::{CommandSource, DataError};
use crate::supervisor::{Schedule, ShutdownSignal, TaskSupervisor};
use chrono::{DateTime, Utc};
use heapless::HistoryBuffer;
use kinetic_common::config::{ControlLoopConfig, secs};
use kinetic_common::consts::RECENT_ERROR_CAPACITY;
use kinetic_common::motor::CommandError;
use kinetic_common::safety::SafetyViolation;
use kinetic_common::session::{Session, SessionMode, SessionStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Consecutive errors above which the loop counts as degraded.
const DEGRADED_CONSECUTIVE_ERRORS: u32 = 2;

/// Failure to start or resume the loop.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("Control loop is already running")]
    AlreadyRunning,

    #[error("Control loop requires a blockchain session, got {0}")]
    UnsupportedMode(SessionMode),

    #[error("Session {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: String,
        actual: SessionStatus,
        expected: SessionStatus,
    },

    #[error("Hardware initialization failed")]
    HardwareUnavailable,

    #[error("Emergency stop cannot be released: {0}")]
    EmergencyStopLatched(SafetyViolation),
}

/// Loop timing and ceilings.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub cycle_interval: Duration,
    pub max_consecutive_errors: u32,
    pub emergency_stop_threshold: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
}

impl From<&ControlLoopConfig> for LoopSettings {
    fn from(config: &ControlLoopConfig) -> Self {
        Self {
            cycle_interval: secs(config.cycle_interval_secs),
            max_consecutive_errors: config.max_consecutive_errors,
            emergency_stop_threshold: config.emergency_stop_threshold,
            retry_delay: secs(config.retry_delay_secs),
            health_check_interval: secs(config.health_check_interval_secs),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&ControlLoopConfig::default())
    }
}

// ─── Statistics ─────────────────────────────────────────────────────

/// Category of a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleErrorKind {
    Data,
    Device,
    Safety,
    Unexpected,
}

/// One entry of the recent-error history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleError {
    pub epoch: u64,
    pub at: DateTime<Utc>,
    pub kind: CycleErrorKind,
    pub message: String,
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub consecutive_errors: u32,
    pub critical_errors: u32,
    /// Epoch of the next cycle.
    pub epoch: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Mean duration of successful cycles [ms].
    pub average_cycle_ms: f64,
}

/// Coarse loop health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopHealth {
    Stopped,
    Critical,
    Degraded,
    HardwareDisconnected,
    Healthy,
}

/// Snapshot returned by [`ControlLoop::status`].
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub session_id: String,
    pub running: bool,
    pub health: LoopHealth,
    pub halt_reason: Option<StopReason>,
    pub statistics: LoopStats,
    pub recent_errors: Vec<CycleError>,
}

struct LoopState {
    stats: LoopStats,
    recent_errors: HistoryBuffer<CycleError, RECENT_ERROR_CAPACITY>,
    running: bool,
    halt_reason: Option<StopReason>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            stats: LoopStats::default(),
            recent_errors: HistoryBuffer::new(),
            running: false,
            halt_reason: None,
        }
    }

    fn record_success(&mut self, elapsed: Duration) {
        let stats = &mut self.stats;
        stats.total_cycles += 1;
        stats.successful_cycles += 1;
        stats.consecutive_errors = 0;
        stats.last_cycle_at = Some(Utc::now());
        let n = stats.successful_cycles as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        stats.average_cycle_ms += (ms - stats.average_cycle_ms) / n;
    }

    /// Count a failure; returns the critical error count.
    fn record_failure(&mut self, epoch: u64, failure: &CycleFailure) -> u32 {
        let kind = failure.kind();
        let stats = &mut self.stats;
        stats.total_cycles += 1;
        stats.failed_cycles += 1;
        stats.consecutive_errors += 1;
        stats.last_cycle_at = Some(Utc::now());
        if kind == CycleErrorKind::Safety {
            stats.critical_errors += 1;
        }
        self.recent_errors.write(CycleError {
            epoch,
            at: Utc::now(),
            kind,
            message: failure.to_string(),
        });
        self.stats.critical_errors
    }
}

#[derive(Debug, Error)]
enum CycleFailure {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("Invalid command set: {0}")]
    Invalid(#[from] CommandError),
}

impl CycleFailure {
    fn kind(&self) -> CycleErrorKind {
        match self {
            Self::Data(DataError::Internal(_)) | Self::Invalid(_) => CycleErrorKind::Unexpected,
            Self::Data(_) => CycleErrorKind::Data,
            Self::Hardware(HardwareError::Device(_)) => CycleErrorKind::Device,
            Self::Hardware(HardwareError::Safety(_)) => CycleErrorKind::Safety,
        }
    }
}

// ─── Loop ───────────────────────────────────────────────────────────

/// Everything the background tasks need, cheap to clone.
#[derive(Clone)]
struct LoopContext {
    session_id: String,
    coordinator: HardwareCoordinator,
    source: Arc<dyn CommandSource>,
    settings: LoopSettings,
    state: Arc<Mutex<LoopState>>,
}

impl LoopContext {
    async fn cycle(&self, epoch: u64) -> Result<(), CycleFailure> {
        let set = self.source.next_command_set(epoch).await?;
        set.check()?;
        self.coordinator
            .execute_command_set(&set, Some(&self.session_id))
            .await?;
        Ok(())
    }

    async fn run(self, mut signal: ShutdownSignal) {
        info!(session = %self.session_id, source = self.source.name(), "▶️ Control loop running");
        let settings = self.settings;

        loop {
            let (consecutive, epoch) = {
                let state = self.state.lock();
                (state.stats.consecutive_errors, state.stats.epoch)
            };
            if consecutive >= settings.max_consecutive_errors {
                error!(consecutive, "Too many consecutive errors, stopping control loop");
                self.halt(StopReason::ErrorCeiling).await;
                break;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = self.cycle(epoch) => outcome,
                _ = signal.cancelled() => break,
            };
            let elapsed = started.elapsed();

            let pause = match outcome {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.record_success(elapsed);
                    state.stats.epoch += 1;
                    debug!(epoch, ms = elapsed.as_millis() as u64, "Cycle completed");
                    settings.cycle_interval.saturating_sub(elapsed)
                }
                Err(failure) => {
                    let kind = failure.kind();
                    warn!(epoch, ?kind, "Cycle failed: {failure}");
                    let critical = self.state.lock().record_failure(epoch, &failure);
                    if critical >= settings.emergency_stop_threshold {
                        error!(critical, "Critical error threshold reached");
                        self.halt(StopReason::CriticalErrors).await;
                        break;
                    }
                    if kind == CycleErrorKind::Unexpected {
                        settings.retry_delay
                    } else {
                        settings.cycle_interval.saturating_sub(elapsed)
                    }
                }
            };

            if !signal.sleep(pause).await {
                break;
            }
        }

        self.state.lock().running = false;
        info!(session = %self.session_id, "⏹️ Control loop stopped");
    }

    async fn halt(&self, reason: StopReason) {
        self.state.lock().halt_reason = Some(reason);
        if let Err(e) = self.coordinator.emergency_stop(reason, None).await {
            warn!("Emergency stop failed: {e}");
        }
    }

    async fn health_check(&self) -> Result<(), DataError> {
        if !self.coordinator.is_connected().await {
            warn!(session = %self.session_id, "Hardware disconnected");
        }
        let consecutive = self.state.lock().stats.consecutive_errors;
        if consecutive > DEGRADED_CONSECUTIVE_ERRORS {
            warn!(session = %self.session_id, consecutive, "High error rate");
        }
        Ok(())
    }
}

/// Control loop bound to one session.
pub struct ControlLoop {
    ctx: LoopContext,
    tasks: Option<TaskSupervisor>,
}

impl ControlLoop {
    pub fn new(
        session_id: impl Into<String>,
        coordinator: HardwareCoordinator,
        source: Arc<dyn CommandSource>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            ctx: LoopContext {
                session_id: session_id.into(),
                coordinator,
                source,
                settings,
                state: Arc::new(Mutex::new(LoopState::new())),
            },
            tasks: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    /// Whether the main loop is running.
    pub fn is_running(&self) -> bool {
        self.ctx.state.lock().running
    }

    /// Why the loop stopped itself, if it did.
    pub fn halt_reason(&self) -> Option<StopReason> {
        self.ctx.state.lock().halt_reason
    }

    pub fn stats(&self) -> LoopStats {
        self.ctx.state.lock().stats.clone()
    }

    /// Recent failures, oldest first.
    pub fn recent_errors(&self) -> Vec<CycleError> {
        self.ctx
            .state
            .lock()
            .recent_errors
            .oldest_ordered()
            .cloned()
            .collect()
    }

    pub async fn health(&self) -> LoopHealth {
        let (running, stats) = {
            let state = self.ctx.state.lock();
            (state.running, state.stats.clone())
        };
        if !running {
            LoopHealth::Stopped
        } else if stats.critical_errors >= self.ctx.settings.emergency_stop_threshold {
            LoopHealth::Critical
        } else if stats.consecutive_errors > DEGRADED_CONSECUTIVE_ERRORS {
            LoopHealth::Degraded
        } else if !self.ctx.coordinator.is_connected().await {
            LoopHealth::HardwareDisconnected
        } else {
            LoopHealth::Healthy
        }
    }

    pub async fn status(&self) -> LoopStatus {
        let health = self.health().await;
        let state = self.ctx.state.lock();
        LoopStatus {
            session_id: self.ctx.session_id.clone(),
            running: state.running,
            health,
            halt_reason: state.halt_reason,
            statistics: state.stats.clone(),
            recent_errors: state.recent_errors.oldest_ordered().cloned().collect(),
        }
    }

    /// Start from epoch 0. The session must be a blockchain session in
    /// CREATED state (a snapshot taken before the manager's transition).
    pub async fn start(&mut self, session: &Session) -> Result<(), OrchestrationError> {
        self.admit(session, SessionStatus::Created)?;
        self.launch(0).await
    }

    /// Continue a paused session from the epoch where it stopped.
    pub async fn resume(&mut self, session: &Session) -> Result<(), OrchestrationError> {
        self.admit(session, SessionStatus::Paused)?;
        let epoch = self.ctx.state.lock().stats.epoch;
        self.launch(epoch).await
    }

    fn admit(&self, session: &Session, expected: SessionStatus) -> Result<(), OrchestrationError> {
        if self.is_running() {
            return Err(OrchestrationError::AlreadyRunning);
        }
        if session.mode != SessionMode::Blockchain {
            return Err(OrchestrationError::UnsupportedMode(session.mode));
        }
        if session.status != expected {
            return Err(OrchestrationError::InvalidStatus {
                id: session.id.clone(),
                actual: session.status,
                expected,
            });
        }
        Ok(())
    }

    async fn launch(&mut self, epoch: u64) -> Result<(), OrchestrationError> {
        let coordinator = &self.ctx.coordinator;
        if !coordinator.initialize().await {
            return Err(OrchestrationError::HardwareUnavailable);
        }
        if coordinator.is_emergency_stop_active().await {
            coordinator
                .reset_emergency_stop()
                .await
                .map_err(OrchestrationError::EmergencyStopLatched)?;
        }

        if let Some(mut stale) = self.tasks.take() {
            stale.shutdown().await;
        }
        {
            let mut state = self.ctx.state.lock();
            state.stats.epoch = epoch;
            state.stats.consecutive_errors = 0;
            state.stats.critical_errors = 0;
            state.running = true;
            state.halt_reason = None;
        }

        let mut supervisor = TaskSupervisor::new(format!("control-loop-{}", self.ctx.session_id));
        let ctx = self.ctx.clone();
        supervisor.spawn("cycle", move |signal| ctx.run(signal));

        let ctx = self.ctx.clone();
        supervisor.spawn_periodic(
            "health",
            Schedule::every(self.ctx.settings.health_check_interval),
            move || {
                let ctx = ctx.clone();
                async move { ctx.health_check().await }
            },
        );
        self.tasks = Some(supervisor);
        info!(session = %self.ctx.session_id, epoch, "🚀 Control loop started");
        Ok(())
    }

    /// Cancel the tasks, emergency-stop the coordinator and shut it down.
    pub async fn stop(&mut self) {
        let Some(mut tasks) = self.tasks.take() else {
            return;
        };
        info!(session = %self.ctx.session_id, "Stopping control loop");
        tasks.shutdown().await;
        self.ctx.state.lock().running = false;

        let coordinator = &self.ctx.coordinator;
        if let Err(e) = coordinator.emergency_stop(StopReason::SessionStopped, None).await {
            warn!("Emergency stop on loop stop failed: {e}");
        }
        coordinator.shutdown().await;
    }

    /// Run one cycle outside the schedule.
    ///
    /// Without a connected device the set is produced and checked but not
    /// sent. Does not touch the epoch or the consecutive error count.
    pub async fn execute_single_cycle(&self, epoch: u64) -> bool {
        let started = Instant::now();
        let outcome = if self.ctx.coordinator.is_connected().await {
            self.ctx.cycle(epoch).await
        } else {
            warn!("Hardware not connected, command set computed but not sent");
            match self.ctx.source.next_command_set(epoch).await {
                Ok(set) => set.check().map_err(CycleFailure::from),
                Err(e) => Err(e.into()),
            }
        };

        let mut state = self.ctx.state.lock();
        match outcome {
            Ok(()) => {
                let consecutive = state.stats.consecutive_errors;
                state.record_success(started.elapsed());
                state.stats.consecutive_errors = consecutive;
                true
            }
            Err(failure) => {
                error!(epoch, "Single cycle failed: {failure}");
                let consecutive = state.stats.consecutive_errors;
                state.record_failure(epoch, &failure);
                state.stats.consecutive_errors = consecutive;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds() {
        assert_eq!(
            CycleFailure::from(DataError::Unavailable("x".into())).kind(),
            CycleErrorKind::Data
        );
        assert_eq!(
            CycleFailure::from(DataError::Internal("x".into())).kind(),
            CycleErrorKind::Unexpected
        );
        assert_eq!(
            CycleFailure::from(CommandError::InvalidDuration(0.0)).kind(),
            CycleErrorKind::Unexpected
        );
    }

    #[test]
    fn recent_errors_are_bounded() {
        let mut state = LoopState::new();
        for epoch in 0..(RECENT_ERROR_CAPACITY as u64 + 10) {
            state.record_failure(epoch, &CycleFailure::from(DataError::Exhausted { epoch }));
        }
        assert_eq!(state.recent_errors.len(), RECENT_ERROR_CAPACITY);
        let oldest = state.recent_errors.oldest_ordered().next().map(|e| e.epoch);
        assert_eq!(oldest, Some(10));
        assert_eq!(state.stats.consecutive_errors as usize, RECENT_ERROR_CAPACITY + 10);
    }

    #[test]
    fn average_tracks_successful_cycles() {
        let mut state = LoopState::new();
        state.record_success(Duration::from_millis(10));
        state.record_success(Duration::from_millis(30));
        assert!((state.stats.average_cycle_ms - 20.0).abs() < 1e-6);
        assert_eq!(state.stats.successful_cycles, 2);
    }
}
