//! # Session Manager
//!
//! Owns the session registry and the control loop of the running session.
//!
//! # Design
//!
//! - All lifecycle operations run under one async mutex, so the concurrency
//!   check and the loop start cannot interleave with another request.
//! - Only blockchain sessions own a [`ControlLoop`]; other modes are
//!   acknowledged and driven by hub clients.
//! - Every change is written to `{storage_dir}/{id}.json`.
//! - Background tasks: autosave, retention cleanup and reconciliation of
//!   sessions whose loop stopped on its own.
//! - Listeners receive [`SessionEvent`]s over a broadcast channel; this is the
//!   only coupling to the client hub.

use crate::store::{SessionStore, StorageError};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use kinetic_common::config::{SessionConfig, secs};
use kinetic_common::session::{Session, SessionMetrics, SessionMode, SessionStatus, TransitionError};
use kinetic_motor::control_loop::LoopStatus;
use kinetic_motor::{
    CommandSource, ControlLoop, HardwareCoordinator, LoopSettings, OrchestrationError, Schedule,
    TaskSupervisor,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Session lifecycle failure.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Maximum concurrent sessions reached")]
    ConcurrencyLimit,

    #[error("Session {id} is already {status}")]
    Closed { id: String, status: SessionStatus },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Notification sent to session listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(Session),
    Started(Session),
    /// The session reached COMPLETED or FAILED.
    Completed(Session),
    ClientJoined {
        session_id: String,
        client_id: String,
        client_type: String,
    },
}

/// Manager counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub total_sessions_created: u64,
    pub total_sessions_completed: u64,
    pub total_sessions_failed: u64,
    pub average_session_duration_minutes: f64,
    pub active_sessions: usize,
    pub stored_sessions: usize,
    pub max_concurrent_sessions: usize,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Session>,
    loops: HashMap<String, ControlLoop>,
    stats: ManagerStats,
}

impl Registry {
    fn open_sessions(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    fn session_mut(&mut self, id: &str) -> Result<&mut Session, SessionError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Count a finished session and fold its duration into the average.
    fn record_finished(&mut self, session: &Session) {
        match session.status {
            SessionStatus::Completed => {
                self.stats.total_sessions_completed += 1;
                if let Some(minutes) = session.metrics.actual_duration_minutes {
                    let n = self.stats.total_sessions_completed as f64;
                    let avg = &mut self.stats.average_session_duration_minutes;
                    *avg += (minutes - *avg) / n;
                }
            }
            SessionStatus::Failed => self.stats.total_sessions_failed += 1,
            _ => {}
        }
    }
}

struct Inner {
    registry: Mutex<Registry>,
    store: SessionStore,
    events: broadcast::Sender<SessionEvent>,
    hardware: HardwareCoordinator,
    source: Arc<dyn CommandSource>,
    loop_settings: LoopSettings,
    config: SessionConfig,
    tasks: Mutex<Option<TaskSupervisor>>,
}

/// Cloneable handle to the session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        hardware: HardwareCoordinator,
        source: Arc<dyn CommandSource>,
        loop_settings: LoopSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                store: SessionStore::new(config.storage_dir.clone()),
                events,
                hardware,
                source,
                loop_settings,
                config,
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn hardware(&self) -> &HardwareCoordinator {
        &self.inner.hardware
    }

    // ─── Startup / shutdown ─────────────────────────────────────────

    /// Load stored sessions.
    ///
    /// Sessions that were running when the process ended have lost their
    /// control loop and are marked FAILED.
    pub async fn load(&self) -> Result<usize, SessionError> {
        let stored = self.inner.store.load_all().await?;
        let now = Utc::now();
        let mut registry = self.inner.registry.lock().await;
        let mut interrupted = Vec::new();

        for mut session in stored {
            if matches!(
                session.status,
                SessionStatus::Initializing
                    | SessionStatus::Active
                    | SessionStatus::Paused
                    | SessionStatus::Stopping
            ) {
                warn!(session = %session.id, status = %session.status, "Session interrupted by restart");
                session.status = SessionStatus::Failed;
                session.ended_at = Some(now);
                session.metrics.actual_duration_minutes = session.duration_minutes(now);
                interrupted.push(session.clone());
            }
            registry.sessions.insert(session.id.clone(), session);
        }

        for session in &interrupted {
            self.persist(session).await;
        }
        let count = registry.sessions.len();
        info!(count, interrupted = interrupted.len(), "📂 Sessions loaded");
        Ok(count)
    }

    /// Start autosave, cleanup and reconciliation. Idempotent.
    pub async fn start_background(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_some() {
            return;
        }
        let mut supervisor = TaskSupervisor::new("sessions");

        let weak = Arc::downgrade(&self.inner);
        supervisor.spawn_periodic(
            "autosave",
            Schedule::every(secs(self.inner.config.autosave_interval_secs)),
            move || {
                let weak = Weak::clone(&weak);
                async move {
                    match weak.upgrade() {
                        Some(inner) => SessionManager { inner }.autosave().await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            },
        );

        let weak = Arc::downgrade(&self.inner);
        supervisor.spawn_periodic(
            "cleanup",
            Schedule::every(secs(self.inner.config.cleanup_interval_secs)),
            move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(inner) = weak.upgrade() {
                        SessionManager { inner }.cleanup_expired(Utc::now()).await;
                    }
                    Ok::<(), SessionError>(())
                }
            },
        );

        let weak = Arc::downgrade(&self.inner);
        supervisor.spawn_periodic(
            "reconcile",
            Schedule::every(self.inner.loop_settings.cycle_interval),
            move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(inner) = weak.upgrade() {
                        SessionManager { inner }.reconcile().await;
                    }
                    Ok::<(), SessionError>(())
                }
            },
        );

        *tasks = Some(supervisor);
        debug!("Session background tasks started");
    }

    /// Stop background tasks and every open session, then save.
    pub async fn shutdown(&self) {
        if let Some(mut tasks) = self.inner.tasks.lock().await.take() {
            tasks.shutdown().await;
        }
        let open: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry
                .sessions
                .values()
                .filter(|s| matches!(s.status, SessionStatus::Active | SessionStatus::Paused))
                .map(|s| s.id.clone())
                .collect()
        };
        for id in open {
            if let Err(e) = self.stop_session(&id).await {
                warn!(session = %id, "Failed to stop session on shutdown: {e}");
            }
        }
        if let Err(e) = self.autosave().await {
            warn!("Final autosave failed: {e}");
        }
        info!("Session manager stopped");
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Create a CREATED session and persist it.
    pub async fn create_session(
        &self,
        mode: SessionMode,
        name: Option<String>,
        description: Option<String>,
        config: serde_json::Value,
    ) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        if registry.open_sessions() >= self.inner.config.max_concurrent_sessions {
            return Err(SessionError::ConcurrencyLimit);
        }

        let session = Session::new(mode, name, description, config);
        self.inner.store.save(&session).await?;
        registry.sessions.insert(session.id.clone(), session.clone());
        registry.stats.total_sessions_created += 1;
        drop(registry);

        info!(session = %session.id, name = %session.name, %mode, "Session created");
        self.emit(SessionEvent::Created(session.clone()));
        Ok(session)
    }

    /// CREATED → INITIALIZING → ACTIVE, starting the control loop for
    /// blockchain sessions. A failed start leaves the session FAILED.
    pub async fn start_session(&self, id: &str) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry.session_mut(id)?;
        let admitted = session.clone();
        session.transition(SessionStatus::Initializing)?;
        session.started_at = Some(Utc::now());
        let snapshot = session.clone();
        self.persist(&snapshot).await;

        let outcome = if snapshot.mode.runs_control_loop() {
            let mut control = ControlLoop::new(
                id,
                self.inner.hardware.clone(),
                Arc::clone(&self.inner.source),
                self.inner.loop_settings,
            );
            match control.start(&admitted).await {
                Ok(()) => {
                    registry.loops.insert(id.to_string(), control);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            debug!(session = %id, mode = %snapshot.mode, "No control loop for this mode");
            Ok(())
        };

        let session = registry.session_mut(id)?;
        match outcome {
            Ok(()) => {
                session.transition(SessionStatus::Active)?;
                let started = session.clone();
                drop(registry);
                self.persist(&started).await;
                info!(session = %id, "▶️ Session started");
                self.emit(SessionEvent::Started(started.clone()));
                Ok(started)
            }
            Err(e) => {
                error!(session = %id, "Session failed to start: {e}");
                let now = Utc::now();
                session.transition(SessionStatus::Failed)?;
                session.ended_at = Some(now);
                session.metrics.actual_duration_minutes = session.duration_minutes(now);
                let failed = session.clone();
                registry.record_finished(&failed);
                drop(registry);
                self.persist(&failed).await;
                self.emit(SessionEvent::Completed(failed));
                Err(e.into())
            }
        }
    }

    /// → STOPPING → COMPLETED, stopping the loop if there is one.
    ///
    /// A session whose loop already halted itself ends FAILED.
    pub async fn stop_session(&self, id: &str) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        registry.session_mut(id)?.transition(SessionStatus::Stopping)?;

        let mut loop_metrics = None;
        let mut halt_reason = None;
        if let Some(mut control) = registry.loops.remove(id) {
            halt_reason = control.halt_reason();
            control.stop().await;
            loop_metrics = Some(control.stats());
        }
        let outcome = match halt_reason {
            Some(_) => SessionStatus::Failed,
            None => SessionStatus::Completed,
        };

        let now = Utc::now();
        let session = registry.session_mut(id)?;
        if let Some(stats) = loop_metrics {
            apply_loop_stats(&mut session.metrics, &stats);
        }
        session.ended_at = Some(now);
        session.metrics.actual_duration_minutes = session.duration_minutes(now);
        session.transition(outcome)?;
        let finished = session.clone();
        registry.record_finished(&finished);
        drop(registry);

        self.persist(&finished).await;
        match halt_reason {
            Some(reason) => warn!(
                session = %id,
                reason = ?reason,
                "Session stopped after its control loop halted, marked failed"
            ),
            None => info!(
                session = %id,
                minutes = finished.metrics.actual_duration_minutes.unwrap_or(0.0),
                "⏹️ Session completed"
            ),
        }
        self.emit(SessionEvent::Completed(finished.clone()));
        Ok(finished)
    }

    /// ACTIVE → PAUSED; the loop is stopped but kept for resume.
    pub async fn pause_session(&self, id: &str) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        registry.session_mut(id)?.transition(SessionStatus::Paused)?;

        let mut loop_metrics = None;
        if let Some(control) = registry.loops.get_mut(id) {
            control.stop().await;
            loop_metrics = Some(control.stats());
        }
        let session = registry.session_mut(id)?;
        if let Some(stats) = loop_metrics {
            apply_loop_stats(&mut session.metrics, &stats);
        }
        let paused = session.clone();
        drop(registry);

        self.persist(&paused).await;
        info!(session = %id, "⏸️ Session paused");
        Ok(paused)
    }

    /// PAUSED → ACTIVE; the loop continues from the epoch it stopped at.
    pub async fn resume_session(&self, id: &str) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry.session_mut(id)?;
        if session.status != SessionStatus::Paused {
            return Err(TransitionError {
                from: session.status,
                to: SessionStatus::Active,
            }
            .into());
        }
        let paused = session.clone();

        if paused.mode.runs_control_loop() {
            let inner = &self.inner;
            let control = registry.loops.entry(id.to_string()).or_insert_with(|| {
                ControlLoop::new(
                    id,
                    inner.hardware.clone(),
                    Arc::clone(&inner.source),
                    inner.loop_settings,
                )
            });
            if let Err(e) = control.resume(&paused).await {
                error!(session = %id, "Session failed to resume: {e}");
                registry.loops.remove(id);
                let now = Utc::now();
                let session = registry.session_mut(id)?;
                session.transition(SessionStatus::Failed)?;
                session.ended_at = Some(now);
                session.metrics.actual_duration_minutes = session.duration_minutes(now);
                let failed = session.clone();
                registry.record_finished(&failed);
                drop(registry);
                self.persist(&failed).await;
                self.emit(SessionEvent::Completed(failed));
                return Err(e.into());
            }
        }

        let session = registry.session_mut(id)?;
        session.transition(SessionStatus::Active)?;
        let resumed = session.clone();
        drop(registry);

        self.persist(&resumed).await;
        info!(session = %id, "▶️ Session resumed");
        Ok(resumed)
    }

    // ─── Participants ───────────────────────────────────────────────

    /// Add a hub client to a session that has not finished.
    pub async fn join_session(
        &self,
        id: &str,
        client_id: &str,
        client_type: &str,
    ) -> Result<Session, SessionError> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry.session_mut(id)?;
        if session.status.is_terminal() {
            return Err(SessionError::Closed {
                id: id.to_string(),
                status: session.status,
            });
        }
        session.participants.insert(client_id.to_string());
        let joined = session.clone();
        drop(registry);

        self.persist(&joined).await;
        debug!(session = %id, client = %client_id, "Client joined session");
        self.emit(SessionEvent::ClientJoined {
            session_id: id.to_string(),
            client_id: client_id.to_string(),
            client_type: client_type.to_string(),
        });
        Ok(joined)
    }

    /// Remove a hub client from a session. Returns whether it was a member.
    pub async fn leave_session(&self, id: &str, client_id: &str) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let Some(session) = registry.sessions.get_mut(id) else {
            return false;
        };
        let removed = session.participants.remove(client_id);
        if removed {
            debug!(session = %id, client = %client_id, "Client left session");
        }
        removed
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.registry.lock().await.sessions.get(id).cloned()
    }

    /// Sessions, newest first. COMPLETED sessions only when asked for.
    pub async fn list_sessions(&self, include_completed: bool) -> Vec<Session> {
        let registry = self.inner.registry.lock().await;
        let mut sessions: Vec<Session> = registry
            .sessions
            .values()
            .filter(|s| include_completed || s.status != SessionStatus::Completed)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// The session that has not finished yet, if any.
    pub async fn active_session(&self) -> Option<Session> {
        let registry = self.inner.registry.lock().await;
        registry
            .sessions
            .values()
            .find(|s| !s.status.is_terminal())
            .cloned()
    }

    /// Status of the running session's control loop.
    pub async fn loop_status(&self) -> Option<LoopStatus> {
        let registry = self.inner.registry.lock().await;
        match registry.loops.values().next() {
            Some(control) => Some(control.status().await),
            None => None,
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.lock().await;
        ManagerStats {
            active_sessions: registry.open_sessions(),
            stored_sessions: registry.sessions.len(),
            max_concurrent_sessions: self.inner.config.max_concurrent_sessions,
            ..registry.stats.clone()
        }
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Persist every open session, with loop counters folded in.
    pub async fn autosave(&self) -> Result<usize, StorageError> {
        let open: Vec<Session> = {
            let mut registry = self.inner.registry.lock().await;
            let Registry {
                sessions, loops, ..
            } = &mut *registry;
            for (id, control) in loops.iter() {
                if let Some(session) = sessions.get_mut(id) {
                    apply_loop_stats(&mut session.metrics, &control.stats());
                }
            }
            sessions
                .values()
                .filter(|s| !s.status.is_terminal())
                .cloned()
                .collect()
        };
        for session in &open {
            self.inner.store.save(session).await?;
        }
        debug!(count = open.len(), "Autosaved sessions");
        Ok(open.len())
    }

    /// Remove COMPLETED sessions that ended before the retention window.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - TimeDelta::hours(self.inner.config.retention_hours);
        let expired: Vec<String> = {
            let mut registry = self.inner.registry.lock().await;
            let expired: Vec<String> = registry
                .sessions
                .values()
                .filter(|s| {
                    s.status == SessionStatus::Completed && s.ended_at.is_some_and(|t| t < cutoff)
                })
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                registry.sessions.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = self.inner.store.remove(id).await {
                warn!(session = %id, "Failed to remove session file: {e}");
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "🧹 Removed expired sessions");
        }
        expired.len()
    }

    /// Fail ACTIVE sessions whose control loop halted on its own.
    pub async fn reconcile(&self) -> usize {
        let mut registry = self.inner.registry.lock().await;
        let halted: Vec<String> = registry
            .loops
            .iter()
            .filter(|(id, control)| {
                !control.is_running()
                    && registry
                        .sessions
                        .get(*id)
                        .is_some_and(|s| s.status == SessionStatus::Active)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut failed = Vec::with_capacity(halted.len());
        for id in &halted {
            let Some(mut control) = registry.loops.remove(id) else {
                continue;
            };
            let reason = control.halt_reason();
            control.stop().await;
            let stats = control.stats();

            let now = Utc::now();
            let Some(session) = registry.sessions.get_mut(id) else {
                continue;
            };
            apply_loop_stats(&mut session.metrics, &stats);
            if session.transition(SessionStatus::Failed).is_err() {
                continue;
            }
            session.ended_at = Some(now);
            session.metrics.actual_duration_minutes = session.duration_minutes(now);
            warn!(
                session = %id,
                reason = ?reason,
                "Control loop halted, session failed"
            );
            let session = session.clone();
            registry.record_finished(&session);
            failed.push(session);
        }
        drop(registry);

        for session in &failed {
            self.persist(session).await;
            self.emit(SessionEvent::Completed(session.clone()));
        }
        failed.len()
    }

    // ─── Helpers ────────────────────────────────────────────────────

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.inner.store.save(session).await {
            warn!(session = %session.id, "Failed to persist session: {e}");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }
}

fn apply_loop_stats(metrics: &mut SessionMetrics, stats: &kinetic_motor::LoopStats) {
    metrics.epochs_completed = stats.epoch;
    metrics.commands_executed = stats.successful_cycles;
    metrics.errors_encountered = stats.failed_cycles;
}
