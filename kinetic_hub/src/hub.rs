//! # Client Hub
//!
//! Registry of connected WebSocket clients, request routing and fan-out of
//! hardware and session events.
//!
//! # Design
//!
//! ```text
//!   connection task ──text──► handle_text ──► SessionManager
//!        ▲                         │      └─► HardwareCoordinator
//!        │ mpsc<Outbound>          ▼
//!   ┌────┴─────────────────────────────┐
//!   │ Registry (parking_lot::Mutex)    │◄── session-events pump
//!   │  clients, session membership     │◄── hardware-events pump
//!   └──────────────────────────────────┘
//! ```
//!
//! - Each client owns an unbounded outbound queue drained by its connection
//!   task; delivering a message never awaits the socket.
//! - The registry lock is synchronous and never held across `.await`.
//! - A failed delivery means the connection is gone: the client is removed,
//!   leaves its session and `ClientDisconnected` is emitted.
//! - Emergency stops, motor updates and alerts come from the coordinator's
//!   event stream, so they reach every client whatever triggered them.

use crate::auth::{Access, Authenticator, DEFAULT_CLIENT_TYPE};
use crate::error::HubError;
use crate::protocol::{ClientMessage, ManualCommand, ServerMessage};
use crate::recorder::Recorder;
use crate::session::{SessionEvent, SessionManager};
use crate::state::{StateStore, SystemMode};
use chrono::{DateTime, Utc};
use kinetic_common::motor::{CommandSet, MotorCommand, MotorDirection, MotorName};
use kinetic_common::session::SessionMode;
use kinetic_common::wire::unix_timestamp;
use kinetic_motor::control_loop::{LoopHealth, LoopStatus};
use kinetic_motor::{HardwareCoordinator, HardwareEvent, HardwareStatus, StopReason, TaskSupervisor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 128;

/// Frame queued for a client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    /// Close the connection.
    Close,
}

/// Hub-level notifications.
#[derive(Debug, Clone)]
pub enum HubEvent {
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    MotorCommand(ManualCommand),
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub total_connections: u64,
    pub total_sessions: u64,
    pub total_motor_commands: u64,
    pub peak_concurrent_clients: usize,
    pub connected_clients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health summary in `system_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubHealth {
    pub status: ServiceStatus,
    pub uptime_seconds: f64,
    pub connected_clients: usize,
    pub active_sessions: usize,
    pub hardware_connected: bool,
}

/// Read-only view of a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub client_type: String,
    pub authenticated: bool,
    pub session: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct ConnectedClient {
    info: ClientInfo,
    access: Access,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, ConnectedClient>,
    members: HashMap<String, HashSet<String>>,
    stats: HubStats,
}

impl Registry {
    fn prune(&mut self, session_id: &str, client_id: &str) {
        if let Some(members) = self.members.get_mut(session_id) {
            members.remove(client_id);
            if members.is_empty() {
                self.members.remove(session_id);
            }
        }
    }

    /// Move a client into `session_id`; returns the session it was in.
    fn join(&mut self, client_id: &str, session_id: &str) -> Option<String> {
        let client = self.clients.get_mut(client_id)?;
        let previous = client.info.session.replace(session_id.to_string());
        if let Some(previous) = previous.as_deref().filter(|p| *p != session_id) {
            self.prune(previous, client_id);
        }
        self.members
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        previous
    }

    fn remove(&mut self, client_id: &str) -> Option<ConnectedClient> {
        let client = self.clients.remove(client_id)?;
        if let Some(session_id) = &client.info.session {
            self.prune(session_id, client_id);
        }
        Some(client)
    }

    /// Drop the membership of a finished session.
    fn close_session(&mut self, session_id: &str) {
        for client_id in self.members.remove(session_id).unwrap_or_default() {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.info.session = None;
            }
        }
    }

    fn is_member(&self, session_id: &str, client_id: &str) -> bool {
        self.members
            .get(session_id)
            .is_some_and(|m| m.contains(client_id))
    }
}

enum Target<'a> {
    One(&'a str),
    Session {
        id: &'a str,
        exclude: Option<&'a str>,
    },
    All,
}

struct Inner {
    registry: Mutex<Registry>,
    sessions: SessionManager,
    hardware: HardwareCoordinator,
    state: StateStore,
    recorder: Recorder,
    auth: Authenticator,
    events: broadcast::Sender<HubEvent>,
    started: Instant,
    tasks: AsyncMutex<Option<TaskSupervisor>>,
}

/// Cloneable handle to the hub.
#[derive(Clone)]
pub struct ClientHub {
    inner: Arc<Inner>,
}

impl ClientHub {
    /// Build a hub around the session manager and its hardware coordinator.
    pub fn new(
        sessions: SessionManager,
        state: StateStore,
        recorder: Recorder,
        auth: Authenticator,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                hardware: sessions.hardware().clone(),
                sessions,
                state,
                recorder,
                auth,
                events,
                started: Instant::now(),
                tasks: AsyncMutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn hardware(&self) -> &HardwareCoordinator {
        &self.inner.hardware
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start forwarding session and hardware events to clients. Idempotent.
    pub async fn start(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_some() {
            return;
        }
        let mut supervisor = TaskSupervisor::new("hub");

        let weak = Arc::downgrade(&self.inner);
        let mut session_events = self.inner.sessions.subscribe();
        supervisor.spawn("session-events", move |mut signal| async move {
            loop {
                let received = tokio::select! {
                    received = session_events.recv() => received,
                    _ = signal.cancelled() => break,
                };
                match received {
                    Ok(event) => match Weak::upgrade(&weak) {
                        Some(inner) => ClientHub { inner }.on_session_event(event).await,
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session event forwarding lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let mut hardware_events = self.inner.hardware.subscribe();
        supervisor.spawn("hardware-events", move |mut signal| async move {
            loop {
                let received = tokio::select! {
                    received = hardware_events.recv() => received,
                    _ = signal.cancelled() => break,
                };
                match received {
                    Ok(event) => match Weak::upgrade(&weak) {
                        Some(inner) => ClientHub { inner }.on_hardware_event(event).await,
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Hardware event forwarding lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        *tasks = Some(supervisor);
        info!("📡 Client hub started");
    }

    /// Stop event forwarding, close every connection and flush state.
    pub async fn shutdown(&self) {
        if let Some(mut tasks) = self.inner.tasks.lock().await.take() {
            tasks.shutdown().await;
        }
        let outbound: Vec<_> = self
            .inner
            .registry
            .lock()
            .clients
            .values()
            .map(|c| c.outbound.clone())
            .collect();
        for tx in outbound {
            // The connection may already be gone.
            let _ = tx.send(Outbound::Close);
        }
        if self.inner.recorder.is_active() {
            if let Err(e) = self.inner.recorder.stop().await {
                warn!("Failed to save recording on shutdown: {e}");
            }
        }
        if let Err(e) = self.inner.state.persist().await {
            warn!("Failed to write state snapshot: {e}");
        }
        info!("Client hub stopped");
    }

    // ─── Connections ────────────────────────────────────────────────

    /// Register a connection and send it the current system state.
    pub async fn connect(&self, outbound: mpsc::UnboundedSender<Outbound>) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let mut registry = self.inner.registry.lock();
            registry.clients.insert(
                id.clone(),
                ConnectedClient {
                    info: ClientInfo {
                        id: id.clone(),
                        client_type: "unknown".to_string(),
                        authenticated: false,
                        session: None,
                        connected_at: now,
                        last_activity: now,
                    },
                    access: self.inner.auth.initial_access(),
                    outbound,
                },
            );
            let connected = registry.clients.len();
            registry.stats.total_connections += 1;
            registry.stats.peak_concurrent_clients =
                registry.stats.peak_concurrent_clients.max(connected);
        }
        info!(client = %id, "🔌 Client connected");
        self.emit(HubEvent::ClientConnected {
            client_id: id.clone(),
        });

        let state = self.system_state().await;
        self.send_to(&id, &state).await;
        id
    }

    /// Remove a client, leave its session and notify listeners.
    pub async fn disconnect(&self, client_id: &str) {
        let removed = self.inner.registry.lock().remove(client_id);
        let Some(client) = removed else {
            return;
        };
        if let Some(session_id) = &client.info.session {
            self.inner.sessions.leave_session(session_id, client_id).await;
        }
        // The connection may already be gone.
        let _ = client.outbound.send(Outbound::Close);
        info!(client = %client_id, "Client disconnected");
        self.emit(HubEvent::ClientDisconnected {
            client_id: client_id.to_string(),
        });
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.lock().clients.len()
    }

    pub fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner
            .registry
            .lock()
            .clients
            .get(client_id)
            .map(|c| c.info.clone())
    }

    /// Clients in a session, sorted.
    pub fn session_members(&self, session_id: &str) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut members: Vec<String> = registry
            .members
            .get(session_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.inner.registry.lock();
        HubStats {
            connected_clients: registry.clients.len(),
            ..registry.stats.clone()
        }
    }

    // ─── Delivery ───────────────────────────────────────────────────

    pub async fn send_to(&self, client_id: &str, message: &ServerMessage) {
        self.deliver(Target::One(client_id), message).await;
    }

    pub async fn broadcast_to_session(
        &self,
        session_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) {
        self.deliver(
            Target::Session {
                id: session_id,
                exclude,
            },
            message,
        )
        .await;
    }

    pub async fn broadcast_all(&self, message: &ServerMessage) {
        self.deliver(Target::All, message).await;
    }

    async fn deliver(&self, target: Target<'_>, message: &ServerMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode outgoing message: {e}");
                return;
            }
        };

        let failed: Vec<String> = {
            let registry = self.inner.registry.lock();
            let recipients: Vec<&ConnectedClient> = match target {
                Target::One(id) => registry.clients.get(id).into_iter().collect(),
                Target::Session { id, exclude } => registry
                    .members
                    .get(id)
                    .into_iter()
                    .flatten()
                    .filter(|member| Some(member.as_str()) != exclude)
                    .filter_map(|member| registry.clients.get(member))
                    .collect(),
                Target::All => registry.clients.values().collect(),
            };
            recipients
                .into_iter()
                .filter(|c| c.outbound.send(Outbound::Text(text.clone())).is_err())
                .map(|c| c.info.id.clone())
                .collect()
        };

        for client_id in failed {
            warn!(client = %client_id, "Delivery failed, dropping client");
            self.disconnect(&client_id).await;
        }
    }

    /// Send to the members of a session, and to `requester` if it is not one.
    async fn notify_session(&self, session_id: &str, requester: &str, message: &ServerMessage) {
        let member = self.inner.registry.lock().is_member(session_id, requester);
        self.broadcast_to_session(session_id, message, None).await;
        if !member {
            self.send_to(requester, message).await;
        }
    }

    fn emit(&self, event: HubEvent) {
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }

    // ─── Requests ───────────────────────────────────────────────────

    /// Handle one text frame from `client_id`. Failures are answered with
    /// an `error` message.
    pub async fn handle_text(&self, client_id: &str, text: &str) {
        if let Some(client) = self.inner.registry.lock().clients.get_mut(client_id) {
            client.info.last_activity = Utc::now();
        }
        let outcome = match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(client_id, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            debug!(client = %client_id, "Request failed: {e}");
            self.send_to(client_id, &ServerMessage::error(e.to_string()))
                .await;
        }
    }

    async fn dispatch(&self, client_id: &str, message: ClientMessage) -> Result<(), HubError> {
        let access = self
            .inner
            .registry
            .lock()
            .clients
            .get(client_id)
            .map(|c| c.access)
            .ok_or(HubError::UnknownClient)?;
        if !access.contains(message.required_access()) {
            warn!(client = %client_id, kind = message.kind(), "Request denied");
            return Err(HubError::AccessDenied(message.kind()));
        }
        debug!(client = %client_id, kind = message.kind(), "Request");

        match message {
            ClientMessage::Authenticate {
                client_type,
                api_key,
            } => self.authenticate(client_id, client_type, api_key).await,
            ClientMessage::CreateSession {
                session_type,
                name,
                description,
                config,
            } => {
                self.create_session(client_id, session_type, name, description, config)
                    .await
            }
            ClientMessage::StartSession { session_id } => {
                self.start_session(client_id, session_id).await
            }
            ClientMessage::StopSession { session_id } => {
                self.stop_session(client_id, session_id).await
            }
            ClientMessage::PauseSession { session_id } => {
                self.pause_session(client_id, session_id).await
            }
            ClientMessage::ResumeSession { session_id } => {
                self.resume_session(client_id, session_id).await
            }
            ClientMessage::JoinSession { session_id } => {
                self.join_session(client_id, session_id).await
            }
            ClientMessage::MotorCommand {
                motor_name,
                velocity_rpm,
                direction,
            } => {
                self.motor_command(client_id, &motor_name, velocity_rpm, direction)
                    .await
            }
            ClientMessage::GetSystemStatus {} => self.system_status(client_id).await,
            ClientMessage::GetSessions { include_completed } => {
                let sessions = self.inner.sessions.list_sessions(include_completed).await;
                self.send_to(
                    client_id,
                    &ServerMessage::SessionsList {
                        sessions,
                        timestamp: unix_timestamp(),
                    },
                )
                .await;
                Ok(())
            }
            ClientMessage::SubscribeEvents {} => {
                self.send_to(
                    client_id,
                    &ServerMessage::EventsSubscribed {
                        events: vec!["all".to_string()],
                        timestamp: unix_timestamp(),
                    },
                )
                .await;
                Ok(())
            }
            ClientMessage::ModeChange { mode } => self.mode_change(client_id, mode).await,
            ClientMessage::EmergencyStop {} => {
                warn!(client = %client_id, "🛑 Emergency stop requested");
                self.inner
                    .hardware
                    .emergency_stop(StopReason::ClientRequest, Some(client_id))
                    .await
                    .map_err(HubError::EmergencyStopUnconfirmed)
            }
            ClientMessage::ResetEmergencyStop {} => {
                match self.inner.hardware.reset_emergency_stop().await {
                    Ok(true) => {
                        info!(client = %client_id, "Emergency stop released");
                        Ok(())
                    }
                    Ok(false) => Err(HubError::NotLatched),
                    Err(violation) => Err(HubError::ResetRefused(violation)),
                }
            }
            ClientMessage::ResolveAlert { index } => {
                if !self.inner.hardware.resolve_alert(index).await {
                    return Err(HubError::AlertNotFound(index));
                }
                self.broadcast_all(&ServerMessage::AlertResolved {
                    index,
                    resolved_by: client_id.to_string(),
                    timestamp: unix_timestamp(),
                })
                .await;
                Ok(())
            }
            ClientMessage::StartRecording { session_name } => {
                let session_name = session_name
                    .unwrap_or_else(|| format!("session_{}", Utc::now().timestamp()));
                self.inner.recorder.start(&session_name)?;
                self.send_to(
                    client_id,
                    &ServerMessage::RecordingStarted {
                        session_name,
                        timestamp: unix_timestamp(),
                    },
                )
                .await;
                Ok(())
            }
            ClientMessage::StopRecording {} => {
                let summary = self.inner.recorder.stop().await?;
                self.send_to(
                    client_id,
                    &ServerMessage::RecordingStopped {
                        session_name: summary.session_name,
                        commands: summary.commands,
                        path: summary.path.display().to_string(),
                        timestamp: unix_timestamp(),
                    },
                )
                .await;
                Ok(())
            }
            ClientMessage::GetLastMotorStates {} => {
                let snapshots = self.inner.state.motor_snapshots();
                for (motor, snapshot) in snapshots.iter() {
                    self.send_to(client_id, &ServerMessage::motor_update(motor, *snapshot))
                        .await;
                }
                Ok(())
            }
            ClientMessage::Ping {} => {
                self.send_to(client_id, &ServerMessage::pong()).await;
                Ok(())
            }
        }
    }

    async fn authenticate(
        &self,
        client_id: &str,
        client_type: Option<String>,
        api_key: Option<String>,
    ) -> Result<(), HubError> {
        let auth = &self.inner.auth;
        let outcome = auth.authenticate(client_type.as_deref(), api_key.as_deref());
        let Some(access) = auth.access_for(outcome) else {
            warn!(client = %client_id, "Authentication failed");
            self.send_to(
                client_id,
                &ServerMessage::AuthenticationFailed {
                    client_id: client_id.to_string(),
                    message: outcome.message(),
                },
            )
            .await;
            return Ok(());
        };

        let client_type = client_type.unwrap_or_else(|| DEFAULT_CLIENT_TYPE.to_string());
        {
            let mut registry = self.inner.registry.lock();
            let client = registry
                .clients
                .get_mut(client_id)
                .ok_or(HubError::UnknownClient)?;
            client.info.client_type = client_type.clone();
            client.info.authenticated = outcome.api_access();
            client.access = access;
        }
        info!(
            client = %client_id,
            client_type = %client_type,
            full = outcome.api_access(),
            "Client authenticated"
        );

        self.send_to(
            client_id,
            &ServerMessage::Authenticated {
                client_id: client_id.to_string(),
                server_time: unix_timestamp(),
                api_access: outcome.api_access(),
                message: outcome.message(),
            },
        )
        .await;
        let state = self.system_state().await;
        self.send_to(client_id, &state).await;
        Ok(())
    }

    async fn create_session(
        &self,
        client_id: &str,
        mode: SessionMode,
        name: Option<String>,
        description: Option<String>,
        config: serde_json::Value,
    ) -> Result<(), HubError> {
        let session = self
            .inner
            .sessions
            .create_session(mode, name, description, config)
            .await
            .map_err(HubError::CreateSession)?;
        self.inner.registry.lock().stats.total_sessions += 1;
        self.send_to(
            client_id,
            &ServerMessage::SessionCreated {
                session_id: session.id.clone(),
                session,
                timestamp: unix_timestamp(),
            },
        )
        .await;
        Ok(())
    }

    async fn start_session(
        &self,
        client_id: &str,
        session_id: Option<String>,
    ) -> Result<(), HubError> {
        let session_id = session_id.ok_or(HubError::Missing("session_id"))?;
        self.inner
            .sessions
            .start_session(&session_id)
            .await
            .map_err(HubError::StartSession)?;
        self.send_to(
            client_id,
            &ServerMessage::SessionStarted {
                session_id,
                started_by: Some(client_id.to_string()),
                timestamp: unix_timestamp(),
            },
        )
        .await;
        Ok(())
    }

    async fn stop_session(
        &self,
        client_id: &str,
        session_id: Option<String>,
    ) -> Result<(), HubError> {
        let session_id = session_id.ok_or(HubError::Missing("session_id"))?;
        let session = self
            .inner
            .sessions
            .stop_session(&session_id)
            .await
            .map_err(HubError::StopSession)?;
        let message = ServerMessage::SessionStopped {
            session_id: session_id.clone(),
            status: session.status,
            stopped_by: client_id.to_string(),
            timestamp: unix_timestamp(),
        };
        self.notify_session(&session_id, client_id, &message).await;
        self.inner.registry.lock().close_session(&session_id);
        Ok(())
    }

    async fn pause_session(
        &self,
        client_id: &str,
        session_id: Option<String>,
    ) -> Result<(), HubError> {
        let session_id = session_id.ok_or(HubError::Missing("session_id"))?;
        self.inner
            .sessions
            .pause_session(&session_id)
            .await
            .map_err(HubError::PauseSession)?;
        let message = ServerMessage::SessionPaused {
            session_id: session_id.clone(),
            paused_by: client_id.to_string(),
            timestamp: unix_timestamp(),
        };
        self.notify_session(&session_id, client_id, &message).await;
        Ok(())
    }

    async fn resume_session(
        &self,
        client_id: &str,
        session_id: Option<String>,
    ) -> Result<(), HubError> {
        let session_id = session_id.ok_or(HubError::Missing("session_id"))?;
        self.inner
            .sessions
            .resume_session(&session_id)
            .await
            .map_err(HubError::ResumeSession)?;
        let message = ServerMessage::SessionResumed {
            session_id: session_id.clone(),
            resumed_by: client_id.to_string(),
            timestamp: unix_timestamp(),
        };
        self.notify_session(&session_id, client_id, &message).await;
        Ok(())
    }

    async fn join_session(
        &self,
        client_id: &str,
        session_id: Option<String>,
    ) -> Result<(), HubError> {
        let session_id = session_id.ok_or(HubError::Missing("session_id"))?;
        let client_type = self
            .client_info(client_id)
            .map(|c| c.client_type)
            .ok_or(HubError::UnknownClient)?;

        if let Err(e) = self
            .inner
            .sessions
            .join_session(&session_id, client_id, &client_type)
            .await
        {
            warn!(client = %client_id, session = %session_id, "Join refused: {e}");
            return Err(HubError::JoinSession(e));
        }

        let previous = self.inner.registry.lock().join(client_id, &session_id);
        if let Some(previous) = previous.filter(|p| *p != session_id) {
            self.inner.sessions.leave_session(&previous, client_id).await;
        }
        self.send_to(
            client_id,
            &ServerMessage::SessionJoined {
                session_id,
                timestamp: unix_timestamp(),
            },
        )
        .await;
        Ok(())
    }

    async fn motor_command(
        &self,
        client_id: &str,
        motor_name: &str,
        velocity_rpm: f64,
        direction: Option<MotorDirection>,
    ) -> Result<(), HubError> {
        let motor = MotorName::from_key(motor_name)
            .ok_or_else(|| HubError::UnknownMotor(motor_name.to_string()))?;
        let command = match direction {
            Some(direction) => MotorCommand::new(velocity_rpm, direction)?,
            None => MotorCommand::from_velocity(velocity_rpm)?,
        };

        self.inner
            .hardware
            .execute_manual(motor, command, Some(client_id))
            .await?;

        let session_id = {
            let mut registry = self.inner.registry.lock();
            registry.stats.total_motor_commands += 1;
            registry
                .clients
                .get(client_id)
                .and_then(|c| c.info.session.clone())
        };
        self.inner.recorder.record(motor, &command, client_id);

        let record = ManualCommand {
            timestamp: unix_timestamp(),
            client_id: client_id.to_string(),
            session_id,
            motor_name: motor,
            velocity_rpm: command.velocity_rpm(),
            direction: command.direction(),
            source: "manual",
        };
        self.send_to(
            client_id,
            &ServerMessage::MotorCommandExecuted {
                command: record.clone(),
                timestamp: unix_timestamp(),
            },
        )
        .await;
        self.emit(HubEvent::MotorCommand(record));
        Ok(())
    }

    async fn mode_change(&self, client_id: &str, mode: Option<String>) -> Result<(), HubError> {
        let requested = mode.ok_or(HubError::Missing("mode parameter"))?;
        let mode: SystemMode = requested.parse().map_err(HubError::InvalidMode)?;

        let previous = self.inner.state.mode();
        if previous == SystemMode::Auto && mode == SystemMode::Manual {
            self.carry_over_motor_states().await;
        }
        self.inner.state.set_mode(mode);
        if let Err(e) = self.inner.state.persist().await {
            warn!("Failed to write state snapshot: {e}");
        }
        info!(client = %client_id, from = %previous, to = %mode, "🔀 Mode changed");

        self.broadcast_all(&ServerMessage::ModeChanged {
            new_mode: mode,
            changed_by: client_id.to_string(),
            timestamp: unix_timestamp(),
        })
        .await;
        Ok(())
    }

    /// Re-send the last known targets on the manual path so the motors do
    /// not jump when the loop hands over.
    async fn carry_over_motor_states(&self) {
        let hardware = &self.inner.hardware;
        let commands = self
            .inner
            .state
            .motor_snapshots()
            .map(|_, snapshot| snapshot.to_command().unwrap_or(MotorCommand::STOP));
        let set = CommandSet::new(0, commands).with_limits(hardware.limits());

        if !hardware.is_connected().await && !hardware.initialize().await {
            warn!("Hardware unavailable, motor states not carried into manual mode");
            return;
        }
        match hardware.execute_command_set(&set, None).await {
            Ok(()) => info!("Last motor states carried into manual mode"),
            Err(e) => warn!("Failed to carry motor states into manual mode: {e}"),
        }
    }

    async fn system_status(&self, client_id: &str) -> Result<(), HubError> {
        let hardware = self.inner.hardware.system_status().await;
        let control_loop = self.inner.sessions.loop_status().await;
        let session_manager_stats = self.inner.sessions.stats().await;
        let stats = self.stats();
        let health = HubHealth {
            status: service_status(&hardware, control_loop.as_ref()),
            uptime_seconds: self.inner.started.elapsed().as_secs_f64(),
            connected_clients: stats.connected_clients,
            active_sessions: session_manager_stats.active_sessions,
            hardware_connected: hardware.connection_status
                == kinetic_motor::ConnectionStatus::Connected,
        };
        self.send_to(
            client_id,
            &ServerMessage::SystemStatus {
                health,
                stats,
                session_manager_stats,
                hardware: Box::new(hardware),
                control_loop: control_loop.map(Box::new),
                timestamp: unix_timestamp(),
            },
        )
        .await;
        Ok(())
    }

    async fn system_state(&self) -> ServerMessage {
        let emergency_stopped = self.inner.hardware.is_emergency_stop_active().await;
        let active_sessions = self.inner.sessions.stats().await.active_sessions;
        ServerMessage::SystemState {
            mode: self.inner.state.mode(),
            emergency_stopped,
            motor_states: self.inner.state.motor_snapshots(),
            safety_limits: self.inner.hardware.limits(),
            recording_active: self.inner.recorder.is_active(),
            active_sessions,
            connected_clients: self.client_count(),
            server_time: unix_timestamp(),
        }
    }

    // ─── Event forwarding ───────────────────────────────────────────

    async fn on_session_event(&self, event: SessionEvent) {
        let timestamp = unix_timestamp();
        match event {
            SessionEvent::Created(session) => {
                self.broadcast_all(&ServerMessage::SessionCreated {
                    session_id: session.id.clone(),
                    session,
                    timestamp,
                })
                .await
            }
            SessionEvent::Started(session) => {
                self.broadcast_all(&ServerMessage::SessionStarted {
                    session_id: session.id,
                    started_by: None,
                    timestamp,
                })
                .await
            }
            SessionEvent::Completed(session) => {
                self.broadcast_all(&ServerMessage::SessionCompleted {
                    session_id: session.id.clone(),
                    status: session.status,
                    stats: session.metrics,
                    timestamp,
                })
                .await;
                self.inner.registry.lock().close_session(&session.id);
            }
            SessionEvent::ClientJoined {
                session_id,
                client_id,
                client_type,
            } => {
                let message = ServerMessage::ClientJoined {
                    session_id: session_id.clone(),
                    client_id: client_id.clone(),
                    client_type,
                    timestamp,
                };
                self.broadcast_to_session(&session_id, &message, Some(&client_id))
                    .await
            }
        }
    }

    async fn on_hardware_event(&self, event: HardwareEvent) {
        let timestamp = unix_timestamp();
        match event {
            HardwareEvent::MotorStates(states) => {
                let changed = self.inner.state.record_motor_states(&states);
                if changed.is_empty() {
                    return;
                }
                if let Err(e) = self.inner.state.persist().await {
                    warn!("Failed to write state snapshot: {e}");
                }
                for (motor, snapshot) in changed {
                    self.broadcast_all(&ServerMessage::motor_update(motor, snapshot))
                        .await;
                }
            }
            HardwareEvent::Alert(alert) => {
                self.broadcast_all(&ServerMessage::SafetyAlert { alert, timestamp })
                    .await
            }
            HardwareEvent::EmergencyStop {
                reason,
                initiated_by,
            } => {
                self.broadcast_all(&ServerMessage::EmergencyStop {
                    initiated_by,
                    reason,
                    timestamp,
                })
                .await
            }
            HardwareEvent::EmergencyReset => {
                self.broadcast_all(&ServerMessage::EmergencyStopReset { timestamp })
                    .await
            }
        }
    }
}

fn service_status(hardware: &HardwareStatus, control_loop: Option<&LoopStatus>) -> ServiceStatus {
    if hardware.emergency_stop_active {
        ServiceStatus::Unhealthy
    } else if control_loop.is_some_and(|l| l.running && l.health != LoopHealth::Healthy) {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    }
}
