//! # Client Hub Protocol
//!
//! JSON text frames, one object per frame, routed by a `type` field.
//!
//! Client requests decode into [`ClientMessage`]; everything the hub sends is
//! a [`ServerMessage`]. Field names follow the browser client, so motors are
//! addressed as `motor_canvas`, `motor_pb`, `motor_pcd` and `motor_pe`
//! (the short device keys are accepted too).

use crate::auth::Access;
use crate::error::HubError;
use crate::hub::{HubHealth, HubStats};
use crate::session::ManagerStats;
use crate::state::SystemMode;
use kinetic_common::motor::{MotorDirection, MotorMap, MotorName, MotorSnapshot, SafetyLimits};
use kinetic_common::safety::SafetyAlert;
use kinetic_common::session::{Session, SessionMetrics, SessionMode, SessionStatus};
use kinetic_common::wire::unix_timestamp;
use kinetic_motor::control_loop::LoopStatus;
use kinetic_motor::{HardwareStatus, StopReason};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Client → hub ───────────────────────────────────────────────────

/// Every request type the hub understands.
pub const CLIENT_MESSAGE_TYPES: [&str; 19] = [
    "authenticate",
    "create_session",
    "start_session",
    "stop_session",
    "pause_session",
    "resume_session",
    "join_session",
    "motor_command",
    "get_system_status",
    "get_sessions",
    "subscribe_events",
    "mode_change",
    "emergency_stop",
    "reset_emergency_stop",
    "resolve_alert",
    "start_recording",
    "stop_recording",
    "get_last_motor_states",
    "ping",
];

/// Request from a hub client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        client_type: Option<String>,
        api_key: Option<String>,
    },
    CreateSession {
        #[serde(default)]
        session_type: SessionMode,
        name: Option<String>,
        description: Option<String>,
        #[serde(default)]
        config: Value,
    },
    StartSession {
        session_id: Option<String>,
    },
    StopSession {
        session_id: Option<String>,
    },
    PauseSession {
        session_id: Option<String>,
    },
    ResumeSession {
        session_id: Option<String>,
    },
    JoinSession {
        session_id: Option<String>,
    },
    MotorCommand {
        motor_name: String,
        velocity_rpm: f64,
        /// Derived from the sign of the velocity when absent.
        direction: Option<MotorDirection>,
    },
    GetSystemStatus {},
    GetSessions {
        #[serde(default)]
        include_completed: bool,
    },
    SubscribeEvents {},
    ModeChange {
        mode: Option<String>,
    },
    EmergencyStop {},
    ResetEmergencyStop {},
    ResolveAlert {
        index: usize,
    },
    StartRecording {
        session_name: Option<String>,
    },
    StopRecording {},
    GetLastMotorStates {},
    Ping {},
}

impl ClientMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| HubError::InvalidJson(e.to_string()))?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "None".to_string(),
        };
        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(HubError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| HubError::Malformed {
            kind,
            message: e.to_string(),
        })
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::CreateSession { .. } => "create_session",
            Self::StartSession { .. } => "start_session",
            Self::StopSession { .. } => "stop_session",
            Self::PauseSession { .. } => "pause_session",
            Self::ResumeSession { .. } => "resume_session",
            Self::JoinSession { .. } => "join_session",
            Self::MotorCommand { .. } => "motor_command",
            Self::GetSystemStatus {} => "get_system_status",
            Self::GetSessions { .. } => "get_sessions",
            Self::SubscribeEvents {} => "subscribe_events",
            Self::ModeChange { .. } => "mode_change",
            Self::EmergencyStop {} => "emergency_stop",
            Self::ResetEmergencyStop {} => "reset_emergency_stop",
            Self::ResolveAlert { .. } => "resolve_alert",
            Self::StartRecording { .. } => "start_recording",
            Self::StopRecording {} => "stop_recording",
            Self::GetLastMotorStates {} => "get_last_motor_states",
            Self::Ping {} => "ping",
        }
    }

    /// Permission a client needs to send this message.
    pub fn required_access(&self) -> Access {
        match self {
            Self::Authenticate { .. }
            | Self::JoinSession { .. }
            | Self::GetSystemStatus {}
            | Self::GetSessions { .. }
            | Self::SubscribeEvents {}
            | Self::GetLastMotorStates {}
            | Self::Ping {} => Access::OBSERVE,
            Self::MotorCommand { .. }
            | Self::ModeChange { .. }
            | Self::StartRecording { .. }
            | Self::StopRecording {} => Access::MOTORS,
            Self::EmergencyStop {} => Access::EMERGENCY_STOP,
            Self::CreateSession { .. }
            | Self::StartSession { .. }
            | Self::StopSession { .. }
            | Self::PauseSession { .. }
            | Self::ResumeSession { .. } => Access::SESSIONS,
            Self::ResetEmergencyStop {} | Self::ResolveAlert { .. } => Access::SAFETY,
        }
    }
}

// ─── Hub → client ───────────────────────────────────────────────────

/// Manual command as acknowledged to its sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualCommand {
    pub timestamp: f64,
    pub client_id: String,
    pub session_id: Option<String>,
    pub motor_name: MotorName,
    pub velocity_rpm: f64,
    pub direction: MotorDirection,
    pub source: &'static str,
}

/// Message sent by the hub.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        client_id: String,
        server_time: f64,
        api_access: bool,
        message: String,
    },
    AuthenticationFailed {
        client_id: String,
        message: String,
    },
    SystemState {
        mode: SystemMode,
        emergency_stopped: bool,
        motor_states: MotorMap<MotorSnapshot>,
        safety_limits: SafetyLimits,
        recording_active: bool,
        active_sessions: usize,
        connected_clients: usize,
        server_time: f64,
    },
    SessionCreated {
        session_id: String,
        session: Session,
        timestamp: f64,
    },
    SessionStarted {
        session_id: String,
        started_by: Option<String>,
        timestamp: f64,
    },
    SessionStopped {
        session_id: String,
        status: SessionStatus,
        stopped_by: String,
        timestamp: f64,
    },
    SessionPaused {
        session_id: String,
        paused_by: String,
        timestamp: f64,
    },
    SessionResumed {
        session_id: String,
        resumed_by: String,
        timestamp: f64,
    },
    SessionCompleted {
        session_id: String,
        status: SessionStatus,
        stats: SessionMetrics,
        timestamp: f64,
    },
    SessionJoined {
        session_id: String,
        timestamp: f64,
    },
    ClientJoined {
        session_id: String,
        client_id: String,
        client_type: String,
        timestamp: f64,
    },
    MotorCommandExecuted {
        command: ManualCommand,
        timestamp: f64,
    },
    MotorUpdate {
        motor_name: MotorName,
        state: MotorSnapshot,
        timestamp: f64,
    },
    SafetyAlert {
        alert: SafetyAlert,
        timestamp: f64,
    },
    SystemStatus {
        health: HubHealth,
        stats: HubStats,
        session_manager_stats: ManagerStats,
        hardware: Box<HardwareStatus>,
        control_loop: Option<Box<LoopStatus>>,
        timestamp: f64,
    },
    SessionsList {
        sessions: Vec<Session>,
        timestamp: f64,
    },
    EventsSubscribed {
        events: Vec<String>,
        timestamp: f64,
    },
    ModeChanged {
        new_mode: SystemMode,
        changed_by: String,
        timestamp: f64,
    },
    EmergencyStop {
        initiated_by: Option<String>,
        reason: StopReason,
        timestamp: f64,
    },
    EmergencyStopReset {
        timestamp: f64,
    },
    AlertResolved {
        index: usize,
        resolved_by: String,
        timestamp: f64,
    },
    RecordingStarted {
        session_name: String,
        timestamp: f64,
    },
    RecordingStopped {
        session_name: String,
        commands: usize,
        path: String,
        timestamp: f64,
    },
    Error {
        message: String,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: unix_timestamp(),
        }
    }

    pub fn motor_update(motor: MotorName, state: MotorSnapshot) -> Self {
        Self::MotorUpdate {
            motor_name: motor,
            state,
            timestamp: unix_timestamp(),
        }
    }

    /// JSON text of this message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_requests_with_defaults() {
        let msg = ClientMessage::decode(r#"{"type": "create_session", "name": "night"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CreateSession {
                session_type: SessionMode::Manual,
                name: Some("night".into()),
                description: None,
                config: Value::Null,
            }
        );

        let msg = ClientMessage::decode(r#"{"type": "ping", "timestamp": 1.5}"#).unwrap();
        assert_eq!(msg.kind(), "ping");

        let msg = ClientMessage::decode(r#"{"type": "start_session"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartSession { session_id: None });
    }

    #[test]
    fn motor_command_direction_is_optional() {
        let msg = ClientMessage::decode(
            r#"{"type": "motor_command", "motor_name": "motor_pb", "velocity_rpm": -12.5}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::MotorCommand {
                motor_name: "motor_pb".into(),
                velocity_rpm: -12.5,
                direction: None,
            }
        );
        assert_eq!(msg.required_access(), Access::MOTORS);
    }

    #[test]
    fn decode_errors_name_the_problem() {
        let err = ClientMessage::decode("{oops").unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON: "));

        let err = ClientMessage::decode(r#"{"type": "dance"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: dance");

        let err = ClientMessage::decode(r#"{"type": "resolve_alert"}"#).unwrap_err();
        assert!(matches!(err, HubError::Malformed { ref kind, .. } if kind == "resolve_alert"));
    }

    #[test]
    fn known_types_cover_every_variant() {
        for kind in CLIENT_MESSAGE_TYPES {
            let decoded = ClientMessage::decode(&format!(r#"{{"type": "{kind}"}}"#));
            if let Ok(msg) = decoded {
                assert_eq!(msg.kind(), kind);
            }
        }
    }

    #[test]
    fn server_messages_are_tagged() {
        let json: Value = serde_json::from_str(&ServerMessage::error("boom").encode().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json["timestamp"].as_f64().is_some());

        let json: Value =
            serde_json::to_value(ServerMessage::motor_update(MotorName::PenElevation, MotorSnapshot {
                velocity_rpm: 5.0,
                direction: MotorDirection::Cw,
                last_update: 0.0,
                is_enabled: true,
            }))
            .unwrap();
        assert_eq!(json["type"], "motor_update");
        assert_eq!(json["motor_name"], "motor_pe");
        assert_eq!(json["state"]["direction"], "CW");
    }
}
