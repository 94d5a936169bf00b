//! Session model shared by the session manager and the client hub.
//!
//! # Lifecycle
//!
//! | From          | To                                   |
//! |---------------|--------------------------------------|
//! | Created       | Initializing, Stopping, Failed       |
//! | Initializing  | Active, Failed                       |
//! | Active        | Paused, Stopping, Failed             |
//! | Paused        | Active, Stopping, Failed             |
//! | Stopping      | Completed, Failed                    |
//! | Completed     | (terminal)                           |
//! | Failed        | (terminal)                           |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Where motor intent comes from during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Live external data drives a control loop.
    Blockchain,
    /// Clients drive motors directly.
    #[default]
    Manual,
    /// Pre-recorded playback.
    Offline,
    /// Mixed live and manual control.
    Hybrid,
}

impl SessionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blockchain => "blockchain",
            Self::Manual => "manual",
            Self::Offline => "offline",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether sessions in this mode own a control loop.
    pub const fn runs_control_loop(self) -> bool {
        matches!(self, Self::Blockchain)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Initializing,
    Active,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Whether the session has finished for good.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub const fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Initializing | Stopping | Failed)
                | (Initializing, Active | Failed)
                | (Active, Paused | Stopping | Failed)
                | (Paused, Active | Stopping | Failed)
                | (Stopping, Completed | Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal lifecycle move.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Counters collected over a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub planned_duration_minutes: Option<f64>,
    pub actual_duration_minutes: Option<f64>,
    pub epochs_completed: u64,
    pub commands_executed: u64,
    pub errors_encountered: u64,
}

/// One drawing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metrics: SessionMetrics,
    /// Hub clients that joined this session.
    #[serde(default)]
    pub participants: BTreeSet<String>,
}

impl Session {
    /// New CREATED session; `name` defaults to `{mode}_session_{YYYYmmdd_HHMMSS}`.
    pub fn new(
        mode: SessionMode,
        name: Option<String>,
        description: Option<String>,
        config: serde_json::Value,
    ) -> Self {
        let created_at = Utc::now();
        let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| {
            format!("{mode}_session_{}", created_at.format("%Y%m%d_%H%M%S"))
        });
        let planned = config
            .get("planned_duration_minutes")
            .and_then(serde_json::Value::as_f64);
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description: description.unwrap_or_default(),
            mode,
            status: SessionStatus::Created,
            created_at,
            started_at: None,
            ended_at: None,
            config,
            metrics: SessionMetrics {
                planned_duration_minutes: planned,
                ..SessionMetrics::default()
            },
            participants: BTreeSet::new(),
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Elapsed minutes between start and end (or `now` if still running).
    pub fn duration_minutes(&self, now: DateTime<Utc>) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        Some((end - start).num_milliseconds() as f64 / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn default_name_uses_mode_and_timestamp() {
        let s = Session::new(SessionMode::Blockchain, None, None, serde_json::Value::Null);
        assert!(s.name.starts_with("blockchain_session_"));
        assert_eq!(s.status, SessionStatus::Created);
    }

    #[test]
    fn planned_duration_is_read_from_config() {
        let s = Session::new(
            SessionMode::Manual,
            Some("a".into()),
            None,
            serde_json::json!({"planned_duration_minutes": 30.0}),
        );
        assert_eq!(s.metrics.planned_duration_minutes, Some(30.0));
    }

    #[test]
    fn lifecycle_rejects_skipping_states() {
        let mut s = Session::new(SessionMode::Manual, None, None, serde_json::Value::Null);
        assert!(s.transition(SessionStatus::Active).is_err());
        s.transition(SessionStatus::Initializing).unwrap();
        s.transition(SessionStatus::Active).unwrap();
        s.transition(SessionStatus::Paused).unwrap();
        s.transition(SessionStatus::Active).unwrap();
        s.transition(SessionStatus::Stopping).unwrap();
        s.transition(SessionStatus::Completed).unwrap();
        assert!(s.status.is_terminal());
        assert!(s.transition(SessionStatus::Active).is_err());
    }

    #[test]
    fn duration_is_computed_from_timestamps() {
        let mut s = Session::new(SessionMode::Manual, None, None, serde_json::Value::Null);
        assert_eq!(s.duration_minutes(Utc::now()), None);
        let start = Utc::now();
        s.started_at = Some(start);
        s.ended_at = Some(start + Duration::minutes(90));
        assert_eq!(s.duration_minutes(Utc::now()), Some(90.0));
    }

    #[test]
    fn status_uses_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Initializing).unwrap(),
            "\"initializing\""
        );
        assert_eq!(
            serde_json::from_str::<SessionMode>("\"hybrid\"").unwrap(),
            SessionMode::Hybrid
        );
    }
}
